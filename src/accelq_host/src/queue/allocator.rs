/*
Copyright 2025 The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use accelq_common::{QueueId, RingGeometry, TaskKind};
use smallvec::SmallVec;

use super::cell::CellArena;
use super::slot::{CompletionCallback, SlotResource, SlotState, TaskSlot};
use crate::error::{QueueError, Result};
use crate::new_error;

/// Lock free copy of the ring pointers, refreshed on every change.
#[derive(Debug, Default)]
pub(crate) struct RingMirror {
    head: AtomicU32,
    tail: AtomicU32,
    in_flight: AtomicU32,
}

impl RingMirror {
    /// `(head, tail)`
    pub(crate) fn head_tail(&self) -> (u16, u16) {
        (
            self.head.load(Ordering::Acquire) as u16,
            self.tail.load(Ordering::Acquire) as u16,
        )
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Slots and cells of one ring, plus the producer (`tail`) and reclaim
/// (`head`) pointers.
///
/// Occupancy is tracked as an explicit cell count, so a full ring with
/// `head == tail` is distinguishable from an empty one.
#[derive(Debug)]
pub(crate) struct SlotQueue {
    queue_id: QueueId,
    ring: RingGeometry,
    slots: Vec<TaskSlot>,
    cells: CellArena,
    head: u16,
    tail: u16,
    in_flight: u32,
    mirror: Arc<RingMirror>,
}

impl SlotQueue {
    pub(crate) fn new(queue_id: QueueId, depth: u32, cell_size: u32) -> Result<Self> {
        let ring = RingGeometry::new(depth)?;
        Ok(Self {
            queue_id,
            ring,
            slots: (0..depth).map(|_| TaskSlot::free()).collect(),
            cells: CellArena::new(depth, cell_size),
            head: 0,
            tail: 0,
            in_flight: 0,
            mirror: Arc::new(RingMirror::default()),
        })
    }

    pub(crate) fn mirror(&self) -> Arc<RingMirror> {
        self.mirror.clone()
    }

    fn publish(&self) {
        self.mirror.head.store(self.head as u32, Ordering::Release);
        self.mirror.tail.store(self.tail as u32, Ordering::Release);
        self.mirror.in_flight.store(self.in_flight, Ordering::Release);
    }

    pub(crate) fn ring(&self) -> RingGeometry {
        self.ring
    }

    pub(crate) fn head(&self) -> u16 {
        self.head
    }

    pub(crate) fn tail(&self) -> u16 {
        self.tail
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.in_flight
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.in_flight == 0
    }

    /// Reserve `span` contiguous cells at `tail` for a task.
    pub(crate) fn allocate(
        &mut self,
        kind: TaskKind,
        span: u16,
        expected: u16,
        task_sn: u64,
    ) -> Result<u16> {
        let depth = self.ring.depth();
        if span == 0 || span as u32 > depth {
            return Err(QueueError::InvalidSpan(span as u32, depth));
        }
        if self.in_flight + span as u32 > depth {
            return Err(QueueError::QueueFull(self.queue_id));
        }
        let pos = self.tail;
        self.slots[pos as usize] = TaskSlot::pending(kind, span, expected, task_sn);
        for i in 1..span as u32 {
            let cell = self.ring.add(pos, i) as usize;
            self.slots[cell] = TaskSlot {
                state: SlotState::Covered { head: pos },
                ..TaskSlot::free()
            };
        }
        self.tail = self.ring.add(pos, span as u32);
        self.in_flight += span as u32;
        self.publish();
        Ok(pos)
    }

    /// Undo the most recent allocation, which must start at `pos`.
    pub(crate) fn rollback(&mut self, pos: u16) -> Result<()> {
        let span = self.slots[pos as usize].span;
        if self.slots[pos as usize].state != SlotState::Pending
            || self.ring.add(pos, span as u32) != self.tail
        {
            return Err(new_error!(
                "rollback of pos {} is not the latest allocation (tail {})",
                pos,
                self.tail
            ));
        }
        for i in 0..span as u32 {
            self.slots[self.ring.add(pos, i) as usize] = TaskSlot::free();
        }
        self.tail = pos;
        self.in_flight -= span as u32;
        self.publish();
        Ok(())
    }

    /// Mark the pending task at `pos` as sent and attach what it owns.
    pub(crate) fn commit(
        &mut self,
        pos: u16,
        resources: Vec<Box<dyn SlotResource>>,
        callback: Option<CompletionCallback>,
    ) {
        let slot = &mut self.slots[pos as usize];
        slot.state = SlotState::Submitted;
        slot.resources = SmallVec::from_vec(resources);
        slot.callback = callback;
    }

    pub(crate) fn write_cells(&mut self, pos: u16, cells: &[u8]) {
        self.cells.write(pos, cells);
    }

    pub(crate) fn read_cells(&self, pos: u16, count: u16) -> Vec<u8> {
        self.cells.read(pos, count)
    }

    pub(crate) fn slot(&self, pos: u16) -> &TaskSlot {
        &self.slots[pos as usize % self.slots.len()]
    }

    /// Whether `pos` lies between `head` and `tail`.
    pub(crate) fn in_window(&self, pos: u16) -> bool {
        if self.in_flight == 0 {
            false
        } else if self.in_flight == self.ring.depth() {
            (pos as u32) < self.ring.depth()
        } else {
            self.ring.in_window(pos, self.head, self.tail)
        }
    }

    /// The in-flight task starting at `pos`, if its kind is `kind`.
    ///
    /// Free cells, continuation cells and kind mismatches give `None`.
    pub(crate) fn lookup_mut(&mut self, pos: u16, kind: TaskKind) -> Option<&mut TaskSlot> {
        if !self.in_window(pos) {
            return None;
        }
        let slot = &mut self.slots[pos as usize];
        match slot.state {
            SlotState::Free | SlotState::Covered { .. } | SlotState::Pending => None,
            _ if slot.kind != kind => None,
            _ => Some(slot),
        }
    }

    /// Number of cells past `head` the hardware has consumed, given its
    /// consumer pointer `hw_head`.
    ///
    /// A full ring with `hw_head == head` counts as nothing consumed, unless
    /// the head task has already finished through its reports.
    pub(crate) fn retired_cells(&self, hw_head: u16) -> u32 {
        if self.in_flight == 0 || (hw_head as u32) >= self.ring.depth() {
            return 0;
        }
        let d = self.ring.distance(self.head, hw_head);
        if d == 0 {
            if self.in_flight == self.ring.depth() && self.slot(self.head).state.is_terminal() {
                return self.in_flight;
            }
            return 0;
        }
        if d > self.in_flight {
            // consumer pointer outside the window, nothing we sent
            return 0;
        }
        d
    }

    /// Whether the task at `pos` lies entirely before `hw_head`.
    pub(crate) fn is_retired(&self, pos: u16, hw_head: u16) -> bool {
        if !self.in_window(pos) {
            return false;
        }
        let span = self.slot(pos).span.max(1) as u32;
        self.ring.distance(self.head, pos) + span <= self.retired_cells(hw_head)
    }

    /// Remove the task at `head` and advance past its span.
    pub(crate) fn release_head(&mut self) -> Result<TaskSlot> {
        if self.in_flight == 0 {
            return Err(new_error!("release on an empty ring"));
        }
        let pos = self.head;
        let span = self.slots[pos as usize].span as u32;
        if span == 0 || span > self.in_flight {
            return Err(new_error!("corrupt slot at head {}: span {}", pos, span));
        }
        let slot = std::mem::replace(&mut self.slots[pos as usize], TaskSlot::free());
        for i in 1..span {
            self.slots[self.ring.add(pos, i) as usize] = TaskSlot::free();
        }
        self.head = self.ring.add(pos, span);
        self.in_flight -= span;
        self.publish();
        Ok(slot)
    }
}

impl Drop for SlotQueue {
    fn drop(&mut self) {
        // a ring torn down with tasks in flight still hands back what they hold
        for slot in self.slots.iter_mut() {
            for resource in slot.resources.drain(..) {
                resource.release();
            }
        }
    }
}
