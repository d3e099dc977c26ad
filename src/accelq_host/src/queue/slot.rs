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

use std::fmt;

use accelq_common::{CqeErrorBits, QueueId, TaskKind};
use smallvec::SmallVec;

use crate::error::HardwareFault;

/// Lifecycle of one ring position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Allocated, descriptors not yet accepted by the driver
    Pending,
    /// Sent, no report applied yet
    Submitted,
    /// Some but not all expected reports arrived
    PartiallyComplete,
    Complete,
    /// A fatal report ended the task, it waits for reclaim
    Failed,
    /// Continuation cell of the multi-cell task starting at `head`
    Covered { head: u16 },
}

impl SlotState {
    /// Whether the task needs nothing more from the device.
    pub fn is_terminal(self) -> bool {
        matches!(self, SlotState::Complete | SlotState::Failed)
    }
}

/// Something a task borrows until its slot is reclaimed: argument buffers,
/// temporary device memory, references on sync ids.
///
/// `release` runs exactly once, on whichever path reclaims the slot, and
/// never under the stream lock.
pub trait SlotResource: Send {
    fn release(self: Box<Self>);
}

/// Why a task did not complete successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFailure {
    /// The device posted a fatal report for it
    Hardware(HardwareFault),
    /// It was dropped by a forced reclaim before finishing
    Aborted,
}

/// Passed to a task's completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOutcome {
    pub pos: u16,
    pub task_sn: u64,
    pub kind: TaskKind,
    pub result: Result<(), TaskFailure>,
}

/// Runs once when a task completes, fails or is aborted.
pub type CompletionCallback = Box<dyn FnOnce(&TaskOutcome) + Send>;

pub(crate) struct TaskSlot {
    pub(crate) state: SlotState,
    pub(crate) kind: TaskKind,
    /// Cells occupied, valid on the first cell of a task
    pub(crate) span: u16,
    pub(crate) expected: u16,
    pub(crate) received: u16,
    /// Reclaim must not pass this slot before its reports arrived
    pub(crate) need_recv_cqe: bool,
    pub(crate) error_bits: CqeErrorBits,
    pub(crate) error_code: u32,
    pub(crate) retry_count: u8,
    pub(crate) task_sn: u64,
    pub(crate) resources: SmallVec<[Box<dyn SlotResource>; 2]>,
    pub(crate) callback: Option<CompletionCallback>,
}

impl TaskSlot {
    pub(crate) fn free() -> Self {
        Self {
            state: SlotState::Free,
            kind: TaskKind::Barrier,
            span: 0,
            expected: 0,
            received: 0,
            need_recv_cqe: false,
            error_bits: CqeErrorBits::empty(),
            error_code: 0,
            retry_count: 0,
            task_sn: 0,
            resources: SmallVec::new(),
            callback: None,
        }
    }

    pub(crate) fn pending(kind: TaskKind, span: u16, expected: u16, task_sn: u64) -> Self {
        Self {
            state: SlotState::Pending,
            kind,
            span,
            expected,
            need_recv_cqe: expected > 0,
            task_sn,
            ..Self::free()
        }
    }

    pub(crate) fn fault(&self, queue_id: QueueId, pos: u16) -> HardwareFault {
        HardwareFault {
            queue_id,
            pos,
            kind: self.kind,
            bits: self.error_bits,
            code: self.error_code,
        }
    }

    /// Take the callback, paired with the outcome it must be called with.
    pub(crate) fn take_completion(
        &mut self,
        pos: u16,
        result: Result<(), TaskFailure>,
    ) -> Option<(CompletionCallback, TaskOutcome)> {
        let callback = self.callback.take()?;
        Some((
            callback,
            TaskOutcome {
                pos,
                task_sn: self.task_sn,
                kind: self.kind,
                result,
            },
        ))
    }
}

impl fmt::Debug for TaskSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSlot")
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("span", &self.span)
            .field("expected", &self.expected)
            .field("received", &self.received)
            .field("need_recv_cqe", &self.need_recv_cqe)
            .field("error_bits", &self.error_bits)
            .field("error_code", &self.error_code)
            .field("retry_count", &self.retry_count)
            .field("task_sn", &self.task_sn)
            .field("resources", &self.resources.len())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Callbacks and resources collected under the stream lock, run once the
/// lock is dropped.
#[derive(Default)]
pub(crate) struct Deferred {
    callbacks: Vec<(CompletionCallback, TaskOutcome)>,
    resources: Vec<Box<dyn SlotResource>>,
}

impl Deferred {
    pub(crate) fn push_completion(&mut self, completion: Option<(CompletionCallback, TaskOutcome)>) {
        if let Some(c) = completion {
            self.callbacks.push(c);
        }
    }

    pub(crate) fn push_resources(&mut self, resources: impl IntoIterator<Item = Box<dyn SlotResource>>) {
        self.resources.extend(resources);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.callbacks.is_empty() && self.resources.is_empty()
    }

    /// Callbacks first, then resource release.
    pub(crate) fn run(self) {
        for (callback, outcome) in self.callbacks {
            callback(&outcome);
        }
        for resource in self.resources {
            resource.release();
        }
    }
}
