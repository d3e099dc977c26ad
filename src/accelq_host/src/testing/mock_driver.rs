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

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use accelq_common::{
    CompletionReport, CqeErrorBits, DescFlags, DescriptorHeader, QueueId, RingGeometry, TaskKind,
};

use crate::driver::{DriverError, QueueDriver, SendBatch, WaitInfo};

/// Base device address handed out for queue 0; each queue gets its own
/// 16 MiB window above it.
const BASE_ADDR: u64 = 0x1000_0000;
const QUEUE_WINDOW: u64 = 0x100_0000;

/// A copy of one doorbell the driver accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentBatch {
    pub pos: u16,
    pub cell_count: u16,
    pub addr: u64,
    pub cells: Vec<u8>,
}

#[derive(Debug)]
struct MockQueue {
    ring: RingGeometry,
    cell_size: usize,
    consumer: u16,
    producer: u16,
    enabled: bool,
    enabled_polls: u32,
    head_writes: Vec<u16>,
    sent: Vec<SentBatch>,
    reports: VecDeque<CompletionReport>,
}

#[derive(Debug, Default)]
struct MockState {
    queues: HashMap<QueueId, MockQueue>,
    busy_sends: u32,
    send_failure: Option<DriverError>,
    aborted: bool,
    auto_complete: bool,
}

/// An in-memory device.
///
/// Every queue has a consumer pointer the test moves by hand, an enabled
/// flag and a scripted report queue. Sends are recorded. With auto
/// completion on, the device consumes every batch as it is sent and posts
/// a success report for each cell flagged for one.
#[derive(Debug, Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
    reports_ready: Condvar,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // a test thread that panicked with the lock held already failed
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_queue<T>(&self, queue: QueueId, f: impl FnOnce(&mut MockQueue) -> T) -> Option<T> {
        let mut state = self.lock();
        let q = state.queues.get_mut(&queue)?;
        let out = f(q);
        drop(state);
        self.reports_ready.notify_all();
        Some(out)
    }

    pub fn set_auto_complete(&self, on: bool) {
        self.lock().auto_complete = on;
    }

    /// Advance the consumer pointer by `cells`.
    pub fn retire(&self, queue: QueueId, cells: u32) {
        self.with_queue(queue, |q| q.consumer = q.ring.add(q.consumer, cells));
    }

    pub fn retire_to(&self, queue: QueueId, pos: u16) {
        self.with_queue(queue, |q| q.consumer = pos);
    }

    /// Consume everything sent so far.
    pub fn retire_all(&self, queue: QueueId) {
        self.with_queue(queue, |q| q.consumer = q.producer);
    }

    /// Post a success report for the task at `pos`.
    pub fn complete(&self, queue: QueueId, pos: u16, kind: TaskKind) {
        self.push_report(CompletionReport::success(queue, pos, kind));
    }

    /// Stop the queue at `pos` and post a failure report for it, the way
    /// the device does on a fatal error.
    pub fn fail(&self, queue: QueueId, pos: u16, kind: TaskKind, bits: CqeErrorBits, code: u32) {
        self.with_queue(queue, |q| {
            q.consumer = pos;
            q.enabled = false;
            q.reports
                .push_back(CompletionReport::failed(queue, pos, kind, bits, code));
        });
    }

    /// Queue a report as is, for the queue it names.
    pub fn push_report(&self, report: CompletionReport) {
        self.with_queue(report.queue_id, |q| q.reports.push_back(report));
    }

    /// Fail the next `sends` sends with `NoResources`.
    pub fn set_busy(&self, sends: u32) {
        self.lock().busy_sends = sends;
    }

    /// Fail every send with `error` until cleared.
    pub fn fail_sends(&self, error: Option<DriverError>) {
        self.lock().send_failure = error;
    }

    pub fn set_enabled(&self, queue: QueueId, enabled: bool) {
        self.with_queue(queue, |q| q.enabled = enabled);
    }

    /// Abort the device: every call fails with `DeviceAbort` from now on.
    pub fn abort(&self) {
        self.lock().aborted = true;
        self.reports_ready.notify_all();
    }

    pub fn consumer(&self, queue: QueueId) -> Option<u16> {
        self.with_queue(queue, |q| q.consumer)
    }

    pub fn producer(&self, queue: QueueId) -> Option<u16> {
        self.with_queue(queue, |q| q.producer)
    }

    pub fn is_enabled(&self, queue: QueueId) -> bool {
        self.with_queue(queue, |q| q.enabled).unwrap_or(false)
    }

    /// Times the enabled flag of `queue` was read.
    pub fn enabled_polls(&self, queue: QueueId) -> u32 {
        self.with_queue(queue, |q| q.enabled_polls).unwrap_or(0)
    }

    /// Every value the runtime wrote to the consumer pointer.
    pub fn head_writes(&self, queue: QueueId) -> Vec<u16> {
        self.with_queue(queue, |q| q.head_writes.clone())
            .unwrap_or_default()
    }

    pub fn sent(&self, queue: QueueId) -> Vec<SentBatch> {
        self.with_queue(queue, |q| q.sent.clone()).unwrap_or_default()
    }

    pub fn send_count(&self, queue: QueueId) -> usize {
        self.with_queue(queue, |q| q.sent.len()).unwrap_or(0)
    }

    pub fn is_open(&self, queue: QueueId) -> bool {
        self.lock().queues.contains_key(&queue)
    }
}

/// Success reports for every cell of `batch` flagged for one.
fn auto_reports(queue: QueueId, cell_size: usize, batch: &SendBatch<'_>) -> Vec<CompletionReport> {
    batch
        .cells
        .chunks_exact(cell_size)
        .filter_map(|cell| {
            let header: DescriptorHeader =
                bytemuck::pod_read_unaligned(cell.get(..DescriptorHeader::SIZE)?);
            if !header.flags.contains(DescFlags::REPORT) {
                return None;
            }
            Some(CompletionReport::success(queue, header.pos, header.task_kind()?))
        })
        .collect()
}

impl QueueDriver for MockDriver {
    fn get_consumer_pos(&self, queue: QueueId) -> Result<u16, DriverError> {
        let mut state = self.lock();
        if state.aborted {
            return Err(DriverError::DeviceAbort);
        }
        let q = state
            .queues
            .get_mut(&queue)
            .ok_or(DriverError::UnknownQueue(queue))?;
        Ok(q.consumer)
    }

    fn set_consumer_pos(&self, queue: QueueId, pos: u16) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.aborted {
            return Err(DriverError::DeviceAbort);
        }
        let q = state
            .queues
            .get_mut(&queue)
            .ok_or(DriverError::UnknownQueue(queue))?;
        if q.enabled {
            // the consumer pointer only moves on a stopped queue
            return Err(DriverError::Status(-16));
        }
        if q.ring.check(pos).is_err() {
            return Err(DriverError::Status(-22));
        }
        q.consumer = pos;
        q.head_writes.push(pos);
        Ok(())
    }

    fn set_queue_enabled(&self, queue: QueueId, enabled: bool) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.aborted {
            return Err(DriverError::DeviceAbort);
        }
        let q = state
            .queues
            .get_mut(&queue)
            .ok_or(DriverError::UnknownQueue(queue))?;
        q.enabled = enabled;
        Ok(())
    }

    fn get_queue_enabled(&self, queue: QueueId) -> Result<bool, DriverError> {
        let mut state = self.lock();
        if state.aborted {
            return Err(DriverError::DeviceAbort);
        }
        let q = state
            .queues
            .get_mut(&queue)
            .ok_or(DriverError::UnknownQueue(queue))?;
        q.enabled_polls += 1;
        Ok(q.enabled)
    }

    fn send_descriptor(&self, queue: QueueId, batch: &SendBatch<'_>) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.aborted {
            return Err(DriverError::DeviceAbort);
        }
        if state.busy_sends > 0 {
            state.busy_sends -= 1;
            return Err(DriverError::NoResources);
        }
        if let Some(e) = state.send_failure {
            return Err(e);
        }
        let auto_complete = state.auto_complete;
        let q = state
            .queues
            .get_mut(&queue)
            .ok_or(DriverError::UnknownQueue(queue))?;
        q.sent.push(SentBatch {
            pos: batch.pos,
            cell_count: batch.cell_count,
            addr: batch.addr,
            cells: batch.cells.to_vec(),
        });
        // a resend of an earlier task leaves the producer where it is
        if batch.pos == q.producer {
            q.producer = q.ring.add(batch.pos, batch.cell_count as u32);
        }
        if auto_complete {
            q.consumer = q.producer;
            let reports = auto_reports(queue, q.cell_size, batch);
            q.reports.extend(reports);
            drop(state);
            self.reports_ready.notify_all();
        }
        Ok(())
    }

    fn poll_completions(
        &self,
        wait: &WaitInfo,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<CompletionReport>, DriverError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            if state.aborted {
                return Err(DriverError::DeviceAbort);
            }
            let q = state
                .queues
                .get_mut(&wait.queue_id)
                .ok_or(DriverError::UnknownQueue(wait.queue_id))?;
            if !q.reports.is_empty() {
                let n = q.reports.len().min(max.max(1));
                return Ok(q.reports.drain(..n).collect());
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DriverError::WaitTimeout);
                    }
                    self.reports_ready
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0)
                }
                None => self
                    .reports_ready
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner()),
            };
        }
    }

    fn open_queue(&self, queue: QueueId, depth: u32, cell_size: u32) -> Result<u64, DriverError> {
        let ring = RingGeometry::new(depth).map_err(|_| DriverError::Status(-22))?;
        let mut state = self.lock();
        state.queues.insert(
            queue,
            MockQueue {
                ring,
                cell_size: cell_size as usize,
                consumer: 0,
                producer: 0,
                enabled: true,
                enabled_polls: 0,
                head_writes: Vec::new(),
                sent: Vec::new(),
                reports: VecDeque::new(),
            },
        );
        Ok(BASE_ADDR + queue as u64 * QUEUE_WINDOW)
    }

    fn close_queue(&self, queue: QueueId) -> Result<(), DriverError> {
        self.lock().queues.remove(&queue);
        Ok(())
    }
}
