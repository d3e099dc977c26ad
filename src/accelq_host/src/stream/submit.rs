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

use std::thread;
use std::time::{Duration, Instant};

use tracing::{Span, instrument};

use super::recycle::ReclaimLimit;
use super::{Stream, StreamCounters, StreamState, TaskHandle};
use crate::config::FailurePolicy;
use crate::driver::{DriverError, SendBatch};
use crate::encoder::{EncodeContext, TaskPayload};
use crate::error::{QueueError, Result};
use crate::metrics::{CounterMetric, EmittableMetric, ReclaimPath};
use crate::queue::{CompletionCallback, Deferred, SlotResource};

/// Pause between sends the driver had no resources for.
const SEND_RETRY_INTERVAL: Duration = Duration::from_micros(100);
/// Pause between attempts to find ring space.
const ROOM_RETRY_INTERVAL: Duration = Duration::from_micros(200);
/// How often a stalled submission logs the ring state.
const STALL_REPORT_INTERVAL: Duration = Duration::from_secs(1);
/// Stall reports logged per submission at most.
const MAX_STALL_REPORTS: u32 = 3;

/// Releases the resources of a task that never made it into the ring.
struct ResourceGuard(Option<Vec<Box<dyn SlotResource>>>);

impl ResourceGuard {
    fn take(&mut self) -> Vec<Box<dyn SlotResource>> {
        self.0.take().unwrap_or_default()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        for resource in self.0.take().into_iter().flatten() {
            resource.release();
        }
    }
}

/// Rate limited diagnostics for a submission waiting on a full ring.
struct StallMonitor {
    reports: u32,
    last: Instant,
}

impl StallMonitor {
    fn new() -> Self {
        Self {
            reports: 0,
            last: Instant::now(),
        }
    }

    fn check(&mut self, stream: &Stream, started: Instant) {
        if self.reports >= MAX_STALL_REPORTS || self.last.elapsed() < STALL_REPORT_INTERVAL {
            return;
        }
        self.reports += 1;
        self.last = Instant::now();
        let (head, tail) = stream.head_tail();
        let hw_head = stream.ctx.driver.get_consumer_pos(stream.queue_id);
        log::warn!(
            "stream {} queue {} full for {:?}: head {} tail {} hw head {:?} in flight {} stats {:?}",
            stream.id,
            stream.queue_id,
            started.elapsed(),
            head,
            tail,
            hw_head,
            stream.mirror.in_flight(),
            stream.stats()
        );
    }
}

impl Stream {
    /// Submit a task. See [`Stream::submit_with`].
    pub fn submit(&self, payload: TaskPayload) -> Result<TaskHandle> {
        self.submit_with(payload, Vec::new(), None)
    }

    /// Encode `payload` into the ring and hand it to the driver.
    ///
    /// `resources` stay attached to the task until its slot is reclaimed;
    /// if the submission fails they are released before this returns.
    /// `callback` runs once when the task completes, fails or is aborted.
    ///
    /// Waits up to `allocation_timeout` for ring space, reclaiming inline or
    /// waking the recycle worker in the meantime.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn submit_with(
        &self,
        payload: TaskPayload,
        resources: Vec<Box<dyn SlotResource>>,
        callback: Option<CompletionCallback>,
    ) -> Result<TaskHandle> {
        let mut guard = ResourceGuard(Some(resources));
        let encoder = self.ctx.encoders.get(payload.kind)?;
        let span = encoder.span_length(&payload);
        let expected = encoder.expected_completion_count(&payload);
        let depth = self.config.get_depth();
        if span == 0 || span as u32 > depth {
            return Err(QueueError::InvalidSpan(span as u32, depth));
        }
        let cell_size = self.config.get_cell_size() as usize;
        let mut staged = vec![0u8; span as usize * cell_size];

        let started = Instant::now();
        let mut stall = StallMonitor::new();
        let mut counted_full = false;
        let mut callback = callback;
        loop {
            self.check_abort()?;
            let mut state = self.lock_state()?;
            if state.failure_abort {
                return Err(QueueError::FailureAbort(self.id));
            }
            let task_sn = self.ctx.next_task_sn();
            let pos = match state.queue.allocate(payload.kind, span, expected, task_sn) {
                Ok(pos) => pos,
                Err(QueueError::QueueFull(queue_id)) => {
                    drop(state);
                    if !counted_full {
                        counted_full = true;
                        StreamCounters::bump(&self.counters.queue_full);
                        CounterMetric::queue_full().emit();
                    }
                    if started.elapsed() >= self.config.get_allocation_timeout() {
                        log::warn!("stream {} gave up waiting for ring space", self.id);
                        return Err(QueueError::QueueFull(queue_id));
                    }
                    stall.check(self, started);
                    self.make_room()?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let ctx = EncodeContext {
                queue_id: self.queue_id,
                pos,
                task_sn,
                cell_size,
            };
            if let Err(e) = encoder.encode(&payload, &ctx, &mut staged) {
                state.queue.rollback(pos)?;
                return Err(e);
            }
            state.queue.write_cells(pos, &staged);
            if let Err(e) = self.send_with_retry(pos, span, &staged) {
                state.queue.rollback(pos)?;
                self.note_send_failure(&mut state, &e);
                return Err(e);
            }
            state.queue.commit(pos, guard.take(), callback.take());
            StreamCounters::bump(&self.counters.submitted);

            let handle = TaskHandle {
                stream_id: self.id,
                pos,
                task_sn,
            };
            state.last_task = Some(handle);
            state.since_recycle += 1;
            let recycle_due = state.since_recycle >= self.config.get_recycle_interval();
            if recycle_due {
                state.since_recycle = 0;
            }

            if recycle_due && self.is_decoupled() {
                drop(state);
                self.ctx.wake_recycle();
            } else if recycle_due {
                let mut deferred = Deferred::default();
                let reclaimed = self.reclaim_locked(
                    &mut state,
                    ReclaimLimit::Limited,
                    ReclaimPath::Inline,
                    &mut deferred,
                );
                drop(state);
                deferred.run();
                if let Err(e) = reclaimed {
                    log::debug!("stream {} periodic reclaim failed: {e}", self.id);
                }
            }
            return Ok(handle);
        }
    }

    /// Send cells to the driver, retrying while it has no resources for up
    /// to `send_retry_timeout`.
    pub(crate) fn send_with_retry(&self, pos: u16, span: u16, cells: &[u8]) -> Result<()> {
        let batch = SendBatch {
            pos,
            cell_count: span,
            addr: self.cell_addr(pos, self.config.get_cell_size() as usize),
            cells,
        };
        let timeout = self.config.get_send_retry_timeout();
        let started = Instant::now();
        loop {
            match self.ctx.driver.send_descriptor(self.queue_id, &batch) {
                Ok(()) => return Ok(()),
                Err(DriverError::NoResources) => {
                    self.check_abort()?;
                    if started.elapsed() >= timeout {
                        log::warn!(
                            "stream {} driver had no resources for pos {} for {:?}",
                            self.id,
                            pos,
                            timeout
                        );
                        return Err(QueueError::TransientSendBusy(timeout));
                    }
                    StreamCounters::bump(&self.counters.send_retries);
                    thread::sleep(SEND_RETRY_INTERVAL);
                }
                Err(DriverError::DeviceAbort) => return Err(QueueError::DeviceAbort),
                Err(e) => {
                    log::error!("stream {} send of pos {} failed: {e}", self.id, pos);
                    return Err(e.into());
                }
            }
        }
    }

    /// A send the driver will never accept stops a stream that stops on
    /// failure.
    fn note_send_failure(&self, state: &mut StreamState, err: &QueueError) {
        if err.is_fatal()
            && !err.is_abort()
            && !self.is_decoupled()
            && self.config.get_failure_policy() == FailurePolicy::StopOnFailure
        {
            state.failure_abort = true;
            log::error!("stream {} stops scheduling after send failure: {err}", self.id);
        }
    }

    /// Free ring space for a blocked submission.
    fn make_room(&self) -> Result<()> {
        if self.is_decoupled() {
            self.ctx.wake_recycle();
            thread::sleep(ROOM_RETRY_INTERVAL);
            return Ok(());
        }
        let mut deferred = Deferred::default();
        let drained = self.poll_reports_into(&mut deferred);
        let reclaimed = match self.lock_state() {
            Ok(mut state) => self.reclaim_locked(
                &mut state,
                ReclaimLimit::Limited,
                ReclaimPath::Inline,
                &mut deferred,
            ),
            Err(e) => Err(e),
        };
        deferred.run();
        drained?;
        if reclaimed? == 0 {
            thread::sleep(ROOM_RETRY_INTERVAL);
        }
        Ok(())
    }
}
