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

use std::time::{Duration, Instant};

use tracing::{Span, instrument};

use super::recycle::ReclaimLimit;
use super::{Stream, StreamCounters, StreamState, TaskHandle};
use crate::device::TimeoutDiagnostic;
use crate::error::{HardwareFault, QueueError, Result};
use crate::metrics::{CounterMetric, EmittableMetric, HistogramMetric, ReclaimPath};
use crate::queue::{Deferred, SlotState};

/// Longest single blocking poll while waiting, which bounds how late a
/// device abort is noticed.
const ABORT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Where a submitted task stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Still on the device
    Pending,
    /// Finished, or already reclaimed
    Complete,
    /// Reported a fatal failure
    Failed(HardwareFault),
}

impl Stream {
    /// Block until the task behind `handle` has finished.
    ///
    /// Reports are drained on the calling thread while waiting. A fatal
    /// failure of the task, or an earlier one not yet reported, ends the
    /// wait with `FatalHardwareError`; no progress within `timeout` gives
    /// `ReportTimeout`.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn wait_for_completion(&self, handle: &TaskHandle, timeout: Duration) -> Result<()> {
        self.check_handle(handle)?;
        HistogramMetric::time_and_emit_wait(|| self.wait_until(handle, timeout))
    }

    /// Wait for the last task submitted to the stream.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn synchronize(&self, timeout: Duration) -> Result<()> {
        let last = self.lock_state()?.last_task;
        match last {
            Some(handle) => HistogramMetric::time_and_emit_wait(|| self.wait_until(&handle, timeout)),
            None => Ok(()),
        }
    }

    /// Status of a task, after fetching whatever reports are ready.
    pub fn query(&self, handle: &TaskHandle) -> Result<TaskStatus> {
        self.check_handle(handle)?;
        self.poll_reports()?;
        let state = self.lock_state()?;
        let queue = &state.queue;
        if !queue.in_window(handle.pos) || queue.slot(handle.pos).task_sn != handle.task_sn {
            return Ok(TaskStatus::Complete);
        }
        let slot = queue.slot(handle.pos);
        Ok(match slot.state {
            SlotState::Failed => TaskStatus::Failed(slot.fault(self.queue_id, handle.pos)),
            SlotState::Complete => TaskStatus::Complete,
            SlotState::Submitted if !slot.need_recv_cqe => {
                let hw_head = self.ctx.driver.get_consumer_pos(self.queue_id)?;
                if queue.is_retired(handle.pos, hw_head) {
                    TaskStatus::Complete
                } else {
                    TaskStatus::Pending
                }
            }
            _ => TaskStatus::Pending,
        })
    }

    fn check_handle(&self, handle: &TaskHandle) -> Result<()> {
        if handle.stream_id != self.id {
            return Err(QueueError::InvalidHandle(format!(
                "task of stream {} waited on stream {}",
                handle.stream_id, self.id
            )));
        }
        Ok(())
    }

    fn wait_until(&self, handle: &TaskHandle, timeout: Duration) -> Result<()> {
        // None when the timeout overflows the clock: wait without a deadline
        let deadline = Instant::now().checked_add(timeout);
        let drain_wait = self.config.get_drain_wait();
        let threshold = self.config.get_timeout_diagnostic_threshold();
        let mut timeouts = 0u32;
        let mut idle = Duration::ZERO;
        loop {
            self.check_abort()?;
            if self.poll_target(handle)? {
                return Ok(());
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                log::warn!(
                    "stream {} gave up on pos {} after {:?}",
                    self.id,
                    handle.pos,
                    timeout
                );
                return Err(QueueError::ReportTimeout(timeout));
            }
            let mut slice = drain_wait.min(ABORT_CHECK_INTERVAL);
            if let Some(d) = deadline {
                slice = slice.min(d.saturating_duration_since(now));
            }
            match self.drain_for(Some(handle.pos), slice) {
                Ok(_) => {
                    idle = Duration::ZERO;
                    timeouts = 0;
                }
                Err(QueueError::ReportTimeout(_)) => {
                    // one report timeout per drain_wait without a report
                    idle += now.elapsed();
                    if idle >= drain_wait {
                        idle = Duration::ZERO;
                        StreamCounters::bump(&self.counters.report_timeouts);
                        CounterMetric::report_timeout().emit();
                        timeouts += 1;
                        if timeouts >= threshold {
                            self.ctx.report_timeouts(&TimeoutDiagnostic {
                                device_id: self.ctx.id,
                                stream_id: self.id,
                                pos: handle.pos,
                                consecutive_timeouts: timeouts,
                            });
                            timeouts = 0;
                        }
                    }
                }
                Err(e) => return Err(e),
            }
            if !self.is_decoupled() {
                self.reclaim_after_drain()?;
            }
        }
    }

    /// Check the waited task under the stream lock. `true` once it is done.
    fn poll_target(&self, handle: &TaskHandle) -> Result<bool> {
        let mut state = self.lock_state()?;
        self.target_status(&mut state, handle)
    }

    fn target_status(&self, state: &mut StreamState, handle: &TaskHandle) -> Result<bool> {
        let pos = handle.pos;
        let live = state.queue.in_window(pos) && state.queue.slot(pos).task_sn == handle.task_sn;
        if live && state.queue.slot(pos).state == SlotState::Failed {
            let fault = state.queue.slot(pos).fault(self.queue_id, pos);
            if state.pending_error.is_some_and(|p| p.pos == pos) {
                state.pending_error = None;
            }
            return Err(QueueError::FatalHardwareError(fault));
        }
        if let Some(fault) = state.pending_error.take() {
            return Err(QueueError::FatalHardwareError(fault));
        }
        if state.failure_abort {
            return Err(QueueError::FailureAbort(self.id));
        }
        if !live {
            return Ok(true);
        }
        let slot = state.queue.slot(pos);
        match slot.state {
            SlotState::Complete => Ok(true),
            SlotState::Submitted if !slot.need_recv_cqe => {
                let hw_head = self.ctx.driver.get_consumer_pos(self.queue_id)?;
                Ok(state.queue.is_retired(pos, hw_head))
            }
            _ => Ok(false),
        }
    }

    fn reclaim_after_drain(&self) -> Result<()> {
        let mut deferred = Deferred::default();
        let result = {
            let mut state = self.lock_state()?;
            self.reclaim_locked(
                &mut state,
                ReclaimLimit::Limited,
                ReclaimPath::Inline,
                &mut deferred,
            )
        };
        deferred.run();
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_abort() => Err(e),
            Err(e) => {
                log::debug!("stream {} reclaim while waiting failed: {e}", self.id);
                Ok(())
            }
        }
    }
}
