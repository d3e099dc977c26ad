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

use std::time::Duration;

use accelq_common::CompletionReport;
use tracing::{Span, instrument};

use super::resume::ResumeTarget;
use super::{Stream, StreamCounters, StreamState};
use crate::capability::ReportClass;
use crate::config::FailurePolicy;
use crate::driver::{DriverError, WaitInfo};
use crate::error::{HardwareFault, QueueError, Result};
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::queue::{Deferred, SlotState, TaskFailure};

/// Result of applying one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Done,
    /// A fatal report for a live task
    Fatal(ResumeTarget),
    /// The report matched no live task
    Unmatched { fatal: bool },
}

impl Stream {
    /// Fetch and apply completion reports, blocking up to `wait` for the
    /// first one. Returns how many reports matched a task.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn drain(&self, wait: Duration) -> Result<usize> {
        match self.drain_for(None, wait) {
            Err(QueueError::ReportTimeout(_)) => Ok(0),
            r => r,
        }
    }

    /// Drain, reporting an empty poll as `ReportTimeout`.
    pub(crate) fn drain_for(&self, filter_pos: Option<u16>, wait: Duration) -> Result<usize> {
        let mut deferred = Deferred::default();
        let result = self.drain_into(filter_pos, wait, &mut deferred);
        deferred.run();
        result
    }

    /// Drain without blocking.
    pub(crate) fn poll_reports(&self) -> Result<usize> {
        let mut deferred = Deferred::default();
        let result = self.poll_reports_into(&mut deferred);
        deferred.run();
        result
    }

    pub(crate) fn poll_reports_into(&self, deferred: &mut Deferred) -> Result<usize> {
        match self.drain_into(None, Duration::ZERO, deferred) {
            Err(QueueError::ReportTimeout(_)) => Ok(0),
            r => r,
        }
    }

    fn drain_into(
        &self,
        filter_pos: Option<u16>,
        wait: Duration,
        deferred: &mut Deferred,
    ) -> Result<usize> {
        // held across poll and apply so concurrent drains keep delivery order
        let _serial = self.drain_lock.lock()?;
        let info = WaitInfo {
            queue_id: self.queue_id,
            filter_pos,
        };
        let max = self.config.get_max_reports_per_drain() as usize;
        let reports = match self.ctx.driver.poll_completions(&info, max, wait) {
            Ok(reports) => reports,
            Err(DriverError::WaitTimeout) => return Err(QueueError::ReportTimeout(wait)),
            Err(DriverError::DeviceAbort) => return Err(QueueError::DeviceAbort),
            Err(e) => return Err(e.into()),
        };
        if reports.is_empty() {
            return Ok(0);
        }
        let mut state = self.lock_state()?;
        self.apply_reports(&mut state, &reports, deferred)
    }

    /// Apply `reports` in delivery order, then resume the queue once for the
    /// last fatal one.
    pub(crate) fn apply_reports(
        &self,
        state: &mut StreamState,
        reports: &[CompletionReport],
        deferred: &mut Deferred,
    ) -> Result<usize> {
        let mut applied = 0;
        let mut last_fatal = None;
        for report in reports {
            if report.queue_id != self.queue_id {
                log::warn!(
                    "stream {} got a report for queue {}",
                    self.id,
                    report.queue_id
                );
                self.note_unmatched();
                continue;
            }
            match self.apply_report(state, report, deferred)? {
                Applied::Done => applied += 1,
                Applied::Fatal(target) => {
                    applied += 1;
                    last_fatal = Some((*report, Some(target)));
                }
                Applied::Unmatched { fatal: true } => last_fatal = Some((*report, None)),
                Applied::Unmatched { fatal: false } => {}
            }
        }

        if let Some((report, target)) = last_fatal {
            if let Err(e) = self.resume_after_error(state, &report, target) {
                if e.is_abort() {
                    return Err(e);
                }
                log::error!(
                    "stream {} cannot resume queue {} after pos {}: {e}",
                    self.id,
                    self.queue_id,
                    report.pos
                );
                state.failure_abort = true;
                return Err(QueueError::ResumeFailed {
                    pos: report.pos,
                    source: Box::new(e),
                });
            }
        }
        Ok(applied)
    }

    fn apply_report(
        &self,
        state: &mut StreamState,
        report: &CompletionReport,
        deferred: &mut Deferred,
    ) -> Result<Applied> {
        let table = self.config.get_error_code_table();
        let pos = report.pos;
        let Some(slot) = state.queue.lookup_mut(pos, report.kind) else {
            return Ok(self.unmatched(state, report));
        };

        if slot.state == SlotState::Failed {
            if report.kind.terminates_on_error() {
                // the device sends nothing more after this kind fails
                return Ok(self.unmatched(state, report));
            }
            slot.received = slot.received.saturating_add(1);
            log::debug!("late report for failed task at pos {pos} absorbed");
            return Ok(Applied::Done);
        }

        if report.is_error() {
            CounterMetric::cqe_error(report.error_code).emit();
        }
        match table.classify(report, slot.retry_count) {
            class @ (ReportClass::Success | ReportClass::Benign) => {
                if class == ReportClass::Benign {
                    log::warn!(
                        "stream {} pos {} {}: {} code {:#x} treated as a warning",
                        self.id,
                        pos,
                        report.kind,
                        report.error_bits.describe(),
                        report.error_code
                    );
                }
                slot.error_bits |= report.error_bits;
                slot.received = slot.received.saturating_add(1);
                if slot.received >= slot.expected.max(1) {
                    slot.state = SlotState::Complete;
                    slot.need_recv_cqe = false;
                    deferred.push_completion(slot.take_completion(pos, Ok(())));
                } else {
                    slot.state = SlotState::PartiallyComplete;
                }
                Ok(Applied::Done)
            }
            ReportClass::Retry => {
                slot.retry_count += 1;
                let span = slot.span;
                StreamCounters::bump(&self.counters.task_retries);
                log::warn!(
                    "stream {} pos {} {}: transient code {:#x}, sending the task again",
                    self.id,
                    pos,
                    report.kind,
                    report.error_code
                );
                let cells = state.queue.read_cells(pos, span);
                match self.send_with_retry(pos, span, &cells) {
                    Ok(()) => Ok(Applied::Done),
                    Err(e) if e.is_abort() => Err(e),
                    Err(e) => {
                        log::error!("stream {} resend of pos {pos} failed: {e}", self.id);
                        Ok(self.fail_task(state, report, deferred))
                    }
                }
            }
            ReportClass::Fatal => Ok(self.fail_task(state, report, deferred)),
        }
    }

    /// End the task at `report.pos` with a hardware failure. Outstanding
    /// reports are no longer awaited.
    fn fail_task(
        &self,
        state: &mut StreamState,
        report: &CompletionReport,
        deferred: &mut Deferred,
    ) -> Applied {
        let pos = report.pos;
        let Some(slot) = state.queue.lookup_mut(pos, report.kind) else {
            return self.unmatched(state, report);
        };
        slot.received = slot.received.saturating_add(1);
        slot.error_bits |= report.error_bits;
        slot.error_code = report.error_code;
        slot.state = SlotState::Failed;
        slot.need_recv_cqe = false;
        let fault = slot.fault(self.queue_id, pos);
        let target = ResumeTarget {
            pos,
            kind: slot.kind,
            span: slot.span,
        };
        deferred.push_completion(slot.take_completion(pos, Err(TaskFailure::Hardware(fault))));
        log::error!("stream {} task failed: {fault}", self.id);
        if !report.kind.is_sync_marker() {
            self.record_fault(state, fault);
        }
        Applied::Fatal(target)
    }

    fn unmatched(&self, state: &mut StreamState, report: &CompletionReport) -> Applied {
        self.note_unmatched();
        log::warn!(
            "stream {} report for {} at pos {} matches no live task",
            self.id,
            report.kind,
            report.pos
        );
        let table = self.config.get_error_code_table();
        if report.is_error() && !table.is_benign(report.kind, report.error_code) {
            CounterMetric::cqe_error(report.error_code).emit();
            self.record_fault(
                state,
                HardwareFault {
                    queue_id: self.queue_id,
                    pos: report.pos,
                    kind: report.kind,
                    bits: report.error_bits,
                    code: report.error_code,
                },
            );
            return Applied::Unmatched { fatal: true };
        }
        Applied::Unmatched { fatal: false }
    }

    fn note_unmatched(&self) {
        StreamCounters::bump(&self.counters.unmatched_reports);
        CounterMetric::unmatched_report().emit();
    }

    /// Remember a fatal failure for the next wait and, for inline streams
    /// that stop on failure, enter failure-abort.
    fn record_fault(&self, state: &mut StreamState, fault: HardwareFault) {
        state.pending_error = Some(fault);
        if !self.is_decoupled()
            && self.config.get_failure_policy() == FailurePolicy::StopOnFailure
            && !state.failure_abort
        {
            state.failure_abort = true;
            log::error!("stream {} stops scheduling after {fault}", self.id);
        }
    }
}
