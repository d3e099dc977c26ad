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

use accelq_common::{CompletionReport, TaskKind};

use super::{Stream, StreamCounters, StreamState};
use crate::encoder::ResumeSkip;
use crate::error::{QueueError, Result};
use crate::metrics::{CounterMetric, EmittableMetric};

/// How often the queue enabled flag is read while waiting for the
/// hardware to stop a queue.
const DISABLE_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// The task whose fatal report stopped the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResumeTarget {
    pub(crate) pos: u16,
    pub(crate) kind: TaskKind,
    pub(crate) span: u16,
}

impl Stream {
    /// Restart the hardware queue after a fatal report: wait until the
    /// device has stopped it, move its head past the failed task and, unless
    /// the stream is in failure-abort, enable it again.
    ///
    /// `target` is `None` when the report matched no live task, the queue
    /// then skips a single cell. Returns the new hardware head, or `None`
    /// when the report carried no error.
    pub(crate) fn resume_after_error(
        &self,
        state: &StreamState,
        report: &CompletionReport,
        target: Option<ResumeTarget>,
    ) -> Result<Option<u16>> {
        if !report.is_error() {
            return Ok(None);
        }
        self.wait_queue_disabled()?;

        let ring = state.queue.ring();
        let skip = match target {
            Some(t) => self.ctx.encoders.resume_skip(t.kind),
            None => ResumeSkip::Cells(1),
        };
        let span = target.map_or(1, |t| t.span);
        let new_head = match skip {
            ResumeSkip::Cells(n) => ring.add(report.pos, n as u32),
            ResumeSkip::Span => ring.add(report.pos, span as u32),
            // the device took the whole batch, count from what the host still holds
            ResumeSkip::FromAllocatorHead => ring.add(state.queue.head(), span as u32),
        };

        self.check_abort()?;
        let driver = &self.ctx.driver;
        driver.set_consumer_pos(self.queue_id, new_head)?;
        if state.failure_abort {
            log::error!(
                "stream {} queue {} left stopped at {} after failure",
                self.id,
                self.queue_id,
                new_head
            );
            return Ok(Some(new_head));
        }
        driver.set_queue_enabled(self.queue_id, true)?;
        StreamCounters::bump(&self.counters.resumes);
        CounterMetric::queue_resume().emit();
        log::warn!(
            "stream {} queue {} resumed at {} after failure at {}",
            self.id,
            self.queue_id,
            new_head,
            report.pos
        );
        Ok(Some(new_head))
    }

    /// Poll until the hardware reports the queue stopped.
    fn wait_queue_disabled(&self) -> Result<()> {
        let timeout = self.config.get_resume_poll_timeout();
        let started = Instant::now();
        loop {
            self.check_abort()?;
            if !self.ctx.driver.get_queue_enabled(self.queue_id)? {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(QueueError::ReportTimeout(timeout));
            }
            thread::sleep(DISABLE_POLL_INTERVAL);
        }
    }
}
