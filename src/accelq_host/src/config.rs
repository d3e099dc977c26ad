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

use std::cmp::{max, min};
use std::time::Duration;

use tracing::{Span, instrument};

use crate::capability::ErrorCodeTable;

/// What a stream does after a task fails on the device.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum FailurePolicy {
    /// Record the failure, resume the queue and keep scheduling. The next
    /// wait on the stream reports the failure once.
    #[default]
    ContinueOnFailure,
    /// Stop scheduling: the stream enters failure-abort, every later
    /// submit and wait fails until the stream is reset.
    StopOnFailure,
}

/// Clamp a millisecond setting into `[lo, hi]`, 0 selects `default`.
fn clamp_millis(d: Duration, default: u32, lo: u32, hi: u32) -> u32 {
    match d.as_millis() {
        0 => default,
        1.. => min(hi as u128, max(d.as_millis(), lo as u128)) as u32,
    }
}

fn clamp_count(v: u32, default: u32, lo: u32, hi: u32) -> u32 {
    match v {
        0 => default,
        1.. => min(hi, max(v, lo)),
    }
}

/// The complete set of configuration needed to create a stream
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamConfiguration {
    /// Number of descriptor cells in the ring
    depth: u32,
    /// Size of a single cell in bytes
    cell_size: u32,
    /// Submissions between two opportunistic inline reclaims
    recycle_interval: u32,
    /// Upper bound on cells a single limited reclaim walks
    max_reclaim_per_call: u32,
    /// Upper bound on reports fetched by one drain
    max_reports_per_drain: u32,
    // The timeouts below are in milliseconds.
    drain_wait: u32,
    resume_poll_timeout: u32,
    send_retry_timeout: u32,
    allocation_timeout: u32,
    /// Consecutive report timeouts before the diagnostic hook fires
    timeout_diagnostic_threshold: u32,
    /// Reclaim on the device's recycle worker instead of the submitting thread
    separate_send_recycle: bool,
    failure_policy: FailurePolicy,
    /// Which report error codes are tolerated or retried
    error_codes: ErrorCodeTable,
}

impl StreamConfiguration {
    /// The default ring depth
    pub const DEFAULT_DEPTH: u32 = 1024;
    /// The minimum ring depth
    pub const MIN_DEPTH: u32 = 2;
    /// The maximum ring depth, the largest a `u16` position addresses
    pub const MAX_DEPTH: u32 = 65536;
    /// The default cell size (in bytes)
    pub const DEFAULT_CELL_SIZE: u32 = 64;
    /// The minimum cell size (in bytes)
    pub const MIN_CELL_SIZE: u32 = 32;
    /// The maximum cell size (in bytes)
    pub const MAX_CELL_SIZE: u32 = 256;
    /// The default number of submissions between inline reclaims
    pub const DEFAULT_RECYCLE_INTERVAL: u32 = 64;
    /// The minimum number of submissions between inline reclaims
    pub const MIN_RECYCLE_INTERVAL: u32 = 1;
    /// The maximum number of submissions between inline reclaims
    pub const MAX_RECYCLE_INTERVAL: u32 = 4096;
    /// The default limit of cells walked by one limited reclaim
    pub const DEFAULT_MAX_RECLAIM_PER_CALL: u32 = 64;
    /// The default limit of reports fetched by one drain
    pub const DEFAULT_MAX_REPORTS_PER_DRAIN: u32 = 64;
    /// The maximum limit of reports fetched by one drain
    pub const MAX_MAX_REPORTS_PER_DRAIN: u32 = 1024;
    /// The default time a single drain blocks for reports (in milliseconds)
    pub const DEFAULT_DRAIN_WAIT: u32 = 1000;
    /// The minimum time a single drain blocks for reports (in milliseconds)
    pub const MIN_DRAIN_WAIT: u32 = 1;
    /// The maximum time a single drain blocks for reports (in milliseconds)
    pub const MAX_DRAIN_WAIT: u32 = 5000;
    /// The default time to wait for the hardware to stop a queue (in milliseconds)
    pub const DEFAULT_RESUME_POLL_TIMEOUT: u32 = 1000;
    /// The default window for retrying a send the driver had no resources for (in milliseconds)
    pub const DEFAULT_SEND_RETRY_TIMEOUT: u32 = 1000;
    /// The default time a submit waits for ring space (in milliseconds)
    pub const DEFAULT_ALLOCATION_TIMEOUT: u32 = 5000;
    /// The minimum of the three timeouts above (in milliseconds)
    pub const MIN_TIMEOUT: u32 = 1;
    /// The maximum of the resume and send retry timeouts (in milliseconds)
    pub const MAX_TIMEOUT: u32 = 60_000;
    /// The maximum allocation timeout (in milliseconds)
    pub const MAX_ALLOCATION_TIMEOUT: u32 = 600_000;
    /// The default number of consecutive report timeouts before diagnostics
    pub const DEFAULT_TIMEOUT_DIAGNOSTIC_THRESHOLD: u32 = 3;
    /// The maximum number of consecutive report timeouts before diagnostics
    pub const MAX_TIMEOUT_DIAGNOSTIC_THRESHOLD: u32 = 1000;

    /// Set the ring depth. 0 selects `DEFAULT_DEPTH`, other values are
    /// clamped into `MIN_DEPTH..=MAX_DEPTH`.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_depth(&mut self, depth: u32) {
        self.depth = clamp_count(depth, Self::DEFAULT_DEPTH, Self::MIN_DEPTH, Self::MAX_DEPTH);
    }

    pub fn get_depth(&self) -> u32 {
        self.depth
    }

    /// Set the size of one descriptor cell in bytes.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_cell_size(&mut self, cell_size: u32) {
        self.cell_size = clamp_count(
            cell_size,
            Self::DEFAULT_CELL_SIZE,
            Self::MIN_CELL_SIZE,
            Self::MAX_CELL_SIZE,
        );
    }

    pub fn get_cell_size(&self) -> u32 {
        self.cell_size
    }

    /// Set how many submissions pass between two inline reclaims.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_recycle_interval(&mut self, interval: u32) {
        self.recycle_interval = clamp_count(
            interval,
            Self::DEFAULT_RECYCLE_INTERVAL,
            Self::MIN_RECYCLE_INTERVAL,
            Self::MAX_RECYCLE_INTERVAL,
        );
    }

    pub fn get_recycle_interval(&self) -> u32 {
        self.recycle_interval
    }

    /// Set the most cells a limited reclaim walks, at most the depth.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_max_reclaim_per_call(&mut self, n: u32) {
        self.max_reclaim_per_call =
            clamp_count(n, Self::DEFAULT_MAX_RECLAIM_PER_CALL, 1, Self::MAX_DEPTH);
    }

    pub fn get_max_reclaim_per_call(&self) -> u32 {
        min(self.max_reclaim_per_call, self.depth)
    }

    /// Set the most reports fetched by one drain.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_max_reports_per_drain(&mut self, n: u32) {
        self.max_reports_per_drain = clamp_count(
            n,
            Self::DEFAULT_MAX_REPORTS_PER_DRAIN,
            1,
            Self::MAX_MAX_REPORTS_PER_DRAIN,
        );
    }

    pub fn get_max_reports_per_drain(&self) -> u32 {
        self.max_reports_per_drain
    }

    /// Set how long a single drain blocks for reports. If set to 0 the
    /// value is `DEFAULT_DRAIN_WAIT`.
    ///
    /// Waits count one report timeout per `drain_wait` without a report but
    /// block on the driver for at most 10ms at a time, so a device abort is
    /// noticed within that interval.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_drain_wait(&mut self, wait: Duration) {
        self.drain_wait = clamp_millis(
            wait,
            Self::DEFAULT_DRAIN_WAIT,
            Self::MIN_DRAIN_WAIT,
            Self::MAX_DRAIN_WAIT,
        );
    }

    pub fn get_drain_wait(&self) -> Duration {
        Duration::from_millis(self.drain_wait as u64)
    }

    /// Set how long resume waits for the hardware to stop the queue.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_resume_poll_timeout(&mut self, timeout: Duration) {
        self.resume_poll_timeout = clamp_millis(
            timeout,
            Self::DEFAULT_RESUME_POLL_TIMEOUT,
            Self::MIN_TIMEOUT,
            Self::MAX_TIMEOUT,
        );
    }

    pub fn get_resume_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.resume_poll_timeout as u64)
    }

    /// Set the window in which a send is retried while the driver reports
    /// no resources.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_send_retry_timeout(&mut self, timeout: Duration) {
        self.send_retry_timeout = clamp_millis(
            timeout,
            Self::DEFAULT_SEND_RETRY_TIMEOUT,
            Self::MIN_TIMEOUT,
            Self::MAX_TIMEOUT,
        );
    }

    pub fn get_send_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.send_retry_timeout as u64)
    }

    /// Set how long a submit waits for ring space before failing with
    /// `QueueFull`.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_allocation_timeout(&mut self, timeout: Duration) {
        self.allocation_timeout = clamp_millis(
            timeout,
            Self::DEFAULT_ALLOCATION_TIMEOUT,
            Self::MIN_TIMEOUT,
            Self::MAX_ALLOCATION_TIMEOUT,
        );
    }

    pub fn get_allocation_timeout(&self) -> Duration {
        Duration::from_millis(self.allocation_timeout as u64)
    }

    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_timeout_diagnostic_threshold(&mut self, n: u32) {
        self.timeout_diagnostic_threshold = clamp_count(
            n,
            Self::DEFAULT_TIMEOUT_DIAGNOSTIC_THRESHOLD,
            1,
            Self::MAX_TIMEOUT_DIAGNOSTIC_THRESHOLD,
        );
    }

    pub fn get_timeout_diagnostic_threshold(&self) -> u32 {
        self.timeout_diagnostic_threshold
    }

    /// Move reclaim off the submitting thread onto the device's recycle
    /// worker.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_separate_send_recycle(&mut self, separate: bool) {
        self.separate_send_recycle = separate;
    }

    pub fn get_separate_send_recycle(&self) -> bool {
        self.separate_send_recycle
    }

    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_failure_policy(&mut self, policy: FailurePolicy) {
        self.failure_policy = policy;
    }

    pub fn get_failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Replace the table of benign and retryable error codes.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_error_code_table(&mut self, table: ErrorCodeTable) {
        self.error_codes = table;
    }

    pub fn get_error_code_table(&self) -> &ErrorCodeTable {
        &self.error_codes
    }
}

impl Default for StreamConfiguration {
    fn default() -> Self {
        Self {
            depth: Self::DEFAULT_DEPTH,
            cell_size: Self::DEFAULT_CELL_SIZE,
            recycle_interval: Self::DEFAULT_RECYCLE_INTERVAL,
            max_reclaim_per_call: Self::DEFAULT_MAX_RECLAIM_PER_CALL,
            max_reports_per_drain: Self::DEFAULT_MAX_REPORTS_PER_DRAIN,
            drain_wait: Self::DEFAULT_DRAIN_WAIT,
            resume_poll_timeout: Self::DEFAULT_RESUME_POLL_TIMEOUT,
            send_retry_timeout: Self::DEFAULT_SEND_RETRY_TIMEOUT,
            allocation_timeout: Self::DEFAULT_ALLOCATION_TIMEOUT,
            timeout_diagnostic_threshold: Self::DEFAULT_TIMEOUT_DIAGNOSTIC_THRESHOLD,
            separate_send_recycle: false,
            failure_policy: FailurePolicy::default(),
            error_codes: ErrorCodeTable::standard(),
        }
    }
}

/// Device wide configuration
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceConfiguration {
    /// Names the device in logs and in its worker thread
    device_id: u32,
    /// How often the recycle worker wakes on its own (in milliseconds)
    recycle_worker_interval: u32,
    event_id_capacity: u32,
    notify_id_capacity: u32,
}

impl DeviceConfiguration {
    /// The default recycle worker period (in milliseconds)
    pub const DEFAULT_RECYCLE_WORKER_INTERVAL: u32 = 10;
    /// The minimum recycle worker period (in milliseconds)
    pub const MIN_RECYCLE_WORKER_INTERVAL: u32 = 1;
    /// The maximum recycle worker period (in milliseconds)
    pub const MAX_RECYCLE_WORKER_INTERVAL: u32 = 1000;
    /// The default number of event and notify ids
    pub const DEFAULT_ID_CAPACITY: u32 = 1024;
    /// The maximum number of event and notify ids
    pub const MAX_ID_CAPACITY: u32 = 65536;

    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_device_id(&mut self, id: u32) {
        self.device_id = id;
    }

    pub fn get_device_id(&self) -> u32 {
        self.device_id
    }

    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_recycle_worker_interval(&mut self, interval: Duration) {
        self.recycle_worker_interval = clamp_millis(
            interval,
            Self::DEFAULT_RECYCLE_WORKER_INTERVAL,
            Self::MIN_RECYCLE_WORKER_INTERVAL,
            Self::MAX_RECYCLE_WORKER_INTERVAL,
        );
    }

    pub fn get_recycle_worker_interval(&self) -> Duration {
        Duration::from_millis(self.recycle_worker_interval as u64)
    }

    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_event_id_capacity(&mut self, n: u32) {
        self.event_id_capacity =
            clamp_count(n, Self::DEFAULT_ID_CAPACITY, 1, Self::MAX_ID_CAPACITY);
    }

    pub fn get_event_id_capacity(&self) -> u32 {
        self.event_id_capacity
    }

    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_notify_id_capacity(&mut self, n: u32) {
        self.notify_id_capacity =
            clamp_count(n, Self::DEFAULT_ID_CAPACITY, 1, Self::MAX_ID_CAPACITY);
    }

    pub fn get_notify_id_capacity(&self) -> u32 {
        self.notify_id_capacity
    }
}

impl Default for DeviceConfiguration {
    fn default() -> Self {
        Self {
            device_id: 0,
            recycle_worker_interval: Self::DEFAULT_RECYCLE_WORKER_INTERVAL,
            event_id_capacity: Self::DEFAULT_ID_CAPACITY,
            notify_id_capacity: Self::DEFAULT_ID_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn overrides() {
        let mut cfg = StreamConfiguration::default();
        cfg.set_depth(16);
        cfg.set_cell_size(128);
        cfg.set_recycle_interval(8);
        cfg.set_drain_wait(Duration::from_millis(20));
        cfg.set_separate_send_recycle(true);
        cfg.set_failure_policy(FailurePolicy::StopOnFailure);
        assert_eq!(16, cfg.get_depth());
        assert_eq!(128, cfg.get_cell_size());
        assert_eq!(8, cfg.get_recycle_interval());
        assert_eq!(Duration::from_millis(20), cfg.get_drain_wait());
        assert!(cfg.get_separate_send_recycle());
        assert_eq!(FailurePolicy::StopOnFailure, cfg.get_failure_policy());
        // the reclaim limit follows a shrinking ring
        assert_eq!(16, cfg.get_max_reclaim_per_call());
    }

    #[test]
    fn min_and_max_are_clamped() {
        let mut cfg = StreamConfiguration::default();
        cfg.set_depth(1);
        assert_eq!(StreamConfiguration::MIN_DEPTH, cfg.get_depth());
        cfg.set_depth(1 << 20);
        assert_eq!(StreamConfiguration::MAX_DEPTH, cfg.get_depth());
        cfg.set_cell_size(8);
        assert_eq!(StreamConfiguration::MIN_CELL_SIZE, cfg.get_cell_size());
        cfg.set_drain_wait(Duration::from_secs(3600));
        assert_eq!(
            Duration::from_millis(StreamConfiguration::MAX_DRAIN_WAIT as u64),
            cfg.get_drain_wait()
        );
        cfg.set_max_reclaim_per_call(1 << 20);
        assert_eq!(cfg.get_depth(), cfg.get_max_reclaim_per_call());
    }

    #[test]
    fn zero_selects_default() {
        let mut cfg = StreamConfiguration::default();
        cfg.set_depth(8);
        cfg.set_depth(0);
        assert_eq!(StreamConfiguration::DEFAULT_DEPTH, cfg.get_depth());
        cfg.set_allocation_timeout(Duration::ZERO);
        assert_eq!(
            Duration::from_millis(StreamConfiguration::DEFAULT_ALLOCATION_TIMEOUT as u64),
            cfg.get_allocation_timeout()
        );

        let mut dev = DeviceConfiguration::default();
        dev.set_recycle_worker_interval(Duration::ZERO);
        assert_eq!(Duration::from_millis(10), dev.get_recycle_worker_interval());
        dev.set_event_id_capacity(4);
        assert_eq!(4, dev.get_event_id_capacity());
    }
}
