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

//! Streams: an ordered submission context owning one hardware ring.
//!
//! Every stream serializes submission, report application and reclaim on
//! a single lock over its [`SlotQueue`]. Driver polls for completion
//! reports happen outside that lock, serialized by a second per-stream
//! drain lock so reports are applied in delivery order.

mod completion;
mod recycle;
mod resume;
mod submit;
mod wait;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use accelq_common::QueueId;
use tracing::{Span, instrument};

use crate::config::StreamConfiguration;
use crate::device::DeviceContext;
use crate::error::{HardwareFault, QueueError, Result, StreamId};
use crate::metrics::ReclaimPath;
use crate::queue::{Deferred, RingMirror, SlotQueue};
pub use wait::TaskStatus;

/// Identifies one submitted task.
///
/// The sequence number tells a reused ring position apart from the task
/// that was submitted there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub stream_id: StreamId,
    pub pos: u16,
    pub task_sn: u64,
}

/// Aborts one stream from any thread.
#[derive(Debug, Clone, Default)]
pub struct StreamAbortHandle {
    aborted: Arc<AtomicBool>,
}

impl StreamAbortHandle {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.aborted.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct StreamCounters {
    submitted: AtomicU64,
    queue_full: AtomicU64,
    send_retries: AtomicU64,
    inline_reclaims: AtomicU64,
    worker_reclaims: AtomicU64,
    forced_reclaims: AtomicU64,
    reclaimed_cells: AtomicU64,
    resumes: AtomicU64,
    report_timeouts: AtomicU64,
    task_retries: AtomicU64,
    unmatched_reports: AtomicU64,
}

impl StreamCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reclaimed(&self, path: ReclaimPath, cells: u32) {
        let per_path = match path {
            ReclaimPath::Inline => &self.inline_reclaims,
            ReclaimPath::Worker => &self.worker_reclaims,
            ReclaimPath::Forced => &self.forced_reclaims,
        };
        Self::bump(per_path);
        self.reclaimed_cells
            .fetch_add(cells as u64, Ordering::Relaxed);
    }
}

/// Snapshot of a stream's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Tasks accepted by the driver
    pub submitted: u64,
    /// Submissions that found the ring full at least once
    pub queue_full: u64,
    /// Sends retried because the driver had no resources
    pub send_retries: u64,
    /// Reclaims that freed cells, by the path that ran them
    pub inline_reclaims: u64,
    pub worker_reclaims: u64,
    pub forced_reclaims: u64,
    pub reclaimed_cells: u64,
    pub resumes: u64,
    pub report_timeouts: u64,
    /// Tasks sent a second time after a retryable report
    pub task_retries: u64,
    pub unmatched_reports: u64,
}

/// Everything guarded by the stream lock.
#[derive(Debug)]
pub(crate) struct StreamState {
    pub(crate) queue: SlotQueue,
    /// Stop scheduling after a fatal report
    pub(crate) failure_abort: bool,
    /// Reclaim unconditionally while set
    pub(crate) force_recycle: bool,
    /// Fatal failure not yet reported by a wait
    pub(crate) pending_error: Option<HardwareFault>,
    pub(crate) last_task: Option<TaskHandle>,
    /// Submissions since the last periodic reclaim
    pub(crate) since_recycle: u32,
}

/// An ordered queue of device tasks.
///
/// Created by [`crate::Device::create_stream`]. Tasks run in submission
/// order; completion and reclaim are driven by the threads that submit and
/// wait, or by the device's recycle worker for decoupled streams.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    queue_id: QueueId,
    config: StreamConfiguration,
    ctx: Arc<DeviceContext>,
    /// Device address of cell 0
    sq_base_addr: u64,
    state: Mutex<StreamState>,
    drain_lock: Mutex<()>,
    mirror: Arc<RingMirror>,
    abort: StreamAbortHandle,
    counters: StreamCounters,
    destroyed: AtomicBool,
}

impl Stream {
    /// Open the hardware queue for stream `id`.
    pub(crate) fn open(
        id: StreamId,
        config: StreamConfiguration,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self> {
        let queue_id = id as QueueId;
        let queue = SlotQueue::new(queue_id, config.get_depth(), config.get_cell_size())?;
        let sq_base_addr =
            ctx.driver
                .open_queue(queue_id, config.get_depth(), config.get_cell_size())?;
        Ok(Self {
            id,
            queue_id,
            mirror: queue.mirror(),
            state: Mutex::new(StreamState {
                queue,
                failure_abort: false,
                force_recycle: false,
                pending_error: None,
                last_task: None,
                since_recycle: 0,
            }),
            config,
            ctx,
            sq_base_addr,
            drain_lock: Mutex::new(()),
            abort: StreamAbortHandle::default(),
            counters: StreamCounters::default(),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    pub fn config(&self) -> &StreamConfiguration {
        &self.config
    }

    /// Whether reclaim runs on the device's recycle worker.
    pub fn is_decoupled(&self) -> bool {
        self.config.get_separate_send_recycle()
    }

    pub fn abort_handle(&self) -> StreamAbortHandle {
        self.abort.clone()
    }

    /// Abort the stream: waits return `StreamAbort` and in-flight tasks are
    /// reclaimed unconditionally.
    pub fn abort(&self) {
        self.abort.abort();
        log::warn!("stream {} abort requested", self.id);
    }

    /// `(head, tail)` of the ring, read without taking the stream lock.
    pub fn head_tail(&self) -> (u16, u16) {
        self.mirror.head_tail()
    }

    pub fn is_empty(&self) -> bool {
        self.mirror.in_flight() == 0
    }

    /// Whether a fatal failure stopped the stream.
    pub fn in_failure_abort(&self) -> Result<bool> {
        Ok(self.lock_state()?.failure_abort)
    }

    pub fn stats(&self) -> StreamStats {
        let c = &self.counters;
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        StreamStats {
            submitted: load(&c.submitted),
            queue_full: load(&c.queue_full),
            send_retries: load(&c.send_retries),
            inline_reclaims: load(&c.inline_reclaims),
            worker_reclaims: load(&c.worker_reclaims),
            forced_reclaims: load(&c.forced_reclaims),
            reclaimed_cells: load(&c.reclaimed_cells),
            resumes: load(&c.resumes),
            report_timeouts: load(&c.report_timeouts),
            task_retries: load(&c.task_retries),
            unmatched_reports: load(&c.unmatched_reports),
        }
    }

    pub(crate) fn device(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, StreamState>> {
        Ok(self.state.lock()?)
    }

    /// Device abort first, then stream abort.
    pub(crate) fn check_abort(&self) -> Result<()> {
        self.ctx.check_abort()?;
        if self.abort.is_aborted() {
            return Err(QueueError::StreamAbort(self.id));
        }
        Ok(())
    }

    /// Whether reclaim must ignore hardware progress.
    pub(crate) fn forced_mode(&self, state: &StreamState) -> bool {
        state.failure_abort
            || state.force_recycle
            || self.abort.is_aborted()
            || self.ctx.abort.is_aborted()
    }

    /// Device address of the cell at `pos`.
    pub(crate) fn cell_addr(&self, pos: u16, cell_size: usize) -> u64 {
        self.sq_base_addr + pos as u64 * cell_size as u64
    }

    /// Leave failure-abort and stream abort: drop everything in flight,
    /// point the hardware at the current tail and restart the queue.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn reset(&self) -> Result<()> {
        self.ctx.check_abort()?;
        let mut deferred = Deferred::default();
        let result = self.reset_locked(&mut deferred);
        deferred.run();
        if result.is_ok() {
            self.abort.clear();
            log::info!("stream {} reset", self.id);
        }
        result
    }

    fn reset_locked(&self, deferred: &mut Deferred) -> Result<()> {
        let mut state = self.lock_state()?;
        state.force_recycle = true;
        let reclaimed = self.reclaim_locked(
            &mut state,
            recycle::ReclaimLimit::Unlimited,
            ReclaimPath::Forced,
            deferred,
        );
        state.force_recycle = false;
        reclaimed?;

        let driver = &self.ctx.driver;
        driver.set_queue_enabled(self.queue_id, false)?;
        driver.set_consumer_pos(self.queue_id, state.queue.tail())?;
        driver.set_queue_enabled(self.queue_id, true)?;
        state.failure_abort = false;
        state.pending_error = None;
        state.since_recycle = 0;
        Ok(())
    }

    /// Tear the stream down: reclaim everything in flight, waiting up to
    /// `timeout` for the device to finish, then close the hardware queue.
    ///
    /// Once aborted, in failure-abort or past the timeout, the remaining
    /// tasks are reclaimed unconditionally.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn destroy(&self, timeout: Duration) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Err(e) = self.poll_reports() {
                log::debug!("stream {} teardown drain: {e}", self.id);
            }
            let mut deferred = Deferred::default();
            let result = {
                let mut state = self.lock_state()?;
                let give_up = self.forced_mode(&state)
                    || deadline.is_some_and(|d| Instant::now() >= d);
                let path = if give_up {
                    if !state.queue.is_empty() {
                        log::warn!(
                            "stream {} torn down with {} cells in flight",
                            self.id,
                            state.queue.in_flight()
                        );
                    }
                    ReclaimPath::Forced
                } else {
                    ReclaimPath::Inline
                };
                self.reclaim_locked(&mut state, recycle::ReclaimLimit::Unlimited, path, &mut deferred)
                    .map(|_| (state.queue.is_empty(), give_up))
            };
            deferred.run();
            match result {
                Ok((true, _)) | Ok((_, true)) => break,
                Ok(_) => {}
                Err(e) if e.is_abort() => {}
                Err(e) => {
                    log::warn!("stream {} teardown reclaim failed: {e}", self.id);
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
        if let Err(e) = self.ctx.driver.close_queue(self.queue_id) {
            log::warn!("closing queue {} failed: {e}", self.queue_id);
        }
        self.ctx.unregister(self.id);
        log::debug!("stream {} destroyed", self.id);
        Ok(())
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            if let Err(e) = self.destroy(Duration::ZERO) {
                log::error!("stream {} teardown failed: {e}", self.id);
            }
        }
    }
}
