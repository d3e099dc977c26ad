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
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::{Sender, TrySendError};
use tracing::{Span, instrument};

use crate::config::{DeviceConfiguration, StreamConfiguration};
use crate::driver::QueueDriver;
use crate::encoder::EncoderTable;
use crate::error::{QueueError, Result, StreamId};
use crate::recycle_worker::{RecycleSignal, RecycleWorker};
use crate::stream::Stream;
use crate::sync::IdPool;

/// Aborts every stream of a device from any thread.
///
/// Once set, allocation on the device fails, blocked waits return
/// [`QueueError::DeviceAbort`] at their next iteration and reclaim becomes
/// unconditional.
#[derive(Debug, Clone, Default)]
pub struct DeviceAbortHandle {
    aborted: Arc<AtomicBool>,
}

impl DeviceAbortHandle {
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            log::warn!("device abort requested");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// What a diagnostic hook is told when a wait keeps timing out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutDiagnostic {
    pub device_id: u32,
    pub stream_id: StreamId,
    /// Position the wait is blocked on
    pub pos: u16,
    /// Report timeouts in a row so far
    pub consecutive_timeouts: u32,
}

/// Called from a waiting thread once a wait has seen
/// `timeout_diagnostic_threshold` report timeouts in a row. The wait goes
/// on after the hook returns.
pub type DiagnosticHook = Arc<dyn Fn(&TimeoutDiagnostic) + Send + Sync>;

/// State shared by a device, its streams and its recycle worker.
pub(crate) struct DeviceContext {
    pub(crate) id: u32,
    pub(crate) config: DeviceConfiguration,
    pub(crate) driver: Arc<dyn QueueDriver>,
    pub(crate) encoders: Arc<EncoderTable>,
    pub(crate) abort: DeviceAbortHandle,
    pub(crate) events: Arc<IdPool>,
    pub(crate) notifies: Arc<IdPool>,
    next_stream_id: AtomicU32,
    task_sn: AtomicU64,
    streams: Mutex<Vec<(StreamId, Weak<Stream>)>>,
    recycle_tx: Sender<RecycleSignal>,
    /// Set while the worker runs a pass, wakeups are skipped meanwhile
    doing_recycle: AtomicBool,
    diagnostic_hook: Mutex<Option<DiagnosticHook>>,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("driver", &self.driver)
            .field("abort", &self.abort)
            .field("task_sn", &self.task_sn)
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    /// Next device wide task sequence number, starting at 1.
    pub(crate) fn next_task_sn(&self) -> u64 {
        self.task_sn.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fail with `DeviceAbort` once the device is aborting.
    pub(crate) fn check_abort(&self) -> Result<()> {
        if self.abort.is_aborted() {
            return Err(QueueError::DeviceAbort);
        }
        Ok(())
    }

    /// Ask the recycle worker for a pass, unless one is running.
    pub(crate) fn wake_recycle(&self) {
        if self.doing_recycle.load(Ordering::Acquire) {
            return;
        }
        match self.recycle_tx.try_send(RecycleSignal::Wake) {
            // a pending wakeup already covers this one
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("device {} recycle worker is gone", self.id);
            }
        }
    }

    pub(crate) fn recycle_sender(&self) -> Sender<RecycleSignal> {
        self.recycle_tx.clone()
    }

    pub(crate) fn set_recycling(&self, running: bool) {
        self.doing_recycle.store(running, Ordering::Release);
    }

    pub(crate) fn register(&self, stream: &Arc<Stream>) -> Result<()> {
        let mut streams = self.streams.lock()?;
        streams.retain(|(_, s)| s.strong_count() > 0);
        streams.push((stream.id(), Arc::downgrade(stream)));
        Ok(())
    }

    pub(crate) fn unregister(&self, id: StreamId) {
        match self.streams.lock() {
            Ok(mut streams) => streams.retain(|(sid, s)| *sid != id && s.strong_count() > 0),
            Err(e) => log::error!("stream registry lock poisoned: {e}"),
        }
    }

    /// Streams still alive, collected so no registry lock is held while
    /// working on them.
    pub(crate) fn live_streams(&self) -> Result<Vec<Arc<Stream>>> {
        let streams = self.streams.lock()?;
        Ok(streams.iter().filter_map(|(_, s)| s.upgrade()).collect())
    }

    pub(crate) fn report_timeouts(&self, diagnostic: &TimeoutDiagnostic) {
        let hook = match self.diagnostic_hook.lock() {
            Ok(hook) => hook.clone(),
            Err(e) => {
                log::error!("diagnostic hook lock poisoned: {e}");
                None
            }
        };
        match hook {
            Some(hook) => hook(diagnostic),
            None => log::warn!(
                "stream {} on device {} still waiting for pos {} after {} report timeouts",
                diagnostic.stream_id,
                diagnostic.device_id,
                diagnostic.pos,
                diagnostic.consecutive_timeouts
            ),
        }
    }
}

/// A device: the driver, the encoder table and the streams created on it,
/// plus the background recycle worker serving its decoupled streams.
///
/// Dropping the device stops the worker. Streams keep working after that,
/// but decoupled streams are then only reclaimed by teardown.
#[derive(Debug)]
pub struct Device {
    ctx: Arc<DeviceContext>,
    worker: RecycleWorker,
}

impl Device {
    /// Create a device over `driver` and start its recycle worker.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn new(
        driver: Arc<dyn QueueDriver>,
        encoders: EncoderTable,
        config: DeviceConfiguration,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let ctx = Arc::new(DeviceContext {
            id: config.get_device_id(),
            config,
            driver,
            encoders: Arc::new(encoders),
            abort: DeviceAbortHandle::default(),
            events: Arc::new(IdPool::new("event", config.get_event_id_capacity())),
            notifies: Arc::new(IdPool::new("notify", config.get_notify_id_capacity())),
            next_stream_id: AtomicU32::new(0),
            task_sn: AtomicU64::new(0),
            streams: Mutex::new(Vec::new()),
            recycle_tx: tx,
            doing_recycle: AtomicBool::new(false),
            diagnostic_hook: Mutex::new(None),
        });
        let worker = RecycleWorker::spawn(ctx.clone(), rx)?;
        log::info!("device {} ready", ctx.id);
        Ok(Self { ctx, worker })
    }

    pub fn id(&self) -> u32 {
        self.ctx.id
    }

    /// Create a stream with its own hardware queue.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn create_stream(&self, config: StreamConfiguration) -> Result<Arc<Stream>> {
        self.ctx.check_abort()?;
        let id = self.ctx.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::new(Stream::open(id, config, self.ctx.clone())?);
        self.ctx.register(&stream)?;
        log::debug!(
            "device {} created stream {} (depth {}, {})",
            self.ctx.id,
            id,
            stream.config().get_depth(),
            if stream.is_decoupled() {
                "decoupled recycle"
            } else {
                "inline recycle"
            }
        );
        Ok(stream)
    }

    pub fn abort_handle(&self) -> DeviceAbortHandle {
        self.ctx.abort.clone()
    }

    pub fn abort(&self) {
        self.ctx.abort.abort();
    }

    /// Install the hook run when a wait keeps timing out. Without one the
    /// timeouts are logged.
    pub fn set_diagnostic_hook(&self, hook: impl Fn(&TimeoutDiagnostic) + Send + Sync + 'static) -> Result<()> {
        *self.ctx.diagnostic_hook.lock()? = Some(Arc::new(hook));
        Ok(())
    }

    /// Wake the recycle worker for an immediate pass.
    pub fn wake_recycle(&self) {
        self.ctx.wake_recycle();
    }

    /// Free ids left in the event and notify pools.
    pub fn available_sync_ids(&self) -> (usize, usize) {
        (self.ctx.events.available(), self.ctx.notifies.available())
    }

    pub(crate) fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.worker.shutdown();
        log::debug!("device {} dropped", self.ctx.id);
    }
}
