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

//! The per-device background thread that reclaims decoupled streams.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::device::DeviceContext;
use crate::error::Result;
use crate::new_error;
use crate::queue::Deferred;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecycleSignal {
    /// Run a pass now
    Wake,
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct RecycleWorker {
    tx: Sender<RecycleSignal>,
    handle: Option<JoinHandle<()>>,
}

impl RecycleWorker {
    pub(crate) fn spawn(ctx: Arc<DeviceContext>, rx: Receiver<RecycleSignal>) -> Result<Self> {
        let tx = ctx.recycle_sender();
        let name = format!("accelq-recycle-{}", ctx.id);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(ctx, rx))
            .map_err(|e| new_error!("failed to spawn {}: {}", name, e))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for its current pass to finish.
    pub(crate) fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if self.tx.send(RecycleSignal::Shutdown).is_err() {
            log::debug!("recycle worker already stopped");
        }
        if handle.join().is_err() {
            log::error!("recycle worker panicked");
        }
    }
}

fn run(ctx: Arc<DeviceContext>, rx: Receiver<RecycleSignal>) {
    let interval = ctx.config.get_recycle_worker_interval();
    log::debug!("device {} recycle worker started", ctx.id);
    loop {
        match rx.recv_timeout(interval) {
            Ok(RecycleSignal::Wake) | Err(RecvTimeoutError::Timeout) => pass(&ctx),
            Ok(RecycleSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("device {} recycle worker stopped", ctx.id);
}

/// Drain and reclaim every decoupled stream once. Resources released by the
/// pass are dropped together after every stream lock is released.
fn pass(ctx: &DeviceContext) {
    let streams = match ctx.live_streams() {
        Ok(streams) => streams,
        Err(e) => {
            log::error!("recycle worker cannot list streams: {e}");
            return;
        }
    };
    ctx.set_recycling(true);
    let mut deferred = Deferred::default();
    for stream in streams.iter().filter(|s| s.is_decoupled()) {
        if let Err(e) = stream.recycle_pass(&mut deferred) {
            if e.is_abort() {
                log::debug!("stream {} recycle pass stopped: {e}", stream.id());
            } else {
                log::warn!("stream {} recycle pass failed: {e}", stream.id());
            }
        }
    }
    ctx.set_recycling(false);
    if !deferred.is_empty() {
        deferred.run();
    }
}
