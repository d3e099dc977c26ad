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

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use accelq_common::TaskKind;
use tracing::{Span, instrument};

use super::{IdPool, IdRef};
use crate::device::Device;
use crate::encoder::TaskPayload;
use crate::error::{QueueError, Result};
use crate::queue::SlotResource;
use crate::stream::{Stream, TaskHandle, TaskStatus};

/// State of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    NotRecorded,
    /// The last record has not run on the device yet
    Pending,
    Complete,
}

/// An id from a device pool plus the record and wait descriptors naming it.
#[derive(Debug)]
struct SyncObject {
    id: u32,
    pool: Arc<IdPool>,
    record: TaskKind,
    wait: TaskKind,
    last: Mutex<Option<(Weak<Stream>, TaskHandle)>>,
}

impl SyncObject {
    fn new(pool: &Arc<IdPool>, record: TaskKind, wait: TaskKind) -> Result<Self> {
        Ok(Self {
            id: pool.acquire()?,
            pool: pool.clone(),
            record,
            wait,
            last: Mutex::new(None),
        })
    }

    fn check_device(&self, pool: &Arc<IdPool>) -> Result<()> {
        if !Arc::ptr_eq(pool, &self.pool) {
            return Err(QueueError::InvalidHandle(format!(
                "{} {} used on a stream of another device",
                self.record, self.id
            )));
        }
        Ok(())
    }

    /// Enqueue a descriptor of `kind` that holds a reference to the id
    /// until it is reclaimed.
    fn submit(&self, stream: &Stream, kind: TaskKind) -> Result<TaskHandle> {
        let reference: Box<dyn SlotResource> = Box::new(IdRef::new(&self.pool, self.id)?);
        stream.submit_with(
            TaskPayload::new(kind).with_sync_id(self.id),
            vec![reference],
            None,
        )
    }

    fn record(&self, stream: &Arc<Stream>, pool: &Arc<IdPool>) -> Result<TaskHandle> {
        self.check_device(pool)?;
        let handle = self.submit(stream, self.record)?;
        *self.last.lock()? = Some((Arc::downgrade(stream), handle));
        Ok(handle)
    }

    fn wait(&self, stream: &Stream, pool: &Arc<IdPool>) -> Result<TaskHandle> {
        self.check_device(pool)?;
        self.submit(stream, self.wait)
    }

    /// The stream and handle of the last record, if that stream is alive.
    fn last_record(&self) -> Result<Option<(Option<Arc<Stream>>, TaskHandle)>> {
        Ok(self
            .last
            .lock()?
            .as_ref()
            .map(|(stream, handle)| (stream.upgrade(), *handle)))
    }
}

impl Drop for SyncObject {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

/// A marker recorded into a stream. Other streams can wait for it on the
/// device, and the host can wait for it with [`Event::synchronize`].
#[derive(Debug)]
pub struct Event {
    inner: SyncObject,
}

impl Event {
    /// Take an event id from `device`. Fails with `NoIdAvailable` once
    /// every id is referenced.
    pub fn new(device: &Device) -> Result<Self> {
        let pool = &device.context().events;
        Ok(Self {
            inner: SyncObject::new(pool, TaskKind::EventRecord, TaskKind::EventWait)?,
        })
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Record the event at the current end of `stream`.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn record(&self, stream: &Arc<Stream>) -> Result<TaskHandle> {
        self.inner.record(stream, &stream.device().events)
    }

    /// Make `stream` wait on the device until the event is reached.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn wait(&self, stream: &Stream) -> Result<TaskHandle> {
        self.inner.wait(stream, &stream.device().events)
    }

    /// Block until the last record has run. An event never recorded, or
    /// recorded on a stream that is gone, is already complete.
    pub fn synchronize(&self, timeout: Duration) -> Result<()> {
        match self.inner.last_record()? {
            Some((Some(stream), handle)) => stream.wait_for_completion(&handle, timeout),
            _ => Ok(()),
        }
    }

    pub fn query(&self) -> Result<EventStatus> {
        match self.inner.last_record()? {
            None => Ok(EventStatus::NotRecorded),
            Some((None, _)) => Ok(EventStatus::Complete),
            Some((Some(stream), handle)) => match stream.query(&handle)? {
                TaskStatus::Pending => Ok(EventStatus::Pending),
                TaskStatus::Complete => Ok(EventStatus::Complete),
                TaskStatus::Failed(fault) => Err(QueueError::FatalHardwareError(fault)),
            },
        }
    }
}

/// A device notify: recorded by one stream, waited on by another.
#[derive(Debug)]
pub struct Notify {
    inner: SyncObject,
}

impl Notify {
    pub fn new(device: &Device) -> Result<Self> {
        let pool = &device.context().notifies;
        Ok(Self {
            inner: SyncObject::new(pool, TaskKind::NotifyRecord, TaskKind::NotifyWait)?,
        })
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn record(&self, stream: &Arc<Stream>) -> Result<TaskHandle> {
        self.inner.record(stream, &stream.device().notifies)
    }

    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn wait(&self, stream: &Stream) -> Result<TaskHandle> {
        self.inner.wait(stream, &stream.device().notifies)
    }
}
