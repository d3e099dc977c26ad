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

use std::sync::{Arc, Mutex};

use crate::error::{QueueError, Result};
use crate::queue::SlotResource;

#[derive(Debug)]
struct Ids {
    free: Vec<u32>,
    /// References per id; 0 means the id is free
    refs: Vec<u32>,
}

/// A reference counted id space.
///
/// An id goes back to the free list only once every holder has released
/// it: the object it was handed to and every descriptor naming it.
#[derive(Debug)]
pub(crate) struct IdPool {
    name: &'static str,
    inner: Mutex<Ids>,
}

impl IdPool {
    pub(crate) fn new(name: &'static str, capacity: u32) -> Self {
        Self {
            name,
            inner: Mutex::new(Ids {
                // lowest ids are handed out first
                free: (0..capacity).rev().collect(),
                refs: vec![0; capacity as usize],
            }),
        }
    }

    /// Take a free id with one reference.
    pub(crate) fn acquire(&self) -> Result<u32> {
        let mut ids = self.inner.lock()?;
        let id = ids.free.pop().ok_or(QueueError::NoIdAvailable(self.name))?;
        ids.refs[id as usize] = 1;
        Ok(id)
    }

    /// Add a reference to an id that is in use.
    pub(crate) fn retain(&self, id: u32) -> Result<()> {
        let mut ids = self.inner.lock()?;
        match ids.refs.get_mut(id as usize) {
            Some(refs) if *refs > 0 => {
                *refs += 1;
                Ok(())
            }
            _ => Err(QueueError::InvalidHandle(format!(
                "{} id {id} is not in use",
                self.name
            ))),
        }
    }

    /// Drop a reference, freeing the id with the last one.
    pub(crate) fn release(&self, id: u32) {
        let mut ids = match self.inner.lock() {
            Ok(ids) => ids,
            Err(e) => {
                log::error!("{} id pool lock poisoned: {e}", self.name);
                return;
            }
        };
        let Some(refs) = ids.refs.get_mut(id as usize) else {
            log::error!("release of unknown {} id {id}", self.name);
            return;
        };
        if *refs == 0 {
            log::error!("{} id {id} released more often than taken", self.name);
            return;
        }
        *refs -= 1;
        if *refs == 0 {
            ids.free.push(id);
        }
    }

    pub(crate) fn available(&self) -> usize {
        match self.inner.lock() {
            Ok(ids) => ids.free.len(),
            Err(_) => 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn refs(&self, id: u32) -> u32 {
        self.inner
            .lock()
            .map(|ids| ids.refs.get(id as usize).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

/// A reference to an id carried by an in-flight descriptor.
#[derive(Debug)]
pub(crate) struct IdRef {
    pool: Arc<IdPool>,
    id: u32,
}

impl IdRef {
    /// Take another reference to `id`.
    pub(crate) fn new(pool: &Arc<IdPool>, id: u32) -> Result<Self> {
        pool.retain(id)?;
        Ok(Self {
            pool: pool.clone(),
            id,
        })
    }
}

impl SlotResource for IdRef {
    fn release(self: Box<Self>) {
        self.pool.release(self.id);
    }
}
