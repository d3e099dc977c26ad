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

//! Test doubles shared by the unit tests, the integration tests, the
//! benchmarks and the fuzz target. Not part of the supported API.

mod mock_driver;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub use mock_driver::{MockDriver, SentBatch};

use crate::queue::{CompletionCallback, SlotResource, TaskOutcome};

/// Counts how many of the resources it handed out were released.
#[derive(Debug, Clone, Default)]
pub struct ReleaseCounter {
    released: Arc<AtomicUsize>,
}

struct Counted(Arc<AtomicUsize>);

impl SlotResource for Counted {
    fn release(self: Box<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl ReleaseCounter {
    pub fn resource(&self) -> Box<dyn SlotResource> {
        Box::new(Counted(self.released.clone()))
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// Collects the outcomes passed to completion callbacks.
#[derive(Debug, Clone, Default)]
pub struct OutcomeLog {
    outcomes: Arc<Mutex<Vec<TaskOutcome>>>,
}

impl OutcomeLog {
    pub fn callback(&self) -> CompletionCallback {
        let outcomes = self.outcomes.clone();
        Box::new(move |outcome| {
            if let Ok(mut outcomes) = outcomes.lock() {
                outcomes.push(*outcome);
            }
        })
    }

    pub fn outcomes(&self) -> Vec<TaskOutcome> {
        self.outcomes
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }
}
