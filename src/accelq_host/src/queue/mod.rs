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

//! Host side model of one hardware ring.
//!
//! [`SlotQueue`] owns the ring cells and the per-position task slots. It is
//! always used behind the owning stream's lock; only the head/tail mirror
//! may be read without it.

mod allocator;
mod cell;
mod slot;

pub(crate) use allocator::{RingMirror, SlotQueue};
pub use slot::{CompletionCallback, SlotResource, SlotState, TaskFailure, TaskOutcome};
pub(crate) use slot::{Deferred, TaskSlot};
