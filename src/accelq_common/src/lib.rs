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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
// We use Arbitrary during fuzzing, which requires std
#![cfg_attr(not(any(test, feature = "fuzzing", feature = "std")), no_std)]

extern crate alloc;

/// Fixed-size hardware descriptor header written at the start of every
/// ring cell.
pub mod desc;

/// Completion reports and the error bitmask the device attaches to them.
pub mod report;

/// Modular arithmetic over the positions of a hardware ring.
pub mod ring;

/// The operation kinds a queue can carry.
pub mod task;

pub use desc::{DescFlags, DescriptorHeader};
pub use report::{CompletionReport, CqeErrorBits, QueueId};
pub use ring::{RingError, RingGeometry};
pub use task::TaskKind;
