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

//! A host-side runtime for accelerator command queues.
//!
//! A [`Device`] wraps a [`QueueDriver`] and hands out [`Stream`]s. Each
//! stream owns one hardware ring: tasks are encoded into ring cells by the
//! [`TaskEncoder`] registered for their kind, sent to the driver, matched
//! with the completion reports the device posts and finally reclaimed
//! once the hardware has moved past them. After a fatal report the queue
//! is stepped past the failed task and restarted.
//!
//! Reclaim runs on the submitting and waiting threads, or, for streams
//! configured with `separate_send_recycle`, on the device's recycle
//! worker thread.

/// Which completion error codes are warnings and which can be retried.
pub mod capability;
/// Stream and device configuration.
pub mod config;
/// Devices, their abort flag and diagnostics hook.
pub mod device;
/// The hardware driver seam.
pub mod driver;
/// Per-kind descriptor encoders.
pub mod encoder;
/// Errors returned by the runtime.
pub mod error;
/// Metric definitions.
pub(crate) mod metrics;
/// Ring slots and the host model of a hardware queue.
pub mod queue;
/// Background reclaim for decoupled streams.
mod recycle_worker;
/// Streams: submission, completion, reclaim and resume.
pub mod stream;
/// Events and notifies.
pub mod sync;
/// Test doubles.
#[doc(hidden)]
pub mod testing;

pub use accelq_common::{
    CompletionReport, CqeErrorBits, DescFlags, DescriptorHeader, QueueId, RingGeometry, TaskKind,
};
pub use capability::ErrorCodeTable;
pub use config::{DeviceConfiguration, FailurePolicy, StreamConfiguration};
pub use device::{Device, DeviceAbortHandle, DiagnosticHook, TimeoutDiagnostic};
pub use driver::{DriverError, QueueDriver, SendBatch, WaitInfo};
pub use encoder::{
    DirectSendEncoder, EncodeContext, EncoderTable, EncoderTableBuilder, GenericEncoder,
    ResumeSkip, TaskEncoder, TaskPayload,
};
pub use error::{HardwareFault, QueueError, Result, StreamId};
pub use queue::{CompletionCallback, SlotResource, SlotState, TaskFailure, TaskOutcome};
pub use stream::{Stream, StreamAbortHandle, StreamStats, TaskHandle, TaskStatus};
pub use sync::{Event, EventStatus, Notify};
