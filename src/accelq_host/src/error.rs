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

use std::error::Error;
use std::fmt;
use std::sync::{MutexGuard, PoisonError};
use std::time::Duration;

use accelq_common::{CqeErrorBits, QueueId, RingError, TaskKind};
use thiserror::Error;

use crate::driver::DriverError;

/// Identifier of a stream, unique within its device.
pub type StreamId = u32;

/// The result type of every fallible runtime operation.
pub type Result<T> = core::result::Result<T, QueueError>;

/// The hardware failure attached to a task whose report carried a fatal
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareFault {
    /// Queue the failing descriptor was sent on
    pub queue_id: QueueId,
    /// Ring position of the failing descriptor
    pub pos: u16,
    pub kind: TaskKind,
    pub bits: CqeErrorBits,
    pub code: u32,
}

impl fmt::Display for HardwareFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on queue {} pos {} ({}, bits {:#06x}, code {:#x})",
            self.kind,
            self.queue_id,
            self.pos,
            self.bits.describe(),
            self.bits.bits(),
            self.code
        )
    }
}

/// The error type for queue runtime operations
#[derive(Error, Debug)]
pub enum QueueError {
    /// The device was aborted, every blocking operation on it unblocks
    #[error("Device abort was requested")]
    DeviceAbort,

    /// The driver refused an operation
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// A generic error with a message
    #[error("{0}")]
    Error(String),

    /// The stream stopped scheduling after a fatal task failure
    #[error("Stream {0} is in failure-abort, reset it before submitting again")]
    FailureAbort(StreamId),

    /// A task failed on the device
    #[error("Fatal hardware error: {0}")]
    FatalHardwareError(HardwareFault),

    /// A handle did not refer to a live task, stream or sync object
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// A task asked for zero cells or more cells than the ring holds
    #[error("Task span {0} does not fit a ring of depth {1}")]
    InvalidSpan(u32, u32),

    /// An attempt to get a lock from a Mutex failed.
    #[error("Unable to lock resource")]
    LockAttemptFailed(String),

    /// An id pool ran dry
    #[error("No {0} id available")]
    NoIdAvailable(&'static str),

    /// The ring has no room for the requested span
    #[error("Queue {0} is full")]
    QueueFull(QueueId),

    /// No completion report arrived within the given time
    #[error("No completion report within {0:?}")]
    ReportTimeout(Duration),

    /// The queue could not be restarted after a fatal report
    #[error("Resuming queue after the failure at pos {pos} failed: {source}")]
    ResumeFailed {
        pos: u16,
        #[source]
        source: Box<QueueError>,
    },

    /// Ring arithmetic was given an impossible geometry or position
    #[error("Ring error: {0}")]
    Ring(#[from] RingError),

    /// The stream was aborted
    #[error("Stream {0} was aborted")]
    StreamAbort(StreamId),

    /// The driver stayed out of resources for the whole retry window
    #[error("Driver had no resources to accept a descriptor for {0:?}")]
    TransientSendBusy(Duration),

    /// No encoder is registered for the task kind
    #[error("No encoder registered for task kind {0}")]
    UnsupportedTaskKind(TaskKind),
}

impl From<&str> for QueueError {
    fn from(s: &str) -> Self {
        QueueError::Error(s.to_string())
    }
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for QueueError {
    // PoisonError borrows the guard, so keep only its message
    fn from(e: PoisonError<MutexGuard<'_, T>>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => String::from(""),
        };
        QueueError::LockAttemptFailed(source)
    }
}

impl QueueError {
    /// Whether the error leaves the stream unable to make progress without
    /// an explicit reset or teardown.
    ///
    /// Fatal errors are the ones a caller should not simply retry.
    pub fn is_fatal(&self) -> bool {
        // no wildcard, so new variants must be classified here
        match self {
            QueueError::DeviceAbort
            | QueueError::FailureAbort(_)
            | QueueError::FatalHardwareError(_)
            | QueueError::LockAttemptFailed(_)
            | QueueError::ResumeFailed { .. }
            | QueueError::StreamAbort(_) => true,

            QueueError::Driver(e) => e.is_fatal(),

            QueueError::Error(_)
            | QueueError::InvalidHandle(_)
            | QueueError::InvalidSpan(_, _)
            | QueueError::NoIdAvailable(_)
            | QueueError::QueueFull(_)
            | QueueError::ReportTimeout(_)
            | QueueError::Ring(_)
            | QueueError::TransientSendBusy(_)
            | QueueError::UnsupportedTaskKind(_) => false,
        }
    }

    /// Whether the error was raised by an abort flag rather than by the
    /// operation itself.
    pub(crate) fn is_abort(&self) -> bool {
        matches!(
            self,
            QueueError::DeviceAbort | QueueError::StreamAbort(_) | QueueError::FailureAbort(_)
        )
    }
}

/// Creates a `QueueError::Error` from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::QueueError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
           let __err_msg = std::format!($fmtstr, $($arg)*);
           $crate::error::QueueError::Error(__err_msg)
    }};
}
