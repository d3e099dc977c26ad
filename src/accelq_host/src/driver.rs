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

//! The seam between the queue runtime and the kernel driver.
//!
//! Everything the runtime needs from hardware goes through [`QueueDriver`]:
//! reading and moving the consumer pointer, gating the queue, ringing the
//! doorbell for freshly written cells and fetching completion reports.

use std::fmt::Debug;
use std::time::Duration;

use accelq_common::{CompletionReport, QueueId};
use thiserror::Error;

/// Errors returned by a [`QueueDriver`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// The driver has no room to accept a descriptor right now
    #[error("Driver has no resources")]
    NoResources,
    /// The hardware queue is stopped
    #[error("Queue {0} is disabled")]
    QueueDisabled(QueueId),
    /// The device is aborting
    #[error("Device abort")]
    DeviceAbort,
    /// No completion report arrived before the timeout
    #[error("Wait for completion reports timed out")]
    WaitTimeout,
    /// The queue id is not open on this driver
    #[error("Unknown queue {0}")]
    UnknownQueue(QueueId),
    /// Any other driver status code
    #[error("Driver status {0}")]
    Status(i32),
}

impl DriverError {
    /// Whether retrying the same call can never succeed.
    pub fn is_fatal(&self) -> bool {
        match self {
            DriverError::NoResources | DriverError::WaitTimeout => false,
            DriverError::QueueDisabled(_)
            | DriverError::DeviceAbort
            | DriverError::UnknownQueue(_)
            | DriverError::Status(_) => true,
        }
    }
}

/// A contiguous run of encoded cells handed to the driver in one doorbell.
#[derive(Debug, Clone, Copy)]
pub struct SendBatch<'a> {
    /// Ring position of the first cell
    pub pos: u16,
    /// Number of cells in `cells`
    pub cell_count: u16,
    /// Device address of the first cell
    pub addr: u64,
    /// Encoded cells, `cell_count * cell_size` bytes
    pub cells: &'a [u8],
}

/// What a completion poll should look for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitInfo {
    pub queue_id: QueueId,
    /// Position the caller is waiting on. A hint, the driver may return
    /// reports for any position of the queue.
    pub filter_pos: Option<u16>,
}

/// Hardware access for one device.
///
/// Implementations must be callable from several threads at once: the
/// runtime calls into the driver from submitting threads, waiting threads
/// and the recycle worker.
pub trait QueueDriver: Debug + Send + Sync {
    /// Read the hardware consumer pointer of `queue`.
    fn get_consumer_pos(&self, queue: QueueId) -> Result<u16, DriverError>;

    /// Move the hardware consumer pointer of `queue`. Only valid while the
    /// queue is disabled.
    fn set_consumer_pos(&self, queue: QueueId, pos: u16) -> Result<(), DriverError>;

    fn set_queue_enabled(&self, queue: QueueId, enabled: bool) -> Result<(), DriverError>;

    fn get_queue_enabled(&self, queue: QueueId) -> Result<bool, DriverError>;

    /// Publish `batch` to the device and ring the doorbell.
    fn send_descriptor(&self, queue: QueueId, batch: &SendBatch<'_>) -> Result<(), DriverError>;

    /// Fetch up to `max` completion reports, blocking at most `timeout`.
    ///
    /// Returns [`DriverError::WaitTimeout`] when no report arrived. A zero
    /// timeout polls without blocking.
    fn poll_completions(
        &self,
        wait: &WaitInfo,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<CompletionReport>, DriverError>;

    /// Allocate hardware resources for `queue` with `depth` cells of
    /// `cell_size` bytes, returning the device address of cell 0.
    fn open_queue(&self, _queue: QueueId, _depth: u32, _cell_size: u32) -> Result<u64, DriverError> {
        Ok(0)
    }

    /// Release the hardware resources of `queue`.
    fn close_queue(&self, _queue: QueueId) -> Result<(), DriverError> {
        Ok(())
    }
}
