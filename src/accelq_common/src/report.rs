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

use bitflags::bitflags;

use crate::task::TaskKind;

/// Identifier of a hardware submission queue.
pub type QueueId = u32;

bitflags! {
    /// Error and warning bits of a completion report.
    ///
    /// The low byte holds error bits, in priority order from bit 0. The
    /// high byte holds warning bits, which never stop the queue.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CqeErrorBits: u16 {
        const TASK_EXCEPTION = 1 << 0;
        const BUS_ERROR = 1 << 1;
        const TASK_TIMEOUT = 1 << 2;
        const SQE_ERROR = 1 << 3;
        const RESOURCE_CONFLICT = 1 << 4;
        const SQ_SW_STATUS = 1 << 5;
        const WARNING = 1 << 8;
    }
}

impl CqeErrorBits {
    /// All bits that signal an error, as opposed to a warning.
    pub const ERROR_MASK: Self = Self::from_bits_retain(0x00ff);
    /// All bits that signal a warning.
    pub const WARNING_MASK: Self = Self::from_bits_retain(0xff00);

    const ERROR_NAMES: [&'static str; 6] = [
        "task exception",
        "bus error",
        "task timeout",
        "sqe error",
        "resource conflict error",
        "sq sw status error",
    ];

    /// Whether any error bit is set.
    #[inline]
    pub const fn has_error(self) -> bool {
        self.bits() & Self::ERROR_MASK.bits() != 0
    }

    /// Whether any warning bit is set.
    #[inline]
    pub const fn has_warning(self) -> bool {
        self.bits() & Self::WARNING_MASK.bits() != 0
    }

    /// Human readable name of the highest priority error bit.
    pub const fn describe(self) -> &'static str {
        let errors = self.bits() & Self::ERROR_MASK.bits();
        if errors == 0 {
            return if self.has_warning() { "warning" } else { "none" };
        }
        let idx = errors.trailing_zeros() as usize;
        if idx < Self::ERROR_NAMES.len() {
            Self::ERROR_NAMES[idx]
        } else {
            "unknown error"
        }
    }
}

/// Well known values of [`CompletionReport::error_code`].
pub mod codes {
    /// No error.
    pub const NONE: u32 = 0;
    /// Arithmetic overflow on a matrix core.
    pub const AICORE_OVERFLOW: u32 = 0x0207;
    /// Arithmetic overflow on a vector core.
    pub const AIVEC_OVERFLOW: u32 = 0x0208;
    /// Arithmetic overflow inside a DMA engine.
    pub const SDMA_OVERFLOW: u32 = 0x0209;
    /// A model reached the end of its input sequence.
    pub const END_OF_SEQUENCE: u32 = 0x0301;
    /// A model execution was aborted by the device.
    pub const EXECUTE_ABORT: u32 = 0x0302;
    /// The device-side cpu timed out while a notify wait was pending.
    pub const AICPU_TIMEOUT: u32 = 0x0303;
    /// Transient failure of the media processing engine.
    pub const MEDIA_TRANSIENT: u32 = 0x0401;
    /// Generic kernel execution failure.
    pub const KERNEL_EXCEPTION: u32 = 0x0501;
}

/// A completion report fetched from the device's completion queue.
///
/// Reports are plain values copied out of driver memory; they are consumed
/// once the host has matched them to a task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionReport {
    /// Queue the reported descriptor was sent on
    pub queue_id: QueueId,
    /// Ring position of the reported descriptor
    pub pos: u16,
    /// Kind echoed from the descriptor header
    pub kind: TaskKind,
    /// Raw error and warning bits
    pub error_bits: CqeErrorBits,
    /// Device specific error code, see [`codes`]
    pub error_code: u32,
}

impl CompletionReport {
    /// A successful report.
    pub const fn success(queue_id: QueueId, pos: u16, kind: TaskKind) -> Self {
        Self {
            queue_id,
            pos,
            kind,
            error_bits: CqeErrorBits::empty(),
            error_code: codes::NONE,
        }
    }

    /// A report carrying `bits` and `code`.
    pub const fn failed(
        queue_id: QueueId,
        pos: u16,
        kind: TaskKind,
        bits: CqeErrorBits,
        code: u32,
    ) -> Self {
        Self {
            queue_id,
            pos,
            kind,
            error_bits: bits,
            error_code: code,
        }
    }

    /// Whether the report carries an error bit.
    #[inline]
    pub const fn is_error(&self) -> bool {
        self.error_bits.has_error()
    }
}
