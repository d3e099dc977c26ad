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

use core::fmt;

#[cfg(feature = "fuzzing")]
use arbitrary::Arbitrary;

/// The kind of operation a task performs on the device.
///
/// The discriminant is the value written into the descriptor header and
/// echoed back in completion reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "fuzzing", derive(Arbitrary))]
#[repr(u8)]
pub enum TaskKind {
    /// Compute kernel on the matrix cores
    KernelLaunch = 0,
    /// Kernel on the device-side general purpose cpu
    AicpuKernel = 1,
    /// Asynchronous memory copy
    MemcpyAsync = 2,
    /// Launch of a whole captured model, occupies two cells
    ModelExecute = 3,
    EventRecord = 4,
    EventWait = 5,
    NotifyRecord = 6,
    NotifyWait = 7,
    /// Pre-built descriptors copied verbatim into the ring
    DirectSend = 8,
    /// Collective communication unit launch
    CcuLaunch = 9,
    /// Several kernels fused into consecutive cells
    FusionKernel = 10,
    /// A batch of independent tasks sent with a single doorbell
    BatchSend = 11,
    /// Image/video media processing
    MediaProcess = 12,
    /// No-op used to pad and to flush the queue
    Barrier = 13,
}

impl TaskKind {
    /// Number of task kinds.
    pub const COUNT: usize = 14;

    /// Every task kind, in discriminant order.
    pub const ALL: [TaskKind; Self::COUNT] = [
        TaskKind::KernelLaunch,
        TaskKind::AicpuKernel,
        TaskKind::MemcpyAsync,
        TaskKind::ModelExecute,
        TaskKind::EventRecord,
        TaskKind::EventWait,
        TaskKind::NotifyRecord,
        TaskKind::NotifyWait,
        TaskKind::DirectSend,
        TaskKind::CcuLaunch,
        TaskKind::FusionKernel,
        TaskKind::BatchSend,
        TaskKind::MediaProcess,
        TaskKind::Barrier,
    ];

    /// Index of this kind into per-kind tables.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decode a kind from a descriptor or report byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        if (value as usize) < Self::COUNT {
            Some(Self::ALL[value as usize])
        } else {
            None
        }
    }

    /// Kinds whose failure ends the task even when more reports are
    /// outstanding, because the device stops producing them.
    pub const fn terminates_on_error(self) -> bool {
        matches!(self, TaskKind::AicpuKernel | TaskKind::BatchSend)
    }

    /// Kinds that never raise the task-failure exception callback, even
    /// when their report carries an error bit.
    pub const fn is_sync_marker(self) -> bool {
        matches!(self, TaskKind::EventRecord | TaskKind::NotifyRecord)
    }

    pub const fn name(self) -> &'static str {
        match self {
            TaskKind::KernelLaunch => "kernel_launch",
            TaskKind::AicpuKernel => "aicpu_kernel",
            TaskKind::MemcpyAsync => "memcpy_async",
            TaskKind::ModelExecute => "model_execute",
            TaskKind::EventRecord => "event_record",
            TaskKind::EventWait => "event_wait",
            TaskKind::NotifyRecord => "notify_record",
            TaskKind::NotifyWait => "notify_wait",
            TaskKind::DirectSend => "direct_send",
            TaskKind::CcuLaunch => "ccu_launch",
            TaskKind::FusionKernel => "fusion_kernel",
            TaskKind::BatchSend => "batch_send",
            TaskKind::MediaProcess => "media_process",
            TaskKind::Barrier => "barrier",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}
