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
use bytemuck::{Pod, Zeroable};

use crate::task::TaskKind;

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
    pub struct DescFlags: u8 {
        /// The device must post a completion report for this descriptor
        const REPORT = 1 << 0;
        /// Last cell of a multi-cell task
        const LAST = 1 << 1;
    }
}

/// Header at the start of every descriptor cell.
///
/// The payload follows the header inside the same cell; its layout is
/// owned by the encoder of the task kind.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DescriptorHeader {
    /// [`TaskKind`] discriminant
    pub kind: u8,
    pub flags: DescFlags,
    /// Index of this cell within the task span
    pub cell_index: u8,
    /// Number of cells in the task span, saturated at 255
    pub cell_count: u8,
    /// Ring position of the first cell of the task
    pub pos: u16,
    pub reserved: u16,
    /// Device-wide task sequence number
    pub task_sn: u64,
}

impl DescriptorHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Header for cell `cell_index` of a task starting at `pos`.
    pub fn new(kind: TaskKind, pos: u16, task_sn: u64, cell_index: u16, cell_count: u16) -> Self {
        let mut flags = DescFlags::empty();
        if cell_index + 1 == cell_count {
            flags |= DescFlags::LAST;
        }
        Self {
            kind: kind as u8,
            flags,
            cell_index: cell_index.min(u8::MAX as u16) as u8,
            cell_count: cell_count.min(u8::MAX as u16) as u8,
            pos,
            reserved: 0,
            task_sn,
        }
    }

    /// Decoded task kind, `None` for a corrupt header.
    pub fn task_kind(&self) -> Option<TaskKind> {
        TaskKind::from_u8(self.kind)
    }
}

const _: () = assert!(DescriptorHeader::SIZE == 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_marks_last_cell() {
        let first = DescriptorHeader::new(TaskKind::ModelExecute, 7, 42, 0, 2);
        let last = DescriptorHeader::new(TaskKind::ModelExecute, 7, 42, 1, 2);
        assert!(!first.flags.contains(DescFlags::LAST));
        assert!(last.flags.contains(DescFlags::LAST));
        assert_eq!(last.task_kind(), Some(TaskKind::ModelExecute));
        assert_eq!(last.pos, 7);
    }

    #[test]
    fn header_bytes_are_stable() {
        let h = DescriptorHeader::new(TaskKind::Barrier, 0x0102, 0x0a0b, 0, 1);
        let bytes = bytemuck::bytes_of(&h);
        assert_eq!(bytes.len(), DescriptorHeader::SIZE);
        assert_eq!(bytes[0], TaskKind::Barrier as u8);
        assert_eq!(bytes[1], DescFlags::LAST.bits());
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 0x0102);
    }
}
