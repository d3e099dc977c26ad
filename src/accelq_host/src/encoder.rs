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

//! Task encoders.
//!
//! An encoder turns a logical [`TaskPayload`] into the raw descriptor cells
//! the device consumes. The submitter never looks inside a descriptor: it
//! only asks the encoder how many cells the task occupies and how many
//! completion reports the device will post for it.

use std::fmt::Debug;
use std::sync::Arc;

use accelq_common::{DescFlags, DescriptorHeader, QueueId, TaskKind};
use smallvec::SmallVec;

use crate::error::{QueueError, Result};
use crate::new_error;

/// A logical task before encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPayload {
    pub kind: TaskKind,
    /// Kind specific arguments, written after the header
    pub args: SmallVec<[u64; 6]>,
    /// Requested number of cells for variable-length kinds
    pub cells: u16,
    /// Event or notify id for sync kinds
    pub sync_id: Option<u32>,
    /// Pre-built descriptor bytes for [`TaskKind::DirectSend`]
    pub raw: Vec<u8>,
}

impl TaskPayload {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            args: SmallVec::new(),
            cells: 1,
            sync_id: None,
            raw: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: u64) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_cells(mut self, cells: u16) -> Self {
        self.cells = cells;
        self
    }

    pub fn with_sync_id(mut self, id: u32) -> Self {
        self.sync_id = Some(id);
        self
    }

    pub fn with_raw(mut self, raw: Vec<u8>) -> Self {
        self.raw = raw;
        self
    }
}

/// Where an encoder is writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeContext {
    pub queue_id: QueueId,
    /// Ring position of the first cell
    pub pos: u16,
    pub task_sn: u64,
    pub cell_size: usize,
}

/// Serializes one task kind into descriptor cells.
pub trait TaskEncoder: Debug + Send + Sync {
    /// Number of cells the task occupies, at least 1.
    fn span_length(&self, payload: &TaskPayload) -> u16;

    /// Number of completion reports the device posts for the task. Zero
    /// means the task completes when the consumer pointer moves past it.
    fn expected_completion_count(&self, payload: &TaskPayload) -> u16;

    /// Write the task into `cells`, which holds exactly
    /// `span_length * ctx.cell_size` zeroed bytes.
    fn encode(&self, payload: &TaskPayload, ctx: &EncodeContext, cells: &mut [u8]) -> Result<()>;
}

/// Number of cells to move the hardware head past a failed task when
/// resuming its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeSkip {
    /// A fixed number of cells
    Cells(u16),
    /// The span of the failed task
    Span,
    /// The span of the failed task counted from the host reclaim head,
    /// for kinds whose cells the device consumes as a single batch
    FromAllocatorHead,
}

/// Span of a task: fixed, or taken from [`TaskPayload::cells`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanRule {
    Fixed(u16),
    FromPayload,
}

/// Completion report count of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportRule {
    Fixed(u16),
    OnePerCell,
}

/// Encoder writing a [`DescriptorHeader`] into every cell followed by the
/// sync id and the arguments as little endian words.
///
/// Arguments that do not fit after the first header spill into the payload
/// area of the following cells.
#[derive(Debug, Clone, Copy)]
pub struct GenericEncoder {
    span: SpanRule,
    reports: ReportRule,
}

impl GenericEncoder {
    /// A task of `span` cells with `reports` completion reports.
    pub const fn fixed(span: u16, reports: u16) -> Self {
        Self {
            span: SpanRule::Fixed(span),
            reports: ReportRule::Fixed(reports),
        }
    }

    /// A task of `TaskPayload::cells` cells with `reports` completion reports.
    pub const fn variable(reports: u16) -> Self {
        Self {
            span: SpanRule::FromPayload,
            reports: ReportRule::Fixed(reports),
        }
    }

    /// A task of `TaskPayload::cells` cells, each posting its own report.
    pub const fn per_cell_reports() -> Self {
        Self {
            span: SpanRule::FromPayload,
            reports: ReportRule::OnePerCell,
        }
    }
}

impl TaskEncoder for GenericEncoder {
    fn span_length(&self, payload: &TaskPayload) -> u16 {
        match self.span {
            SpanRule::Fixed(n) => n,
            SpanRule::FromPayload => payload.cells,
        }
    }

    fn expected_completion_count(&self, payload: &TaskPayload) -> u16 {
        match self.reports {
            ReportRule::Fixed(n) => n,
            ReportRule::OnePerCell => self.span_length(payload),
        }
    }

    fn encode(&self, payload: &TaskPayload, ctx: &EncodeContext, cells: &mut [u8]) -> Result<()> {
        let span = self.span_length(payload);
        let reports = self.expected_completion_count(payload);
        let cell_size = ctx.cell_size;
        if cells.len() != span as usize * cell_size {
            return Err(new_error!(
                "encode buffer of {} bytes does not hold {} cells of {} bytes",
                cells.len(),
                span,
                cell_size
            ));
        }

        for (i, cell) in cells.chunks_exact_mut(cell_size).enumerate() {
            let mut header =
                DescriptorHeader::new(payload.kind, ctx.pos, ctx.task_sn, i as u16, span);
            if (i as u16) < reports {
                header.flags |= DescFlags::REPORT;
            }
            cell[..DescriptorHeader::SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        }

        let words = payload
            .sync_id
            .map(u64::from)
            .into_iter()
            .chain(payload.args.iter().copied());
        let mut payload_areas = cells
            .chunks_exact_mut(cell_size)
            .flat_map(|cell| cell[DescriptorHeader::SIZE..].chunks_exact_mut(8));
        for word in words {
            let Some(slot) = payload_areas.next() else {
                return Err(new_error!(
                    "{} arguments do not fit {} cells of {} bytes",
                    payload.args.len(),
                    span,
                    cell_size
                ));
            };
            slot.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }
}

/// Copies pre-built descriptors verbatim, stamping only the position and
/// sequence number into each header.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectSendEncoder;

impl TaskEncoder for DirectSendEncoder {
    fn span_length(&self, payload: &TaskPayload) -> u16 {
        payload.cells
    }

    fn expected_completion_count(&self, _payload: &TaskPayload) -> u16 {
        0
    }

    fn encode(&self, payload: &TaskPayload, ctx: &EncodeContext, cells: &mut [u8]) -> Result<()> {
        if payload.raw.len() > cells.len() {
            return Err(new_error!(
                "{} raw descriptor bytes do not fit {} bytes",
                payload.raw.len(),
                cells.len()
            ));
        }
        cells[..payload.raw.len()].copy_from_slice(&payload.raw);
        let span = self.span_length(payload);
        for (i, cell) in cells.chunks_exact_mut(ctx.cell_size).enumerate() {
            let mut header: DescriptorHeader =
                bytemuck::pod_read_unaligned(&cell[..DescriptorHeader::SIZE]);
            header.kind = payload.kind as u8;
            header.pos = ctx.pos;
            header.task_sn = ctx.task_sn;
            header.cell_index = i as u8;
            header.cell_count = span.min(u8::MAX as u16) as u8;
            cell[..DescriptorHeader::SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    encoder: Arc<dyn TaskEncoder>,
    skip: ResumeSkip,
}

/// Immutable map from [`TaskKind`] to its encoder and resume policy.
#[derive(Debug, Clone)]
pub struct EncoderTable {
    entries: [Option<Entry>; TaskKind::COUNT],
}

impl EncoderTable {
    pub fn builder() -> EncoderTableBuilder {
        EncoderTableBuilder {
            entries: std::array::from_fn(|_| None),
        }
    }

    /// Encoders for every task kind with the descriptor layout of
    /// [`GenericEncoder`].
    pub fn standard() -> Self {
        use TaskKind::*;

        Self::builder()
            .register(KernelLaunch, GenericEncoder::fixed(1, 0), ResumeSkip::Cells(1))
            .register(AicpuKernel, GenericEncoder::fixed(1, 1), ResumeSkip::Cells(1))
            .register(MemcpyAsync, GenericEncoder::fixed(1, 0), ResumeSkip::Span)
            .register(ModelExecute, GenericEncoder::fixed(2, 1), ResumeSkip::Cells(2))
            .register(EventRecord, GenericEncoder::fixed(1, 1), ResumeSkip::Cells(1))
            .register(EventWait, GenericEncoder::fixed(1, 0), ResumeSkip::Cells(1))
            .register(NotifyRecord, GenericEncoder::fixed(1, 0), ResumeSkip::Cells(1))
            .register(NotifyWait, GenericEncoder::fixed(1, 0), ResumeSkip::Cells(1))
            .register(DirectSend, DirectSendEncoder, ResumeSkip::Span)
            .register(CcuLaunch, GenericEncoder::variable(1), ResumeSkip::Span)
            .register(FusionKernel, GenericEncoder::variable(0), ResumeSkip::Span)
            .register(
                BatchSend,
                GenericEncoder::per_cell_reports(),
                ResumeSkip::FromAllocatorHead,
            )
            .register(MediaProcess, GenericEncoder::fixed(1, 1), ResumeSkip::Cells(1))
            .register(Barrier, GenericEncoder::fixed(1, 0), ResumeSkip::Cells(1))
            .build()
    }

    /// The encoder registered for `kind`.
    pub fn get(&self, kind: TaskKind) -> Result<&dyn TaskEncoder> {
        match &self.entries[kind.index()] {
            Some(entry) => Ok(entry.encoder.as_ref()),
            None => Err(QueueError::UnsupportedTaskKind(kind)),
        }
    }

    /// Resume policy of `kind`, one cell when the kind is unregistered.
    pub fn resume_skip(&self, kind: TaskKind) -> ResumeSkip {
        self.entries[kind.index()]
            .as_ref()
            .map_or(ResumeSkip::Cells(1), |e| e.skip)
    }
}

impl Default for EncoderTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Builds an [`EncoderTable`]; later registrations for a kind replace
/// earlier ones.
#[derive(Debug)]
pub struct EncoderTableBuilder {
    entries: [Option<Entry>; TaskKind::COUNT],
}

impl EncoderTableBuilder {
    pub fn register(
        mut self,
        kind: TaskKind,
        encoder: impl TaskEncoder + 'static,
        skip: ResumeSkip,
    ) -> Self {
        self.entries[kind.index()] = Some(Entry {
            encoder: Arc::new(encoder),
            skip,
        });
        self
    }

    pub fn build(self) -> EncoderTable {
        EncoderTable {
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pos: u16) -> EncodeContext {
        EncodeContext {
            queue_id: 1,
            pos,
            task_sn: 99,
            cell_size: 64,
        }
    }

    fn header(cells: &[u8], i: usize) -> DescriptorHeader {
        bytemuck::pod_read_unaligned(&cells[i * 64..i * 64 + DescriptorHeader::SIZE])
    }

    #[test]
    fn standard_table_covers_every_kind() {
        let table = EncoderTable::standard();
        for kind in TaskKind::ALL {
            assert!(table.get(kind).is_ok(), "{kind} has no encoder");
        }
        assert_eq!(table.resume_skip(TaskKind::ModelExecute), ResumeSkip::Cells(2));
        assert_eq!(table.resume_skip(TaskKind::BatchSend), ResumeSkip::FromAllocatorHead);
    }

    #[test]
    fn unregistered_kind_is_rejected() {
        let table = EncoderTable::builder()
            .register(TaskKind::KernelLaunch, GenericEncoder::fixed(1, 0), ResumeSkip::Cells(1))
            .build();
        assert!(matches!(
            table.get(TaskKind::Barrier),
            Err(QueueError::UnsupportedTaskKind(TaskKind::Barrier))
        ));
        assert_eq!(table.resume_skip(TaskKind::Barrier), ResumeSkip::Cells(1));
    }

    #[test]
    fn model_execute_spans_two_cells() {
        let enc = GenericEncoder::fixed(2, 1);
        let payload = TaskPayload::new(TaskKind::ModelExecute).with_arg(0xfeed);
        assert_eq!(enc.span_length(&payload), 2);
        let mut cells = vec![0u8; 128];
        enc.encode(&payload, &ctx(5), &mut cells).unwrap();

        let first = header(&cells, 0);
        let second = header(&cells, 1);
        assert_eq!(first.pos, 5);
        assert_eq!(first.task_sn, 99);
        assert!(first.flags.contains(DescFlags::REPORT));
        assert!(!first.flags.contains(DescFlags::LAST));
        assert!(second.flags.contains(DescFlags::LAST));
        assert!(!second.flags.contains(DescFlags::REPORT));
        let arg = u64::from_le_bytes(cells[16..24].try_into().unwrap());
        assert_eq!(arg, 0xfeed);
    }

    #[test]
    fn batch_reports_once_per_cell() {
        let enc = GenericEncoder::per_cell_reports();
        let payload = TaskPayload::new(TaskKind::BatchSend).with_cells(3);
        assert_eq!(enc.expected_completion_count(&payload), 3);
        let mut cells = vec![0u8; 3 * 64];
        enc.encode(&payload, &ctx(0), &mut cells).unwrap();
        for i in 0..3 {
            assert!(header(&cells, i).flags.contains(DescFlags::REPORT));
        }
    }

    #[test]
    fn arguments_spill_into_next_cell() {
        let enc = GenericEncoder::variable(0);
        let mut payload = TaskPayload::new(TaskKind::FusionKernel).with_cells(2);
        for i in 0..8 {
            payload = payload.with_arg(i);
        }
        let mut cells = vec![0u8; 128];
        enc.encode(&payload, &ctx(0), &mut cells).unwrap();
        // six words fit after the first header, the rest follow the second
        let seventh = u64::from_le_bytes(cells[80..88].try_into().unwrap());
        assert_eq!(seventh, 6);

        let single = GenericEncoder::fixed(1, 0);
        let mut cell = vec![0u8; 64];
        let err = single.encode(&payload, &ctx(0), &mut cell).unwrap_err();
        assert!(matches!(err, QueueError::Error(_)));
    }

    #[test]
    fn direct_send_keeps_payload_bytes() {
        let mut raw = vec![0u8; 64];
        raw[40] = 0xab;
        let payload = TaskPayload::new(TaskKind::DirectSend).with_raw(raw);
        let mut cells = vec![0u8; 64];
        DirectSendEncoder
            .encode(&payload, &ctx(9), &mut cells)
            .unwrap();
        assert_eq!(cells[40], 0xab);
        assert_eq!(header(&cells, 0).pos, 9);
        assert_eq!(header(&cells, 0).task_kind(), Some(TaskKind::DirectSend));
    }
}
