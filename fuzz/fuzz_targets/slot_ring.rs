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

#![no_main]

use std::time::Duration;

use accelq_common::report::codes;
use accelq_host::testing::{MockDriver, ReleaseCounter};
use accelq_host::{
    CompletionReport, CqeErrorBits, Device, DeviceConfiguration, EncoderTable, QueueError,
    StreamConfiguration, TaskKind, TaskPayload,
};
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Op {
    Submit { kind: TaskKind, cells: u8 },
    Retire(u8),
    RetireAll,
    Complete { back: u8 },
    Fail { back: u8, code: u8 },
    Stray { pos: u8, kind: TaskKind },
    Drain,
    Reclaim { limited: bool },
    ReclaimTo(u8),
    Busy(u8),
}

#[derive(Arbitrary, Debug)]
struct Input {
    depth: u8,
    ops: Vec<Op>,
}

const CODES: [u32; 4] = [
    codes::KERNEL_EXCEPTION,
    codes::AICORE_OVERFLOW,
    codes::MEDIA_TRANSIENT,
    codes::END_OF_SEQUENCE,
];

// Drives one stream over a mock driver with an arbitrary mix of
// submissions, device progress and stray reports. Every resource handed to
// the stream must be released exactly once by the time it is torn down.
fuzz_target!(|input: Input| {
    let driver = MockDriver::new();
    let device = Device::new(
        driver.clone(),
        EncoderTable::standard(),
        DeviceConfiguration::default(),
    )
    .unwrap();
    let mut cfg = StreamConfiguration::default();
    cfg.set_depth(u32::from(input.depth).max(2));
    cfg.set_allocation_timeout(Duration::ZERO);
    cfg.set_send_retry_timeout(Duration::ZERO);
    cfg.set_resume_poll_timeout(Duration::ZERO);
    let stream = device.create_stream(cfg).unwrap();
    let queue = stream.queue_id();
    let depth = stream.config().get_depth();
    let counter = ReleaseCounter::default();
    let mut handed_out = 0;

    for op in input.ops.into_iter().take(256) {
        let result = match op {
            Op::Submit { kind, cells } => {
                let payload = TaskPayload::new(kind).with_cells(u16::from(cells % 4));
                handed_out += 1;
                stream
                    .submit_with(payload, vec![counter.resource()], None)
                    .map(|_| ())
            }
            Op::Retire(n) => {
                driver.retire(queue, u32::from(n));
                Ok(())
            }
            Op::RetireAll => {
                driver.retire_all(queue);
                Ok(())
            }
            Op::Complete { back } => {
                let (_, tail) = stream.head_tail();
                let pos = ((u32::from(tail) + depth - u32::from(back) % depth) % depth) as u16;
                driver.complete(queue, pos, TaskKind::AicpuKernel);
                Ok(())
            }
            Op::Fail { back, code } => {
                let (_, tail) = stream.head_tail();
                let pos = ((u32::from(tail) + depth - u32::from(back) % depth) % depth) as u16;
                driver.fail(
                    queue,
                    pos,
                    TaskKind::AicpuKernel,
                    CqeErrorBits::TASK_EXCEPTION,
                    CODES[code as usize % CODES.len()],
                );
                Ok(())
            }
            Op::Stray { pos, kind } => {
                driver.push_report(CompletionReport::success(queue, u16::from(pos), kind));
                Ok(())
            }
            Op::Drain => stream.drain(Duration::ZERO).map(|_| ()),
            Op::Reclaim { limited } => stream.reclaim(limited).map(|_| ()),
            Op::ReclaimTo(pos) => stream.reclaim_to(u16::from(pos)).map(|_| ()),
            Op::Busy(n) => {
                driver.set_busy(u32::from(n % 4));
                Ok(())
            }
        };
        match result {
            Ok(())
            | Err(QueueError::QueueFull(_))
            | Err(QueueError::TransientSendBusy(_))
            | Err(QueueError::InvalidSpan(..))
            | Err(QueueError::Ring(_))
            | Err(QueueError::FailureAbort(_))
            | Err(QueueError::ResumeFailed { .. })
            | Err(QueueError::ReportTimeout(_))
            | Err(QueueError::Error(_)) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
        let (head, tail) = stream.head_tail();
        assert!(u32::from(head) < depth && u32::from(tail) < depth);
    }

    stream.destroy(Duration::ZERO).unwrap();
    assert_eq!(counter.released(), handed_out);
});
