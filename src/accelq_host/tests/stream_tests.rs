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

#![allow(clippy::disallowed_macros)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use accelq_common::report::codes;
use accelq_host::testing::{MockDriver, OutcomeLog, ReleaseCounter};
use accelq_host::{
    CompletionReport, CqeErrorBits, DescriptorHeader, DeviceConfiguration, DriverError,
    ErrorCodeTable, Event, EventStatus, FailurePolicy, Notify, QueueError, TaskFailure, TaskKind,
    TaskPayload, TaskStatus, TimeoutDiagnostic,
};

pub mod common; // pub to disable dead_code warning
use crate::common::{
    FIRST_QUEUE, aicpu, kernel, new_device, new_device_cfg, reclaim_until_empty, stream_config,
};

fn sent_header(cells: &[u8]) -> DescriptorHeader {
    bytemuck::pod_read_unaligned(&cells[..DescriptorHeader::SIZE])
}

#[test]
fn failed_batch_ends_early_and_resumes_from_allocator_head() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let stream = device.create_stream(stream_config(8)).unwrap();

    let batch = stream
        .submit(TaskPayload::new(TaskKind::BatchSend).with_cells(3))
        .unwrap();
    let after = stream.submit(kernel()).unwrap();
    assert_eq!((batch.pos, after.pos), (0, 3));

    // two of the three reports, then a fatal one for the third
    for _ in 0..2 {
        driver.complete(FIRST_QUEUE, 0, TaskKind::BatchSend);
        assert_eq!(stream.drain(Duration::from_millis(50)).unwrap(), 1);
        assert_eq!(stream.query(&batch).unwrap(), TaskStatus::Pending);
    }

    driver.fail(
        FIRST_QUEUE,
        0,
        TaskKind::BatchSend,
        CqeErrorBits::SQE_ERROR,
        codes::KERNEL_EXCEPTION,
    );
    assert_eq!(stream.drain(Duration::from_millis(50)).unwrap(), 1);
    assert_eq!(driver.consumer(FIRST_QUEUE), Some(3));
    assert!(driver.is_enabled(FIRST_QUEUE));

    // nothing more is expected from the failed batch
    driver.complete(FIRST_QUEUE, 0, TaskKind::BatchSend);
    assert_eq!(stream.drain(Duration::from_millis(50)).unwrap(), 0);
    assert_eq!(stream.stats().unmatched_reports, 1);

    match stream.query(&batch).unwrap() {
        TaskStatus::Failed(fault) => {
            assert_eq!(fault.kind, TaskKind::BatchSend);
            assert!(fault.bits.contains(CqeErrorBits::SQE_ERROR));
        }
        other => panic!("unexpected {other:?}"),
    }
    let err = stream
        .wait_for_completion(&batch, Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, QueueError::FatalHardwareError(_)), "{err:?}");
}

#[test]
fn late_report_for_failed_task_is_absorbed() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let stream = device.create_stream(stream_config(8)).unwrap();

    let model = stream.submit(TaskPayload::new(TaskKind::ModelExecute)).unwrap();
    assert_eq!(model.pos, 0);
    driver.fail(
        FIRST_QUEUE,
        0,
        TaskKind::ModelExecute,
        CqeErrorBits::TASK_TIMEOUT,
        codes::KERNEL_EXCEPTION,
    );
    assert_eq!(stream.drain(Duration::from_millis(50)).unwrap(), 1);
    // model launches skip both of their cells
    assert_eq!(driver.consumer(FIRST_QUEUE), Some(2));

    driver.complete(FIRST_QUEUE, 0, TaskKind::ModelExecute);
    assert_eq!(stream.drain(Duration::from_millis(50)).unwrap(), 1);
    assert_eq!(stream.stats().unmatched_reports, 0);
}

#[test]
fn resources_are_released_exactly_once() {
    let driver = MockDriver::new();
    driver.set_auto_complete(true);
    let device = new_device(&driver);
    let stream = device.create_stream(stream_config(4)).unwrap();
    let counter = ReleaseCounter::default();
    let log = OutcomeLog::default();

    for _ in 0..50 {
        stream
            .submit_with(aicpu(), vec![counter.resource()], Some(log.callback()))
            .unwrap();
    }
    stream.synchronize(Duration::from_secs(1)).unwrap();
    assert!(reclaim_until_empty(&stream, Duration::from_secs(1)));

    assert_eq!(counter.released(), 50);
    assert_eq!(stream.stats().reclaimed_cells, 50);
    let outcomes = log.outcomes();
    assert_eq!(outcomes.len(), 50);
    assert!(outcomes.iter().all(|o| o.result.is_ok()));

    drop(stream);
    assert_eq!(counter.released(), 50);
}

#[test]
fn teardown_aborts_unfinished_tasks() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let stream = device.create_stream(stream_config(8)).unwrap();
    let counter = ReleaseCounter::default();
    let log = OutcomeLog::default();

    for _ in 0..3 {
        stream
            .submit_with(aicpu(), vec![counter.resource()], Some(log.callback()))
            .unwrap();
    }
    stream.destroy(Duration::from_millis(20)).unwrap();
    assert_eq!(counter.released(), 3);
    let outcomes = log.outcomes();
    assert_eq!(outcomes.len(), 3);
    assert!(
        outcomes
            .iter()
            .all(|o| o.result == Err(TaskFailure::Aborted))
    );
    assert!(!driver.is_open(FIRST_QUEUE));
    // a second teardown is a no-op
    stream.destroy(Duration::ZERO).unwrap();
}

#[test]
fn force_clear_aborts_in_flight_tasks() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let stream = device.create_stream(stream_config(8)).unwrap();
    let log = OutcomeLog::default();
    for _ in 0..3 {
        stream
            .submit_with(aicpu(), Vec::new(), Some(log.callback()))
            .unwrap();
    }

    assert_eq!(stream.force_clear(Duration::from_millis(100)).unwrap(), 3);
    assert!(stream.is_empty());
    assert_eq!(stream.stats().forced_reclaims, 1);
    assert!(
        log.outcomes()
            .iter()
            .all(|o| o.result == Err(TaskFailure::Aborted))
    );
    // reclaim is conditional again afterwards
    stream.submit(aicpu()).unwrap();
    assert_eq!(stream.reclaim(false).unwrap(), 0);
}

#[test]
fn stop_on_failure_blocks_stream_until_reset() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let mut cfg = stream_config(8);
    cfg.set_failure_policy(FailurePolicy::StopOnFailure);
    let stream = device.create_stream(cfg).unwrap();

    let first = stream.submit(kernel()).unwrap();
    for _ in 0..2 {
        stream.submit(kernel()).unwrap();
    }
    driver.fail(
        FIRST_QUEUE,
        1,
        TaskKind::KernelLaunch,
        CqeErrorBits::BUS_ERROR,
        codes::KERNEL_EXCEPTION,
    );
    assert_eq!(stream.drain(Duration::from_millis(50)).unwrap(), 1);

    // head moved past the failed task but the queue stays stopped
    assert_eq!(driver.consumer(FIRST_QUEUE), Some(2));
    assert!(!driver.is_enabled(FIRST_QUEUE));
    assert!(stream.in_failure_abort().unwrap());
    assert_eq!(stream.stats().resumes, 0);

    let id = stream.id();
    assert!(matches!(
        stream.submit(kernel()),
        Err(QueueError::FailureAbort(s)) if s == id
    ));
    assert!(matches!(
        stream.wait_for_completion(&first, Duration::from_secs(1)),
        Err(QueueError::FatalHardwareError(_))
    ));
    assert!(matches!(
        stream.wait_for_completion(&first, Duration::from_secs(1)),
        Err(QueueError::FailureAbort(_))
    ));

    stream.reset().unwrap();
    assert!(!stream.in_failure_abort().unwrap());
    assert!(stream.is_empty());
    assert!(driver.is_enabled(FIRST_QUEUE));
    assert_eq!(driver.consumer(FIRST_QUEUE), Some(3));
    assert_eq!(stream.submit(kernel()).unwrap().pos, 3);
}

#[test]
fn transient_report_is_retried_once() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let stream = device.create_stream(stream_config(8)).unwrap();

    let media = stream.submit(TaskPayload::new(TaskKind::MediaProcess)).unwrap();
    driver.push_report(CompletionReport::failed(
        FIRST_QUEUE,
        media.pos,
        TaskKind::MediaProcess,
        CqeErrorBits::TASK_EXCEPTION,
        codes::MEDIA_TRANSIENT,
    ));
    assert_eq!(stream.drain(Duration::from_millis(50)).unwrap(), 1);
    assert_eq!(stream.stats().task_retries, 1);
    let sent = driver.sent(FIRST_QUEUE);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].cells, sent[1].cells);

    driver.retire_all(FIRST_QUEUE);
    driver.complete(FIRST_QUEUE, media.pos, TaskKind::MediaProcess);
    stream
        .wait_for_completion(&media, Duration::from_secs(1))
        .unwrap();
    assert_eq!(stream.stats().resumes, 0);
}

#[test]
fn retried_task_failing_again_is_fatal() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let stream = device.create_stream(stream_config(8)).unwrap();
    let log = OutcomeLog::default();

    let media = stream
        .submit_with(
            TaskPayload::new(TaskKind::MediaProcess),
            Vec::new(),
            Some(log.callback()),
        )
        .unwrap();
    let after = stream.submit(kernel()).unwrap();
    assert_eq!((media.pos, after.pos), (0, 1));

    driver.push_report(CompletionReport::failed(
        FIRST_QUEUE,
        media.pos,
        TaskKind::MediaProcess,
        CqeErrorBits::TASK_EXCEPTION,
        codes::MEDIA_TRANSIENT,
    ));
    assert_eq!(stream.drain(Duration::from_millis(50)).unwrap(), 1);
    assert_eq!(stream.stats().task_retries, 1);
    assert_eq!(driver.sent(FIRST_QUEUE).len(), 3);

    // the resent task reports the same transient code
    driver.fail(
        FIRST_QUEUE,
        media.pos,
        TaskKind::MediaProcess,
        CqeErrorBits::TASK_EXCEPTION,
        codes::MEDIA_TRANSIENT,
    );
    assert_eq!(stream.drain(Duration::from_millis(50)).unwrap(), 1);
    assert_eq!(stream.stats().task_retries, 1);
    assert_eq!(stream.stats().resumes, 1);
    assert_eq!(driver.consumer(FIRST_QUEUE), Some(1));
    assert!(driver.is_enabled(FIRST_QUEUE));

    let err = stream
        .wait_for_completion(&media, Duration::from_secs(1))
        .unwrap_err();
    match err {
        QueueError::FatalHardwareError(fault) => {
            assert_eq!(fault.kind, TaskKind::MediaProcess);
            assert_eq!(fault.code, codes::MEDIA_TRANSIENT);
        }
        other => panic!("unexpected {other:?}"),
    }

    // the stream keeps going after the resume
    driver.retire_all(FIRST_QUEUE);
    assert!(reclaim_until_empty(&stream, Duration::from_secs(1)));
    let outcomes = log.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].result, Err(TaskFailure::Hardware(_))));
}

#[test]
fn waits_accept_unbounded_timeouts() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let stream = device.create_stream(stream_config(8)).unwrap();

    let done = stream.submit(aicpu()).unwrap();
    driver.retire_all(FIRST_QUEUE);
    driver.complete(FIRST_QUEUE, done.pos, TaskKind::AicpuKernel);
    stream
        .wait_for_completion(&done, Duration::from_secs(1))
        .unwrap();
    stream.wait_for_completion(&done, Duration::MAX).unwrap();
    stream.synchronize(Duration::MAX).unwrap();

    // a task that finishes while the wait is blocked
    let later = stream.submit(aicpu()).unwrap();
    let completer = {
        let driver = driver.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            driver.retire_all(FIRST_QUEUE);
            driver.complete(FIRST_QUEUE, later.pos, TaskKind::AicpuKernel);
        })
    };
    stream.wait_for_completion(&later, Duration::MAX).unwrap();
    completer.join().unwrap();

    stream.force_clear(Duration::MAX).unwrap();
    assert!(stream.is_empty());
    stream.destroy(Duration::MAX).unwrap();
}

#[test]
fn benign_codes_complete_the_task() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let stream = device.create_stream(stream_config(8)).unwrap();

    let task = stream.submit(aicpu()).unwrap();
    driver.retire_all(FIRST_QUEUE);
    driver.push_report(CompletionReport::failed(
        FIRST_QUEUE,
        task.pos,
        TaskKind::AicpuKernel,
        CqeErrorBits::TASK_EXCEPTION,
        codes::AICORE_OVERFLOW,
    ));
    stream
        .wait_for_completion(&task, Duration::from_secs(1))
        .unwrap();
    assert_eq!(stream.stats().resumes, 0);
    assert_eq!(driver.enabled_polls(FIRST_QUEUE), 0);
}

#[test]
fn error_code_table_is_per_stream() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let mut cfg = stream_config(8);
    // nothing tolerated
    cfg.set_error_code_table(ErrorCodeTable::empty());
    let stream = device.create_stream(cfg).unwrap();

    let task = stream.submit(aicpu()).unwrap();
    driver.fail(
        FIRST_QUEUE,
        task.pos,
        TaskKind::AicpuKernel,
        CqeErrorBits::TASK_EXCEPTION,
        codes::AICORE_OVERFLOW,
    );
    assert!(matches!(
        stream.wait_for_completion(&task, Duration::from_secs(1)),
        Err(QueueError::FatalHardwareError(_))
    ));
    assert_eq!(stream.stats().resumes, 1);
}

#[test]
fn unmatched_report_is_counted_and_ignored() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let stream = device.create_stream(stream_config(8)).unwrap();

    driver.complete(FIRST_QUEUE, 5, TaskKind::KernelLaunch);
    assert_eq!(stream.drain(Duration::from_millis(50)).unwrap(), 0);
    assert_eq!(stream.stats().unmatched_reports, 1);
    assert_eq!(stream.stats().resumes, 0);
    assert!(stream.is_empty());
}

#[test]
fn busy_driver_is_retried_until_timeout() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let stream = device.create_stream(stream_config(8)).unwrap();

    driver.set_busy(3);
    stream.submit(kernel()).unwrap();
    assert_eq!(stream.stats().send_retries, 3);
    assert_eq!(driver.send_count(FIRST_QUEUE), 1);

    let counter = ReleaseCounter::default();
    let log = OutcomeLog::default();
    driver.set_busy(u32::MAX);
    let err = stream
        .submit_with(kernel(), vec![counter.resource()], Some(log.callback()))
        .unwrap_err();
    assert!(matches!(err, QueueError::TransientSendBusy(_)), "{err:?}");
    assert_eq!(counter.released(), 1);
    assert!(log.outcomes().is_empty());
    assert_eq!(stream.head_tail(), (0, 1));

    driver.set_busy(0);
    driver.fail_sends(Some(DriverError::QueueDisabled(FIRST_QUEUE)));
    let err = stream.submit(kernel()).unwrap_err();
    assert!(
        matches!(err, QueueError::Driver(DriverError::QueueDisabled(_))),
        "{err:?}"
    );
    assert_eq!(stream.head_tail(), (0, 1));

    driver.fail_sends(None);
    assert_eq!(stream.submit(kernel()).unwrap().pos, 1);
}

#[test]
fn repeated_report_timeouts_call_the_diagnostic_hook() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let calls = Arc::new(AtomicUsize::new(0));
    let last: Arc<Mutex<Option<TimeoutDiagnostic>>> = Arc::new(Mutex::new(None));
    {
        let calls = calls.clone();
        let last = last.clone();
        device
            .set_diagnostic_hook(move |diag| {
                calls.fetch_add(1, Ordering::SeqCst);
                *last.lock().unwrap() = Some(*diag);
            })
            .unwrap();
    }
    let mut cfg = stream_config(8);
    cfg.set_drain_wait(Duration::from_millis(1));
    cfg.set_timeout_diagnostic_threshold(2);
    let stream = device.create_stream(cfg).unwrap();

    let task = stream.submit(aicpu()).unwrap();
    let err = stream
        .wait_for_completion(&task, Duration::from_millis(30))
        .unwrap_err();
    assert!(matches!(err, QueueError::ReportTimeout(_)), "{err:?}");
    assert!(calls.load(Ordering::SeqCst) >= 1);
    let diag = last.lock().unwrap().unwrap();
    assert_eq!(diag.stream_id, stream.id());
    assert_eq!(diag.pos, task.pos);
    assert_eq!(diag.consecutive_timeouts, 2);
    assert!(stream.stats().report_timeouts >= 2);
}

#[test]
fn stream_abort_interrupts_wait() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let stream = device.create_stream(stream_config(8)).unwrap();
    let task = stream.submit(aicpu()).unwrap();

    let abort = stream.abort_handle();
    let aborter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        abort.abort();
    });
    let err = stream
        .wait_for_completion(&task, Duration::from_secs(10))
        .unwrap_err();
    assert!(matches!(err, QueueError::StreamAbort(_)), "{err:?}");
    aborter.join().unwrap();
    assert!(matches!(
        stream.submit(kernel()),
        Err(QueueError::StreamAbort(_))
    ));

    stream.reset().unwrap();
    assert!(stream.is_empty());
    let next = stream.submit(kernel()).unwrap();
    assert_eq!(next.pos, 1);
}

#[test]
fn query_and_foreign_handles() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let a = device.create_stream(stream_config(8)).unwrap();
    let b = device.create_stream(stream_config(8)).unwrap();

    let task = a.submit(aicpu()).unwrap();
    assert_eq!(a.query(&task).unwrap(), TaskStatus::Pending);
    assert!(matches!(
        b.wait_for_completion(&task, Duration::from_millis(10)),
        Err(QueueError::InvalidHandle(_))
    ));

    driver.retire_all(a.queue_id());
    driver.complete(a.queue_id(), task.pos, TaskKind::AicpuKernel);
    assert_eq!(a.query(&task).unwrap(), TaskStatus::Complete);
    // an idle stream synchronizes at once
    b.synchronize(Duration::from_millis(10)).unwrap();
}

#[test]
fn concurrent_submitters_share_a_stream() {
    let driver = MockDriver::new();
    driver.set_auto_complete(true);
    let device = new_device(&driver);
    let mut cfg = stream_config(64);
    cfg.set_allocation_timeout(Duration::from_secs(5));
    let stream = device.create_stream(cfg).unwrap();
    let counter = ReleaseCounter::default();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let stream = stream.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    stream
                        .submit_with(aicpu(), vec![counter.resource()], None)
                        .unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(stream.stats().submitted, 400);
    stream.synchronize(Duration::from_secs(1)).unwrap();
    assert!(reclaim_until_empty(&stream, Duration::from_secs(2)));
    assert_eq!(counter.released(), 400);
}

#[test]
fn event_record_synchronize_and_id_lifetime() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let stream = device.create_stream(stream_config(8)).unwrap();

    let event = Event::new(&device).unwrap();
    assert_eq!(event.query().unwrap(), EventStatus::NotRecorded);
    event.synchronize(Duration::from_millis(10)).unwrap();
    let (free_events, _) = device.available_sync_ids();

    let record = event.record(&stream).unwrap();
    assert_eq!(event.query().unwrap(), EventStatus::Pending);
    let header = sent_header(&driver.sent(FIRST_QUEUE)[0].cells);
    assert_eq!(header.kind, TaskKind::EventRecord as u8);

    driver.retire_all(FIRST_QUEUE);
    driver.complete(FIRST_QUEUE, record.pos, TaskKind::EventRecord);
    event.synchronize(Duration::from_secs(1)).unwrap();
    assert_eq!(event.query().unwrap(), EventStatus::Complete);

    drop(event);
    assert!(reclaim_until_empty(&stream, Duration::from_secs(1)));
    assert_eq!(device.available_sync_ids().0, free_events + 1);
}

#[test]
fn in_flight_descriptor_keeps_sync_id() {
    let driver = MockDriver::new();
    let mut cfg = DeviceConfiguration::default();
    cfg.set_notify_id_capacity(1);
    let device = new_device_cfg(&driver, cfg);
    let producer = device.create_stream(stream_config(8)).unwrap();
    let consumer = device.create_stream(stream_config(8)).unwrap();

    let notify = Notify::new(&device).unwrap();
    assert!(matches!(
        Notify::new(&device),
        Err(QueueError::NoIdAvailable("notify"))
    ));
    notify.record(&producer).unwrap();
    notify.wait(&consumer).unwrap();
    let wait = driver.sent(consumer.queue_id());
    assert_eq!(sent_header(&wait[0].cells).kind, TaskKind::NotifyWait as u8);
    let id_word = u64::from_le_bytes(
        wait[0].cells[DescriptorHeader::SIZE..DescriptorHeader::SIZE + 8]
            .try_into()
            .unwrap(),
    );
    assert_eq!(id_word, notify.id() as u64);

    // both descriptors still reference the id
    drop(notify);
    assert_eq!(device.available_sync_ids().1, 0);

    driver.retire_all(producer.queue_id());
    assert!(reclaim_until_empty(&producer, Duration::from_secs(1)));
    assert_eq!(device.available_sync_ids().1, 0);
    driver.retire_all(consumer.queue_id());
    assert!(reclaim_until_empty(&consumer, Duration::from_secs(1)));
    assert_eq!(device.available_sync_ids().1, 1);
    assert!(Notify::new(&device).is_ok());
}

#[test]
fn event_from_another_device_is_rejected() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let other_driver = MockDriver::new();
    let other = new_device(&other_driver);
    let foreign = other.create_stream(stream_config(8)).unwrap();

    let event = Event::new(&device).unwrap();
    assert!(matches!(
        event.record(&foreign),
        Err(QueueError::InvalidHandle(_))
    ));
    assert!(matches!(
        event.wait(&foreign),
        Err(QueueError::InvalidHandle(_))
    ));
    assert_eq!(other_driver.send_count(foreign.queue_id()), 0);
}

#[test]
fn rejected_send_stops_a_stop_on_failure_stream() {
    let driver = MockDriver::new();
    let device = new_device(&driver);
    let mut cfg = stream_config(8);
    cfg.set_failure_policy(FailurePolicy::StopOnFailure);
    let stream = device.create_stream(cfg).unwrap();

    driver.fail_sends(Some(DriverError::QueueDisabled(FIRST_QUEUE)));
    assert!(matches!(
        stream.submit(kernel()),
        Err(QueueError::Driver(DriverError::QueueDisabled(_)))
    ));
    assert!(stream.in_failure_abort().unwrap());

    driver.fail_sends(None);
    assert!(matches!(
        stream.submit(kernel()),
        Err(QueueError::FailureAbort(_))
    ));
    stream.reset().unwrap();
    assert_eq!(stream.submit(kernel()).unwrap().pos, 0);
}
