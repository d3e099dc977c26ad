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
use std::time::Duration;

use accelq_common::report::codes;
use accelq_host::testing::MockDriver;
use accelq_host::{CompletionReport, CqeErrorBits, TaskKind};
use accelq_testing::simplelogger::{LOGGER, SimpleLogger};
use log::Level;

pub mod common; // pub to disable dead_code warning
use crate::common::{FIRST_QUEUE, aicpu, kernel, new_device, stream_config};

// Runs alone in this binary since the logger is process wide.
#[test]
fn queue_events_are_logged() {
    SimpleLogger::initialize_test_logger();
    LOGGER.clear_log_calls();

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
        codes::SDMA_OVERFLOW,
    ));
    stream
        .wait_for_completion(&task, Duration::from_secs(1))
        .unwrap();
    assert!(LOGGER.contains(Level::Warn, "treated as a warning"));

    let failed = stream.submit(kernel()).unwrap();
    driver.fail(
        FIRST_QUEUE,
        failed.pos,
        TaskKind::KernelLaunch,
        CqeErrorBits::BUS_ERROR,
        codes::KERNEL_EXCEPTION,
    );
    stream.drain(Duration::from_millis(50)).unwrap();
    assert!(LOGGER.contains(Level::Error, "task failed"));
    assert!(LOGGER.contains(Level::Warn, "resumed at"));

    driver.complete(FIRST_QUEUE, 7, TaskKind::Barrier);
    stream.drain(Duration::from_millis(50)).unwrap();

    LOGGER.test_log_records(|calls| {
        let unmatched: Vec<_> = calls
            .iter()
            .filter(|c| c.args.contains("matches no live task"))
            .collect();
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].level, Level::Warn);
        assert!(unmatched[0].target.starts_with("accelq_host"));
    });
}
