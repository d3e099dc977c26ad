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

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use accelq_host::testing::MockDriver;
use accelq_host::{
    Device, DeviceConfiguration, EncoderTable, QueueId, Stream, StreamConfiguration, TaskKind,
    TaskPayload,
};

/// Queue of the first stream created on a device.
pub const FIRST_QUEUE: QueueId = 0;

/// A device over `driver` with the standard encoders.
pub fn new_device(driver: &Arc<MockDriver>) -> Device {
    new_device_cfg(driver, DeviceConfiguration::default())
}

pub fn new_device_cfg(driver: &Arc<MockDriver>, cfg: DeviceConfiguration) -> Device {
    Device::new(driver.clone(), EncoderTable::standard(), cfg).unwrap()
}

/// A stream configuration with short timeouts so failing tests fail fast.
pub fn stream_config(depth: u32) -> StreamConfiguration {
    let mut cfg = StreamConfiguration::default();
    cfg.set_depth(depth);
    cfg.set_drain_wait(Duration::from_millis(5));
    cfg.set_allocation_timeout(Duration::from_millis(50));
    cfg.set_resume_poll_timeout(Duration::from_millis(50));
    cfg.set_send_retry_timeout(Duration::from_millis(50));
    cfg
}

/// One cell, no completion report: retired by the consumer pointer alone.
pub fn kernel() -> TaskPayload {
    TaskPayload::new(TaskKind::KernelLaunch).with_arg(0x1000)
}

/// One cell, one completion report.
pub fn aicpu() -> TaskPayload {
    TaskPayload::new(TaskKind::AicpuKernel).with_arg(0x2000)
}

/// Drain and reclaim until the stream is empty or `timeout` passes.
pub fn reclaim_until_empty(stream: &Stream, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        stream.drain(Duration::from_millis(1)).unwrap();
        stream.reclaim(false).unwrap();
        if stream.is_empty() {
            return true;
        }
    }
    stream.is_empty()
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
