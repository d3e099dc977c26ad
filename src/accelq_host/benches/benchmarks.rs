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

#![expect(
    clippy::disallowed_macros,
    reason = "This is a benchmark file, so using disallowed macros is fine here."
)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use accelq_host::testing::MockDriver;
use accelq_host::{
    Device, DeviceConfiguration, EncoderTable, Stream, StreamConfiguration, TaskKind, TaskPayload,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

/// Ring depths exercised by every group.
const DEPTHS: [u32; 3] = [16, 256, 4096];

fn new_stream(depth: u32, decoupled: bool) -> (Arc<MockDriver>, Device, Arc<Stream>) {
    let driver = MockDriver::new();
    driver.set_auto_complete(true);
    let mut dev_cfg = DeviceConfiguration::default();
    dev_cfg.set_recycle_worker_interval(Duration::from_micros(50));
    let device = Device::new(driver.clone(), EncoderTable::standard(), dev_cfg).unwrap();
    let mut cfg = StreamConfiguration::default();
    cfg.set_depth(depth);
    cfg.set_separate_send_recycle(decoupled);
    cfg.set_allocation_timeout(Duration::from_secs(10));
    let stream = device.create_stream(cfg).unwrap();
    (driver, device, stream)
}

fn aicpu() -> TaskPayload {
    TaskPayload::new(TaskKind::AicpuKernel).with_arg(0x2000)
}

fn submit_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit");
    group.throughput(Throughput::Elements(1));

    for depth in DEPTHS {
        group.bench_with_input(BenchmarkId::new("inline", depth), &depth, |b, &depth| {
            let (_driver, _device, stream) = new_stream(depth, false);
            b.iter(|| stream.submit(aicpu()).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("decoupled", depth), &depth, |b, &depth| {
            let (_driver, _device, stream) = new_stream(depth, true);
            b.iter(|| stream.submit(aicpu()).unwrap());
        });
    }
    group.finish();
}

fn wait_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("wait");

    group.bench_function("submit_and_wait", |b| {
        let (_driver, _device, stream) = new_stream(256, false);
        b.iter(|| {
            let task = stream.submit(aicpu()).unwrap();
            stream
                .wait_for_completion(&task, Duration::from_secs(1))
                .unwrap();
        });
    });

    // four submitters sharing one stream
    group.bench_function("contended_submit", |b| {
        let (_driver, _device, stream) = new_stream(1024, false);
        b.iter_custom(|iters| {
            let per_thread = iters.div_ceil(4);
            let start = Instant::now();
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let stream = stream.clone();
                    thread::spawn(move || {
                        for _ in 0..per_thread {
                            stream.submit(aicpu()).unwrap();
                        }
                    })
                })
                .collect();
            for w in workers {
                w.join().unwrap();
            }
            start.elapsed()
        });
    });
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default();
    targets = submit_benchmark, wait_benchmark
}

criterion_main!(benches);
