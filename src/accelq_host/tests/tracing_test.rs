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
use std::io;
use std::sync::{Arc, Mutex};

use accelq_host::testing::MockDriver;
use accelq_host::{TaskKind, TaskPayload};
use tracing_subscriber::fmt::format::FmtSpan;

pub mod common; // pub to disable dead_code warning
use crate::common::{kernel, new_device, stream_config};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[test]
fn public_operations_are_instrumented() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let driver = MockDriver::new();
        let device = new_device(&driver);
        let stream = device.create_stream(stream_config(8)).unwrap();
        stream.submit(kernel()).unwrap();
        assert!(
            stream
                .submit(TaskPayload::new(TaskKind::FusionKernel).with_cells(0))
                .is_err()
        );
        stream.reclaim(false).unwrap();
    });

    let text = captured.text();
    assert!(text.contains("create_stream"), "{text}");
    assert!(text.contains("submit_with"), "{text}");
    assert!(text.contains("reclaim"), "{text}");
    assert!(text.contains("InvalidSpan(0, 8)"), "{text}");
}
