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

use std::sync::Once;
use std::time::Duration;

/// Name, description and unit of a metric variant.
pub(crate) trait NamedMetric {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn unit(&self) -> metrics::Unit;
}

/// Declares metric enums and their [`NamedMetric`] impls. Attributes given
/// before an enum name are put on the enum.
macro_rules! define_metrics {
    (
        $(
            $(#[$attr:meta])*
            $metric_type:ident {
                $(
                    $variant:ident $( { $($field_name:ident : $field_ty:ty),* $(,)? } )? => {
                        name: $name:expr,
                        description: $description:expr,
                        unit: $unit:expr $(,)?
                    }
                ),* $(,)?
            }
        )*
    ) => {
        $(
            #[derive(Debug, Clone)]
            $(#[$attr])*
            pub(crate) enum $metric_type {
                $(
                    $variant $( { $($field_name : $field_ty),* } )?
                ),*
            }

            impl NamedMetric for $metric_type {
                fn name(&self) -> &'static str {
                    match self {
                        $( Self::$variant { .. } => $name, )*
                    }
                }

                fn description(&self) -> &'static str {
                    match self {
                        $( Self::$variant { .. } => $description, )*
                    }
                }

                fn unit(&self) -> metrics::Unit {
                    match self {
                        $( Self::$variant { .. } => $unit, )*
                    }
                }
            }
        )*
    };
}

/// Which reclaim path freed a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReclaimPath {
    /// On the submitting or waiting thread
    Inline,
    /// On the device's recycle worker
    Worker,
    /// Unconditional reclaim on abort, failure-abort or teardown
    Forced,
}

impl ReclaimPath {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ReclaimPath::Inline => "inline",
            ReclaimPath::Worker => "worker",
            ReclaimPath::Forced => "forced",
        }
    }
}

define_metrics! {
    CounterMetric {
        QueueFull => {
            name: "queue_full_total",
            description: "Number of submissions that found the ring full",
            unit: metrics::Unit::Count,
        },
        CqeErrors { code: u32 } => {
            name: "cqe_errors_total",
            description: "Number of completion reports carrying an error bit",
            unit: metrics::Unit::Count,
        },
        UnmatchedReports => {
            name: "unmatched_reports_total",
            description: "Number of completion reports that matched no live slot",
            unit: metrics::Unit::Count,
        },
        QueueResumes => {
            name: "queue_resumes_total",
            description: "Number of times a queue was restarted after a fatal report",
            unit: metrics::Unit::Count,
        },
        ReportTimeouts => {
            name: "report_timeouts_total",
            description: "Number of waits whose drain saw no report in time",
            unit: metrics::Unit::Count,
        },
        ReclaimedSlots { path: ReclaimPath, count: u64 } => {
            name: "reclaimed_slots_total",
            description: "Number of ring cells returned to the free pool",
            unit: metrics::Unit::Count,
        },
    }
    // only built when waits are timed
    #[cfg_attr(not(any(feature = "wait_metrics", test)), allow(dead_code))]
    HistogramMetric {
        TaskWaitDuration { duration: Duration } => {
            name: "task_wait_duration_seconds",
            description: "Time spent blocked waiting for a task to complete",
            unit: metrics::Unit::Seconds,
        },
    }
}

impl CounterMetric {
    #[must_use]
    pub(crate) fn queue_full() -> Self {
        CounterMetric::QueueFull
    }
    /// A report with an error bit, labelled by its device error code
    #[must_use]
    pub(crate) fn cqe_error(code: u32) -> Self {
        CounterMetric::CqeErrors { code }
    }
    #[must_use]
    pub(crate) fn unmatched_report() -> Self {
        CounterMetric::UnmatchedReports
    }
    #[must_use]
    pub(crate) fn queue_resume() -> Self {
        CounterMetric::QueueResumes
    }
    #[must_use]
    pub(crate) fn report_timeout() -> Self {
        CounterMetric::ReportTimeouts
    }
    #[must_use]
    pub(crate) fn reclaimed(path: ReclaimPath, count: u64) -> Self {
        CounterMetric::ReclaimedSlots { path, count }
    }
}

impl HistogramMetric {
    /// Runs the given wait and emits its duration.
    ///
    /// Note: without the `wait_metrics` feature the closure runs untimed.
    pub(crate) fn time_and_emit_wait<T, F: FnOnce() -> T>(f: F) -> T {
        cfg_if::cfg_if! {
            if #[cfg(feature = "wait_metrics")] {
                use std::time::Instant;

                let start = Instant::now();
                let result = f();
                let duration = start.elapsed();
                HistogramMetric::TaskWaitDuration { duration }.emit();
                result
            } else {
                f()
            }
        }
    }

    #[cfg(test)]
    #[must_use]
    fn task_wait(duration: Duration) -> HistogramMetric {
        HistogramMetric::TaskWaitDuration { duration }
    }
}

/// A metric which can be emitted to the underlying metrics system
pub(crate) trait EmittableMetric {
    /// Emits the metric to the underlying metrics system.
    /// The first time this is called for a given metric variant, it will
    /// also describe the metric to the underlying metrics system.
    fn emit(self);
}

impl EmittableMetric for CounterMetric {
    fn emit(self) {
        let name = self.name();
        let unit = self.unit();
        let description = self.description();

        match self {
            CounterMetric::QueueFull => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_counter!(name, unit, description);
                });

                metrics::counter!(name).increment(1);
            }
            CounterMetric::CqeErrors { code } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_counter!(name, unit, description);
                });

                static LABEL_ERROR_CODE: &str = "code";
                metrics::counter!(name, LABEL_ERROR_CODE => format!("{code:#x}")).increment(1);
            }
            CounterMetric::UnmatchedReports => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_counter!(name, unit, description);
                });

                metrics::counter!(name).increment(1);
            }
            CounterMetric::QueueResumes => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_counter!(name, unit, description);
                });

                metrics::counter!(name).increment(1);
            }
            CounterMetric::ReportTimeouts => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_counter!(name, unit, description);
                });

                metrics::counter!(name).increment(1);
            }
            CounterMetric::ReclaimedSlots { path, count } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_counter!(name, unit, description);
                });

                static LABEL_PATH: &str = "path";
                metrics::counter!(name, LABEL_PATH => path.as_str()).increment(count);
            }
        }
    }
}

impl EmittableMetric for HistogramMetric {
    fn emit(self) {
        let metric_name = self.name();
        let unit = self.unit();
        let description = self.description();

        match self {
            HistogramMetric::TaskWaitDuration { duration } => {
                static DESCRIBE: Once = Once::new();
                DESCRIBE.call_once(|| {
                    metrics::describe_histogram!(metric_name, unit, description);
                });

                metrics::histogram!(metric_name).record(duration);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use metrics::{Key, Label};
    use metrics_util::CompositeKey;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use super::*;

    #[test]
    fn test_counter_and_histogram_metrics() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        let full = CounterMetric::queue_full();
        let cqe = CounterMetric::cqe_error(0x501);
        let reclaimed = CounterMetric::reclaimed(ReclaimPath::Worker, 7);
        let wait = HistogramMetric::task_wait(Duration::from_secs(2));

        let snapshot = metrics::with_local_recorder(&recorder, || {
            full.clone().emit();
            full.clone().emit();
            cqe.clone().emit();
            reclaimed.clone().emit();
            wait.clone().emit();

            snapshotter.snapshot()
        });

        #[expect(clippy::mutable_key_type)]
        let snapshot = snapshot.into_hashmap();
        assert_eq!(snapshot.len(), 4);

        let key = CompositeKey::new(metrics_util::MetricKind::Counter, full.name().into());
        assert_eq!(snapshot.get(&key).unwrap().2, DebugValue::Counter(2));

        let key = CompositeKey::new(
            metrics_util::MetricKind::Counter,
            Key::from_parts(cqe.name(), vec![Label::new("code", "0x501")]),
        );
        assert_eq!(snapshot.get(&key).unwrap().2, DebugValue::Counter(1));

        let key = CompositeKey::new(
            metrics_util::MetricKind::Counter,
            Key::from_parts(reclaimed.name(), vec![Label::new("path", "worker")]),
        );
        assert_eq!(snapshot.get(&key).unwrap().2, DebugValue::Counter(7));

        let key = CompositeKey::new(metrics_util::MetricKind::Histogram, wait.name().into());
        let value = &snapshot.get(&key).unwrap().2;
        assert!(
            matches!(value, DebugValue::Histogram(h) if h.len() == 1 && h[0].0 == 2.0),
            "histogram does not hold the recorded wait"
        );
    }
}
