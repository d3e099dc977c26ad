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

use accelq_common::report::codes;
use accelq_common::{CompletionReport, TaskKind};

/// How a completion report is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReportClass {
    /// No error bit
    Success,
    /// Error bit with a code the queue tolerates, handled as success
    Benign,
    /// Error bit with a transient code, the task is sent once more
    Retry,
    Fatal,
}

/// A code that is benign for one kind, or for every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BenignRule {
    kind: Option<TaskKind>,
    code: u32,
}

/// Error codes a queue treats as warnings or as retryable.
///
/// Queues of different hardware generations disagree on which codes are
/// harmless, so the table is part of the stream configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCodeTable {
    benign: Vec<BenignRule>,
    retryable: Vec<u32>,
}

impl ErrorCodeTable {
    /// A table in which every error is fatal.
    pub fn empty() -> Self {
        Self {
            benign: Vec::new(),
            retryable: Vec::new(),
        }
    }

    /// Overflow codes are benign for every kind. End of sequence, execute
    /// abort and cpu timeout are benign for the wait kinds. The transient
    /// media code is retried once.
    pub fn standard() -> Self {
        let mut table = Self::empty()
            .with_benign(None, codes::AICORE_OVERFLOW)
            .with_benign(None, codes::AIVEC_OVERFLOW)
            .with_benign(None, codes::SDMA_OVERFLOW)
            .with_retryable(codes::MEDIA_TRANSIENT);
        for code in [codes::END_OF_SEQUENCE, codes::EXECUTE_ABORT, codes::AICPU_TIMEOUT] {
            table = table.with_benign(Some(TaskKind::NotifyWait), code);
        }
        table.with_benign(Some(TaskKind::EventWait), codes::END_OF_SEQUENCE)
    }

    /// Treat `code` as a warning for `kind`, or for every kind when `None`.
    pub fn with_benign(mut self, kind: Option<TaskKind>, code: u32) -> Self {
        self.benign.push(BenignRule { kind, code });
        self
    }

    /// Retry a task once when its report carries `code`.
    pub fn with_retryable(mut self, code: u32) -> Self {
        self.retryable.push(code);
        self
    }

    pub fn is_benign(&self, kind: TaskKind, code: u32) -> bool {
        self.benign
            .iter()
            .any(|r| r.code == code && r.kind.is_none_or(|k| k == kind))
    }

    pub fn is_retryable(&self, code: u32) -> bool {
        self.retryable.contains(&code)
    }

    /// Classify `report` for a task that has already been retried
    /// `retry_count` times.
    pub(crate) fn classify(&self, report: &CompletionReport, retry_count: u8) -> ReportClass {
        if !report.is_error() {
            ReportClass::Success
        } else if retry_count == 0 && self.is_retryable(report.error_code) {
            ReportClass::Retry
        } else if self.is_benign(report.kind, report.error_code) {
            ReportClass::Benign
        } else {
            ReportClass::Fatal
        }
    }
}

impl Default for ErrorCodeTable {
    fn default() -> Self {
        Self::standard()
    }
}
