// SPDX-License-Identifier: MIT OR Apache-2.0

//! Threshold tracing for slow operations.
//!
//! When tracing is enabled, every data or service operation opens an
//! [`OperationSpan`]; spans that outlive their service threshold are
//! reported once at warn level with their duration. Fast operations cost
//! one `Instant::now` and log nothing.

use std::time::{Duration, Instant};

use tracing::warn;

/// A lightweight span covering one operation.
#[derive(Debug)]
pub struct OperationSpan {
    name: &'static str,
    detail: Option<String>,
    start: Instant,
    threshold: Option<Duration>,
}

impl OperationSpan {
    /// Start a span. `threshold` of `None` disables reporting.
    #[must_use]
    pub fn start(name: &'static str, threshold: Option<Duration>) -> Self {
        Self {
            name,
            detail: None,
            start: Instant::now(),
            threshold,
        }
    }

    /// Attach identifying detail (redacted upstream when required).
    #[must_use]
    pub fn with_detail(mut self, detail: String) -> Self {
        self.detail = Some(detail);
        self
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Close the span, reporting if it crossed the threshold.
    pub fn finish(self) {
        let Some(threshold) = self.threshold else {
            return;
        };
        let elapsed = self.start.elapsed();
        if elapsed >= threshold {
            match &self.detail {
                Some(detail) => warn!(
                    op = self.name,
                    %detail,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "operation exceeded tracing threshold"
                ),
                None => warn!(
                    op = self.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "operation exceeded tracing threshold"
                ),
            }
        }
    }
}
