// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Span helpers for consistent instrumentation.

use std::time::{Duration, Instant};
use tracing::{info_span, Span};

/// RAII guard for timing one worker call.
///
/// Records the agent, correlation id, duration and outcome to metrics.
pub struct CallSpan {
    agent: &'static str,
    start: Instant,
    span: Span,
}

impl CallSpan {
    /// Start a new call span.
    pub fn start(agent: &'static str, correlation_id: u64) -> Self {
        let span = info_span!(
            "worker_call",
            agent = agent,
            correlation_id = correlation_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        Self {
            agent,
            start: Instant::now(),
            span,
        }
    }

    /// Get the underlying tracing span.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Finish the span. `failure` is the failure code of an unsuccessful call.
    pub fn finish(self, failure: Option<&str>) -> Duration {
        let duration = self.start.elapsed();

        self.span.record("duration_ms", duration.as_secs_f64() * 1000.0);
        self.span.record("outcome", failure.unwrap_or("ok"));

        #[cfg(feature = "telemetry")]
        super::metrics::GLOBAL_METRICS.record_call(self.agent, duration, failure);

        tracing::debug!(parent: &self.span, "Worker call complete");
        duration
    }
}

/// RAII guard for timing any operation.
///
/// Records the operation name and duration to metrics when finished.
pub struct TimedOperation {
    name: &'static str,
    start: Instant,
}

impl TimedOperation {
    pub fn start(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Get elapsed time so far.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish and record the operation.
    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        #[cfg(feature = "telemetry")]
        super::metrics::GLOBAL_METRICS.record_operation(self.name, duration);
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_span_lifecycle() {
        let span = CallSpan::start("design", 7);
        let duration = span.finish(None);
        assert!(duration < Duration::from_secs(5));
    }

    #[test]
    fn test_call_span_failure() {
        let span = CallSpan::start("code", 8);
        span.finish(Some("timeout"));
    }

    #[test]
    fn test_timed_operation() {
        let op = TimedOperation::start("test_op");
        std::thread::sleep(Duration::from_millis(1));
        assert!(op.elapsed().as_micros() > 0);
        op.finish();
    }

    #[cfg(feature = "telemetry")]
    #[test]
    fn test_timed_operation_is_recorded() {
        TimedOperation::start("spans.recorded").finish();
        let metrics = super::super::metrics::GLOBAL_METRICS
            .operation_metrics("spans.recorded")
            .unwrap();
        assert!(metrics.count >= 1);
    }
}
