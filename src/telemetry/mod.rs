// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logs and call metrics.
//!
//! Every worker call runs inside a [`CallSpan`], which times it and feeds
//! [`GLOBAL_METRICS`]. Respawns and event bus drops are counted there too.
//!
//! ```rust,ignore
//! use foreman::telemetry::{init_telemetry, TelemetryConfig, GLOBAL_METRICS};
//!
//! let _guard = init_telemetry(&TelemetryConfig::server())?;
//! // ... run sessions ...
//! println!("{}", GLOBAL_METRICS.snapshot().format_report());
//! ```
//!
//! Metrics recording is compiled in only with the `telemetry` feature.

mod init;
pub mod metrics;
mod spans;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{
    Histogram, Metrics, MetricsSnapshot, OperationMetrics, WorkerMetrics, GLOBAL_METRICS,
};
pub use spans::{CallSpan, TimedOperation};
