// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the Foreman orchestrator.
//!
//! This module provides the error taxonomy shared by the process layer and the
//! workflow layer, using `thiserror` for ergonomic error definitions and
//! `anyhow` for error propagation in the binaries.
//!
//! Process-level failures (spawn, timeout, crash, malformed output) never
//! escape as Rust errors: they are folded into a structured call result by the
//! process manager and classified here with [`ErrorKind`] when they are merged
//! into workflow state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of every failure the orchestrator records.
///
/// The first five kinds are recovered locally by the process manager into a
/// failed call result. `WorkerReportedError` is surfaced by a worker itself.
/// The termination kinds end a session with a degraded final response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SpawnFailure,
    Timeout,
    ProcessCrashed,
    MalformedMessage,
    WorkerReportedError,
    LoopDetected,
    IterationCapReached,
    ErrorThresholdReached,
    SessionTimeout,
    Cancelled,
}

impl ErrorKind {
    /// Whether this kind ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::LoopDetected
                | Self::IterationCapReached
                | Self::ErrorThresholdReached
                | Self::SessionTimeout
                | Self::Cancelled
        )
    }

    /// Whether the process manager recovers this kind without involving the driver.
    pub fn is_process_level(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailure | Self::Timeout | Self::ProcessCrashed | Self::MalformedMessage
        )
    }

    /// Stable snake_case name used in events and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpawnFailure => "spawn_failure",
            Self::Timeout => "timeout",
            Self::ProcessCrashed => "process_crashed",
            Self::MalformedMessage => "malformed_message",
            Self::WorkerReportedError => "worker_reported_error",
            Self::LoopDetected => "loop_detected",
            Self::IterationCapReached => "iteration_cap_reached",
            Self::ErrorThresholdReached => "error_threshold_reached",
            Self::SessionTimeout => "session_timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl ConfigError {
    /// Create an invalid value error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
