// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Types shared by the tool-server process layer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::types::{AgentId, WorkerOutput};

// ============================================================================
// Health
// ============================================================================

/// Tool-server process health.
///
/// ```text
/// STARTING --handshake ok--> READY --2 timeouts--> UNHEALTHY
///    |                         |                        |
///    +--------exit------> CRASHED <--------exit---------+
/// ```
///
/// UNHEALTHY and CRASHED processes are replaced on the next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Starting,
    Ready,
    Unhealthy,
    Crashed,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Unhealthy => "unhealthy",
            Self::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Call Failures
// ============================================================================

/// Why a worker call produced no output.
///
/// Never raised to the driver as an error: it travels inside [`CallResult`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallFailure {
    #[error("failed to start tool server: {0}")]
    SpawnFailed(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("tool server exited: {0}")]
    ProcessCrashed(String),

    #[error("malformed message from tool server: {0}")]
    MalformedMessage(String),

    #[error("worker error {code}: {message}")]
    WorkerError { code: i64, message: String },

    #[error("call cancelled")]
    Cancelled,

    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),
}

impl CallFailure {
    /// Stable code carried in events and client messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SpawnFailed(_) => "spawn_failed",
            Self::Timeout(_) => "timeout",
            Self::ProcessCrashed(_) => "process_crashed",
            Self::MalformedMessage(_) => "malformed_message",
            Self::WorkerError { .. } => "worker_error",
            Self::Cancelled => "cancelled",
            Self::WorkerUnavailable(_) => "worker_unavailable",
        }
    }

    /// Classification recorded in workflow state.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SpawnFailed(_) => ErrorKind::SpawnFailure,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ProcessCrashed(_) | Self::WorkerUnavailable(_) => ErrorKind::ProcessCrashed,
            Self::MalformedMessage(_) => ErrorKind::MalformedMessage,
            Self::WorkerError { .. } => ErrorKind::WorkerReportedError,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

// ============================================================================
// Call Request / Result
// ============================================================================

/// One call as handed to a tool-server process.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Unique for the lifetime of the owning process.
    pub correlation_id: u64,
    pub agent: AgentId,
    pub method: String,
    pub arguments: serde_json::Value,
    pub timeout: Duration,
}

/// Outcome of one call, success or failure.
#[derive(Debug, Clone)]
pub struct CallResult {
    /// Zero when the call never reached a process.
    pub correlation_id: u64,
    pub agent: AgentId,
    pub outcome: Result<WorkerOutput, CallFailure>,
    pub duration: Duration,
}

impl CallResult {
    pub fn success(agent: AgentId, correlation_id: u64, output: WorkerOutput, duration: Duration) -> Self {
        Self {
            correlation_id,
            agent,
            outcome: Ok(output),
            duration,
        }
    }

    pub fn failure(agent: AgentId, correlation_id: u64, failure: CallFailure, duration: Duration) -> Self {
        Self {
            correlation_id,
            agent,
            outcome: Err(failure),
            duration,
        }
    }

    pub fn ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error_code(&self) -> Option<&'static str> {
        self.outcome.as_ref().err().map(CallFailure::code)
    }

    pub fn output(&self) -> Option<&WorkerOutput> {
        self.outcome.as_ref().ok()
    }
}

// ============================================================================
// Spawn Settings
// ============================================================================

/// How to launch one role's tool server.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Falls back to the session workspace.
    pub cwd: Option<PathBuf>,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl WorkerSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Respawn and shutdown policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Respawns allowed before a role is permanently unavailable.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive timeouts that mark a process UNHEALTHY.
    pub unhealthy_after_timeouts: u32,
    /// Time between SIGTERM and a forced kill.
    pub shutdown_grace: Duration,
    pub handshake_timeout: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            unhealthy_after_timeouts: 2,
            shutdown_grace: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl RestartPolicy {
    /// Delay before respawn number `attempt` (zero-based): base * 2^attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
