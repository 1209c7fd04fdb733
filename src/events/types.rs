// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Event records flowing from producers to the streaming layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::process::Health;

/// Coarse event class. Decides drop priority under backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Progress,
    Log,
    Result,
    Error,
}

impl EventKind {
    /// Whether the bus may discard this kind when full.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Log | Self::Progress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Progress => "progress",
            Self::Log => "log",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

/// Event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// `$/progress` notification from a tool server.
    Progress {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pct: Option<f64>,
    },

    /// `$/log` notification or a stderr line from a tool server.
    Log { level: String, message: String },

    /// Tool-server health transition.
    Health { health: Health, restart_count: u32 },

    /// A routing decision taken by the supervisor.
    Decision {
        next: String,
        instructions: String,
        confidence: f64,
        iteration: u32,
    },

    /// The driver handed a call to a worker.
    CallDispatched { iteration: u32 },

    /// A worker call retired.
    CallFinished {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
    },

    /// The session ended.
    Result {
        final_response: String,
        termination: String,
        degraded: bool,
    },

    /// A failure the client should see.
    Error { code: String, message: String },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Progress { .. } => EventKind::Progress,
            Self::Log { .. } => EventKind::Log,
            Self::Health { .. }
            | Self::Decision { .. }
            | Self::CallDispatched { .. }
            | Self::CallFinished { .. } => EventKind::Status,
            Self::Result { .. } => EventKind::Result,
            Self::Error { .. } => EventKind::Error,
        }
    }

    pub fn progress(message: impl Into<String>, pct: Option<f64>) -> Self {
        Self::Progress {
            message: message.into(),
            pct,
        }
    }

    pub fn log(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Log {
            level: level.into(),
            message: message.into(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// An immutable record on the event bus.
///
/// `sequence` is per agent, strictly increasing within a session, and never
/// reused, including across tool-server respawns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: String,
    pub agent: String,
    pub sequence: u64,
    pub kind: EventKind,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        session_id: impl Into<String>,
        agent: impl Into<String>,
        sequence: u64,
        payload: EventPayload,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent: agent.into(),
            sequence,
            kind: payload.kind(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_kinds() {
        assert_eq!(EventPayload::progress("x", None).kind(), EventKind::Progress);
        assert_eq!(EventPayload::log("info", "x").kind(), EventKind::Log);
        assert_eq!(
            EventPayload::CallDispatched { iteration: 1 }.kind(),
            EventKind::Status
        );
        assert_eq!(EventPayload::error("timeout", "x").kind(), EventKind::Error);
    }

    #[test]
    fn test_droppable_kinds() {
        assert!(EventKind::Log.is_droppable());
        assert!(EventKind::Progress.is_droppable());
        assert!(!EventKind::Status.is_droppable());
        assert!(!EventKind::Result.is_droppable());
        assert!(!EventKind::Error.is_droppable());
    }

    #[test]
    fn test_event_kind_follows_payload() {
        let event = ProgressEvent::new("s1", "design", 4, EventPayload::progress("halfway", Some(50.0)));
        assert_eq!(event.kind, EventKind::Progress);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "progress");
        assert_eq!(json["payload"]["pct"], 50.0);
        assert_eq!(json["sequence"], 4);
    }
}
