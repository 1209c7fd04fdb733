// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client streaming protocol.
//!
//! One JSON object per line in each direction, tagged by `type`.
//!
//! ```text
//! -> {"type":"init","workspace_path":"/repo"}
//! <- {"type":"initialized","session_id":"...","workspace_path":"/repo","resumed":false}
//! -> {"type":"chat","content":"explain the parser"}
//! <- {"type":"supervisor_event","decision":"research","confidence":1.0,...}
//! <- {"type":"progress","agent":"research","sequence":2,"message":"reading files"}
//! <- {"type":"result","final_response":"...","termination":"completed","degraded":false}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{EventPayload, ProgressEvent};
use crate::process::protocol::ProtocolError;
use crate::types::Mode;

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a session, or re-attach to a live one by id.
    Init {
        workspace_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Start a workflow for the user's request.
    Chat {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<Mode>,
    },

    /// Cancel the running workflow.
    Cancel,

    /// Ask for a snapshot of the session's state.
    Status,
}

/// Messages sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        version: String,
    },

    Initialized {
        session_id: String,
        workspace_path: String,
        resumed: bool,
    },

    /// Session or worker status.
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },

    /// Lifecycle or log event from a worker.
    AgentEvent {
        agent: String,
        sequence: u64,
        event: Value,
    },

    /// Routing decision.
    SupervisorEvent {
        sequence: u64,
        decision: String,
        confidence: f64,
        instructions: String,
        iteration: u32,
    },

    Progress {
        agent: String,
        sequence: u64,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pct: Option<f64>,
    },

    Result {
        final_response: String,
        termination: String,
        degraded: bool,
    },

    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn status(status: impl Into<String>, detail: Option<Value>) -> Self {
        Self::Status {
            agent: None,
            sequence: None,
            status: status.into(),
            detail,
        }
    }

    /// Translate a bus event for the wire.
    pub fn from_event(event: &ProgressEvent) -> Self {
        let agent = event.agent.clone();
        let sequence = event.sequence;
        match &event.payload {
            EventPayload::Progress { message, pct } => Self::Progress {
                agent,
                sequence,
                message: message.clone(),
                pct: *pct,
            },
            EventPayload::Health {
                health,
                restart_count,
            } => Self::Status {
                agent: Some(agent),
                sequence: Some(sequence),
                status: health.as_str().to_string(),
                detail: Some(serde_json::json!({ "restart_count": restart_count })),
            },
            EventPayload::Decision {
                next,
                instructions,
                confidence,
                iteration,
            } => Self::SupervisorEvent {
                sequence,
                decision: next.clone(),
                confidence: *confidence,
                instructions: instructions.clone(),
                iteration: *iteration,
            },
            EventPayload::Result {
                final_response,
                termination,
                degraded,
            } => Self::Result {
                final_response: final_response.clone(),
                termination: termination.clone(),
                degraded: *degraded,
            },
            EventPayload::Error { code, message } => Self::error(code.clone(), message.clone()),
            payload @ (EventPayload::Log { .. }
            | EventPayload::CallDispatched { .. }
            | EventPayload::CallFinished { .. }) => Self::AgentEvent {
                agent,
                sequence,
                event: serde_json::to_value(payload).unwrap_or(Value::Null),
            },
        }
    }

    /// Whether this is the last message of a workflow.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

pub use crate::process::protocol::{decode, encode};

/// Decode one client line.
pub fn decode_client(line: &str) -> Result<ClientMessage, ProtocolError> {
    decode(line)
}
