// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tool-server wire protocol.
//!
//! Newline-delimited JSON over the subprocess's stdin/stdout.
//!
//! ```text
//! -> {"id": 7, "method": "review", "params": {...}}
//! <- {"method": "$/progress", "params": {"agent": "review", "message": "...", "pct": 40}}
//! <- {"id": 7, "result": {...}}
//!    or {"id": 7, "error": {"code": -32000, "message": "..."}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Version sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: u32 = 1;

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_PROGRESS: &str = "$/progress";
pub const METHOD_LOG: &str = "$/log";

/// Errors encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid params for {method}: {message}")]
    InvalidParams { method: String, message: String },
}

// ============================================================================
// Messages
// ============================================================================

/// Call request, orchestrator to tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// Error body of a terminal response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: i64,
    pub message: String,
}

/// Terminal response, tool server to orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(WireError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Out-of-band message without an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    pub fn progress(agent: &str, message: &str, pct: Option<f64>) -> Self {
        let mut params = serde_json::json!({ "agent": agent, "message": message });
        if let Some(pct) = pct {
            params["pct"] = serde_json::json!(pct);
        }
        Self {
            method: METHOD_PROGRESS.to_string(),
            params,
        }
    }

    pub fn log(level: &str, message: &str) -> Self {
        Self {
            method: METHOD_LOG.to_string(),
            params: serde_json::json!({ "level": level, "message": message }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressParams {
    #[serde(default)]
    pub agent: Option<String>,
    pub message: String,
    #[serde(default)]
    pub pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogParams {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub message: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Decoding
// ============================================================================

/// A classified line of tool-server output.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Terminal response for call `id`.
    Response {
        id: u64,
        outcome: Result<Value, WireError>,
    },
    /// Message carrying a call id but no usable result or error.
    MalformedResponse { id: u64, reason: String },
    Progress(ProgressParams),
    Log(LogParams),
    /// Valid JSON the orchestrator does not understand.
    Unrecognized(String),
}

/// Classify one line of tool-server stdout.
///
/// Only unparseable JSON is an error; anything else becomes an [`Incoming`].
pub fn parse_line(line: &str) -> Result<Incoming, ProtocolError> {
    let value: Value =
        serde_json::from_str(line.trim()).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let Some(object) = value.as_object() else {
        return Ok(Incoming::Unrecognized(truncate(line)));
    };

    if let Some(id) = object.get("id").and_then(Value::as_u64) {
        if let Some(result) = object.get("result") {
            return Ok(Incoming::Response {
                id,
                outcome: Ok(result.clone()),
            });
        }
        if let Some(error) = object.get("error") {
            return Ok(match serde_json::from_value::<WireError>(error.clone()) {
                Ok(error) => Incoming::Response {
                    id,
                    outcome: Err(error),
                },
                Err(e) => Incoming::MalformedResponse {
                    id,
                    reason: format!("bad error object: {}", e),
                },
            });
        }
        return Ok(Incoming::MalformedResponse {
            id,
            reason: "response has neither result nor error".to_string(),
        });
    }

    let method = object.get("method").and_then(Value::as_str).unwrap_or("");
    let params = object.get("params").cloned().unwrap_or(Value::Null);
    match method {
        METHOD_PROGRESS => serde_json::from_value(params)
            .map(Incoming::Progress)
            .map_err(|e| invalid_params(METHOD_PROGRESS, e)),
        METHOD_LOG => serde_json::from_value(params)
            .map(Incoming::Log)
            .map_err(|e| invalid_params(METHOD_LOG, e)),
        _ => Ok(Incoming::Unrecognized(truncate(line))),
    }
}

fn invalid_params(method: &str, err: serde_json::Error) -> ProtocolError {
    ProtocolError::InvalidParams {
        method: method.to_string(),
        message: err.to_string(),
    }
}

fn truncate(line: &str) -> String {
    const MAX: usize = 200;
    match line.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

/// Encode a message as one newline-terminated line.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    let mut json = serde_json::to_string(msg).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    json.push('\n');
    Ok(json)
}

/// Decode one line into a typed message.
pub fn decode<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, ProtocolError> {
    serde_json::from_str(line.trim()).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_encoding() {
        let line = encode(&Request::new(7, "review", json!({"instructions": "check"}))).unwrap();
        assert!(line.ends_with('\n'));
        insta::assert_snapshot!(line.trim(), @r#"{"id":7,"method":"review","params":{"instructions":"check"}}"#);
    }

    #[test]
    fn test_parse_success_response() {
        let incoming = parse_line(r#"{"id": 3, "result": {"artifacts": {}}}"#).unwrap();
        assert_eq!(
            incoming,
            Incoming::Response {
                id: 3,
                outcome: Ok(json!({"artifacts": {}}))
            }
        );
    }

    #[test]
    fn test_parse_error_response() {
        let incoming =
            parse_line(r#"{"id": 4, "error": {"code": -32000, "message": "model down"}}"#).unwrap();
        match incoming {
            Incoming::Response { id, outcome: Err(error) } => {
                assert_eq!(id, 4);
                assert_eq!(error.code, -32000);
                assert_eq!(error.message, "model down");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed_response() {
        assert!(matches!(
            parse_line(r#"{"id": 5}"#).unwrap(),
            Incoming::MalformedResponse { id: 5, .. }
        ));
        assert!(matches!(
            parse_line(r#"{"id": 6, "error": "nope"}"#).unwrap(),
            Incoming::MalformedResponse { id: 6, .. }
        ));
    }

    #[test]
    fn test_parse_progress_notification() {
        let incoming = parse_line(
            r#"{"method": "$/progress", "params": {"agent": "code", "message": "writing", "pct": 30}}"#,
        )
        .unwrap();
        match incoming {
            Incoming::Progress(params) => {
                assert_eq!(params.message, "writing");
                assert_eq!(params.pct, Some(30.0));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_log_defaults_level() {
        let incoming = parse_line(r#"{"method": "$/log", "params": {"message": "hi"}}"#).unwrap();
        assert_eq!(
            incoming,
            Incoming::Log(LogParams {
                level: "info".to_string(),
                message: "hi".to_string()
            })
        );
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_line("Loading model weights..."),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_line(r#"{"method": "$/progress", "params": {"pct": 1}}"#),
            Err(ProtocolError::InvalidParams { .. })
        ));
        assert!(matches!(
            parse_line(r#"{"method": "$/telemetry"}"#).unwrap(),
            Incoming::Unrecognized(_)
        ));
        assert!(matches!(parse_line("[1,2]").unwrap(), Incoming::Unrecognized(_)));
    }

    #[test]
    fn test_notification_helpers() {
        let note = Notification::progress("design", "outline", None);
        assert_eq!(note.method, METHOD_PROGRESS);
        assert!(note.params.get("pct").is_none());

        let line = encode(&Notification::log("warn", "slow")).unwrap();
        assert!(matches!(parse_line(&line).unwrap(), Incoming::Log(_)));
    }

    #[test]
    fn test_response_helpers_skip_empty_fields() {
        let line = encode(&Response::success(1, json!({}))).unwrap();
        assert!(!line.contains("error"));
        let line = encode(&Response::failure(2, 1, "bad")).unwrap();
        assert!(!line.contains("result"));
    }
}
