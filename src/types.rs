// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core type definitions shared across the orchestrator.
//!
//! - [`AgentId`] is the closed roster of worker roles. Routing never deals in
//!   free-form worker names.
//! - [`Mode`] is the kind of task a session is running.
//! - [`WorkerInput`] / [`WorkerOutput`] are the entire call contract between
//!   the orchestration core and a worker.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Opaque map of worker-produced outputs (design document, files, reports...).
pub type Artifacts = serde_json::Map<String, serde_json::Value>;

/// Name used for events emitted by the decision engine itself.
pub const SUPERVISOR: &str = "supervisor";

// ============================================================================
// Agent Roster
// ============================================================================

/// A worker role. Each role is backed by one tool-server process per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    /// Gathers context for the other workers.
    Research,
    /// Produces a design document.
    Design,
    /// Generates or modifies code.
    Code,
    /// Validates generated code.
    Review,
    /// Waits for a human to approve the result.
    Approval,
    /// Formats the final response for the user.
    Respond,
}

impl AgentId {
    /// Every worker role, in roster order.
    pub const ALL: [AgentId; 6] = [
        AgentId::Research,
        AgentId::Design,
        AgentId::Code,
        AgentId::Review,
        AgentId::Approval,
        AgentId::Respond,
    ];

    /// Stable identifier used in config files, events and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Design => "design",
            Self::Code => "code",
            Self::Review => "review",
            Self::Approval => "approval",
            Self::Respond => "respond",
        }
    }

    /// Wire method invoked on this worker's tool server.
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Design => "design",
            Self::Code => "generate_code",
            Self::Review => "review",
            Self::Approval => "request_approval",
            Self::Respond => "respond",
        }
    }

    /// Default call timeout for this role.
    pub fn default_timeout(&self) -> Duration {
        match self {
            Self::Research => Duration::from_secs(180),
            Self::Design => Duration::from_secs(120),
            Self::Code => Duration::from_secs(300),
            Self::Review => Duration::from_secs(120),
            // A human is on the other end.
            Self::Approval => Duration::from_secs(3600),
            Self::Respond => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "research" | "researcher" => Ok(Self::Research),
            "design" | "designer" => Ok(Self::Design),
            "code" | "coder" | "code_generation" => Ok(Self::Code),
            "review" | "reviewer" => Ok(Self::Review),
            "approval" | "hitl" | "human_approval" => Ok(Self::Approval),
            "respond" | "response" | "final_response" => Ok(Self::Respond),
            other => Err(format!("unknown agent: {}", other)),
        }
    }
}

// ============================================================================
// Workflow Mode
// ============================================================================

/// The kind of task a session is running. Selects the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Design, implement and validate something new.
    Create,
    /// Answer a question about the workspace.
    Explain,
    /// Repair existing code.
    Fix,
    /// Review existing code without changing it.
    Review,
}

impl Mode {
    /// Guess a mode from the user's request.
    ///
    /// Clients are expected to state the mode; this is only the fallback.
    pub fn infer(query: &str) -> Self {
        let q = query.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| q.contains(w));

        if has(&["fix", "bug", "broken", "error", "failing", "crash"]) {
            Self::Fix
        } else if has(&["review", "audit", "critique"]) {
            Self::Review
        } else if has(&["explain", "what is", "what does", "how does", "why does", "describe"]) {
            Self::Explain
        } else {
            Self::Create
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Explain => "explain",
            Self::Fix => "fix",
            Self::Review => "review",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "explain" => Ok(Self::Explain),
            "fix" => Ok(Self::Fix),
            "review" => Ok(Self::Review),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

// ============================================================================
// Worker Call Contract
// ============================================================================

/// Arguments every worker receives. Each call is self-contained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerInput {
    /// Instructions synthesized by the supervisor for this call.
    pub instructions: String,
    /// Workspace the session operates on.
    pub workspace_path: String,
    /// Artifacts produced so far in the session.
    #[serde(default)]
    pub prior_artifacts: Artifacts,
}

impl WorkerInput {
    /// Serialize into wire params.
    pub fn to_params(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// What a worker returns on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// New or updated artifacts, merged key by key into workflow state.
    #[serde(default)]
    pub artifacts: Artifacts,
    /// Problems the worker found or hit. For the review worker these are
    /// validation failures.
    #[serde(default)]
    pub errors: Vec<String>,
    /// The worker could not finish without more context.
    #[serde(default)]
    pub needs_research: bool,
}

impl WorkerOutput {
    /// Output carrying a single artifact.
    pub fn with_artifact(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let mut artifacts = Artifacts::new();
        artifacts.insert(key.into(), value.into());
        Self {
            artifacts,
            ..Default::default()
        }
    }

    /// Output reporting errors and nothing else.
    pub fn with_errors(errors: Vec<String>) -> Self {
        Self {
            errors,
            ..Default::default()
        }
    }

    /// Output asking for a research side-trip.
    pub fn needing_research() -> Self {
        Self {
            needs_research: true,
            ..Default::default()
        }
    }

    /// Whether the output carries neither artifacts nor errors.
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty() && self.errors.is_empty() && !self.needs_research
    }
}
