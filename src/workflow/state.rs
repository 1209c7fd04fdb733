// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workflow state: the single record of a session's progress.
//!
//! Owned by the driver. Every mutation goes through [`WorkflowState::begin_tick`],
//! [`WorkflowState::record_call`] or [`WorkflowState::apply_patch`].

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;
use crate::process::CallResult;
use crate::types::{AgentId, Artifacts, Mode, WorkerOutput};

use super::supervisor::TerminationReason;

/// Well-known artifact keys the routing table looks at.
pub mod keys {
    pub const DESIGN: &str = "design";
    pub const CODE: &str = "code";
    pub const RESEARCH: &str = "research";
    pub const REVIEW: &str = "review";
    pub const APPROVAL: &str = "approval";
    pub const FINAL_RESPONSE: &str = "final_response";
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub agent: AgentId,
    pub kind: ErrorKind,
    pub message: String,
    pub iteration: u32,
}

/// Result of the most recent review.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "errors", rename_all = "snake_case")]
pub enum Validation {
    #[default]
    NotRun,
    Passed,
    Failed(Vec<String>),
}

/// Result of the most recent human approval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "feedback", rename_all = "snake_case")]
pub enum Approval {
    #[default]
    NotRequested,
    Approved,
    Rejected(String),
}

/// Partial update produced by the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_response: Option<String>,
}

impl StatePatch {
    pub fn is_empty(&self) -> bool {
        self.termination.is_none() && self.final_response.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: String,
    pub mode: Mode,
    pub user_query: String,
    pub workspace_path: String,
    pub last_agent: Option<AgentId>,
    /// Ticks started so far, including the one that decides END.
    pub iteration: u32,
    pub per_agent_call_count: BTreeMap<AgentId, u32>,
    pub artifacts: Artifacts,
    pub research_context: Option<Value>,
    /// Worker that asked for a research side-trip, cleared once research returns.
    pub research_requested_by: Option<AgentId>,
    pub errors: Vec<ErrorRecord>,
    pub validation: Validation,
    pub approval: Approval,
    pub response_ready: bool,
    pub final_response: Option<String>,
    /// Consecutive calls per agent that left artifacts and error count where
    /// that agent's previous call left them. A call that changes them counts as 1.
    pub calls_since_progress: BTreeMap<AgentId, u32>,
    pub termination: Option<TerminationReason>,
    /// Progress fingerprint as each agent's last call left it.
    #[serde(skip)]
    progress_marks: BTreeMap<AgentId, u64>,
}

impl WorkflowState {
    pub fn new(
        session_id: impl Into<String>,
        mode: Mode,
        user_query: impl Into<String>,
        workspace_path: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            mode,
            user_query: user_query.into(),
            workspace_path: workspace_path.into(),
            last_agent: None,
            iteration: 0,
            per_agent_call_count: BTreeMap::new(),
            artifacts: Artifacts::new(),
            research_context: None,
            research_requested_by: None,
            errors: Vec::new(),
            validation: Validation::default(),
            approval: Approval::default(),
            response_ready: false,
            final_response: None,
            calls_since_progress: BTreeMap::new(),
            termination: None,
            progress_marks: BTreeMap::new(),
        }
    }

    pub fn has_artifact(&self, key: &str) -> bool {
        self.artifacts.get(key).is_some_and(|v| !v.is_null())
    }

    pub fn call_count(&self, agent: AgentId) -> u32 {
        self.per_agent_call_count.get(&agent).copied().unwrap_or(0)
    }

    /// Stall count for `agent`, or 0 when anyone changed artifacts or errors
    /// since its last call.
    pub fn calls_without_progress(&self, agent: AgentId) -> u32 {
        match self.progress_marks.get(&agent) {
            Some(&mark) if mark == self.progress_fingerprint() => {
                self.calls_since_progress.get(&agent).copied().unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn total_calls(&self) -> u32 {
        self.per_agent_call_count.values().sum()
    }

    pub fn is_finished(&self) -> bool {
        self.termination.is_some()
    }

    /// Start a driver tick.
    pub fn begin_tick(&mut self) {
        self.iteration += 1;
    }

    /// Merge the outcome of one worker call.
    pub fn record_call(&mut self, result: &CallResult) {
        let agent = result.agent;
        let before = self.progress_fingerprint();
        self.last_agent = Some(agent);
        *self.per_agent_call_count.entry(agent).or_insert(0) += 1;

        match &result.outcome {
            Ok(output) => self.merge_output(agent, output),
            Err(failure) => self.push_error(agent, failure.kind(), failure.to_string()),
        }

        if agent == AgentId::Research {
            self.research_requested_by = None;
        }

        self.track_progress(agent, before);
    }

    fn merge_output(&mut self, agent: AgentId, output: &WorkerOutput) {
        for (key, value) in &output.artifacts {
            self.artifacts.insert(key.clone(), value.clone());
        }

        match agent {
            AgentId::Research => {
                if let Some(context) = output
                    .artifacts
                    .get(keys::RESEARCH)
                    .cloned()
                    .or_else(|| (!output.artifacts.is_empty()).then(|| Value::Object(output.artifacts.clone())))
                {
                    self.research_context = Some(context);
                }
            }
            AgentId::Code => {
                if output.errors.is_empty() {
                    // New code invalidates earlier verdicts.
                    self.validation = Validation::NotRun;
                    self.approval = Approval::NotRequested;
                }
            }
            AgentId::Review => {
                self.validation = if output.errors.is_empty() {
                    Validation::Passed
                } else {
                    Validation::Failed(output.errors.clone())
                };
            }
            AgentId::Approval => {
                self.approval = approval_from(output);
            }
            AgentId::Respond => {
                if let Some(response) = output.artifacts.get(keys::FINAL_RESPONSE) {
                    let text = match response {
                        Value::String(text) => text.clone(),
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    if !text.trim().is_empty() {
                        self.final_response = Some(text);
                        self.response_ready = true;
                    }
                }
            }
            AgentId::Design => {}
        }

        // Review and approval findings are verdicts, not failures.
        if !output.errors.is_empty() && !matches!(agent, AgentId::Review | AgentId::Approval) {
            self.push_error(agent, ErrorKind::WorkerReportedError, output.errors.join("; "));
        }

        if output.needs_research && agent != AgentId::Research {
            self.research_requested_by = Some(agent);
        }
    }

    fn push_error(&mut self, agent: AgentId, kind: ErrorKind, message: String) {
        self.errors.push(ErrorRecord {
            agent,
            kind,
            message,
            iteration: self.iteration,
        });
    }

    /// Compare with where this agent's previous call left the state (or with
    /// the state before this call, on its first call).
    fn track_progress(&mut self, agent: AgentId, before: u64) {
        let after = self.progress_fingerprint();
        let baseline = self.progress_marks.insert(agent, after).unwrap_or(before);
        let counter = self.calls_since_progress.entry(agent).or_insert(0);
        if after == baseline {
            *counter += 1;
        } else {
            *counter = 1;
        }
    }

    /// Artifacts plus error count. Review and approval verdicts are left out:
    /// routing toggles them on every round trip.
    fn progress_fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        serde_json::to_string(&self.artifacts)
            .unwrap_or_default()
            .hash(&mut hasher);
        self.errors.len().hash(&mut hasher);
        hasher.finish()
    }

    /// Apply a supervisor patch.
    pub fn apply_patch(&mut self, patch: &StatePatch) {
        if let Some(ref termination) = patch.termination {
            self.termination = Some(termination.clone());
        }
        if let Some(ref response) = patch.final_response {
            self.final_response = Some(response.clone());
        }
    }

    /// Names of the artifacts produced so far, for degraded responses.
    pub fn artifact_summary(&self) -> String {
        if self.artifacts.is_empty() {
            "none".to_string()
        } else {
            self.artifacts.keys().cloned().collect::<Vec<_>>().join(", ")
        }
    }
}

fn approval_from(output: &WorkerOutput) -> Approval {
    if !output.errors.is_empty() {
        return Approval::Rejected(output.errors.join("; "));
    }
    let verdict = output.artifacts.get(keys::APPROVAL);
    let approved = verdict
        .and_then(|v| v.get("approved"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    if approved {
        Approval::Approved
    } else {
        let feedback = verdict
            .and_then(|v| v.get("feedback"))
            .and_then(Value::as_str)
            .unwrap_or("rejected without feedback");
        Approval::Rejected(feedback.to_string())
    }
}
