// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The decision engine.
//!
//! [`Supervisor::decide`] is a pure function of [`WorkflowState`] and the
//! policy. Termination guards always run first, in a fixed order; only then is
//! a next worker chosen, and the loop guard gets the final word on it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::types::{AgentId, Mode};

use super::state::{keys, Approval, StatePatch, Validation, WorkflowState};

// ============================================================================
// Decisions
// ============================================================================

/// Where the workflow goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Next {
    Agent(AgentId),
    End,
}

impl Next {
    pub fn agent(&self) -> Option<AgentId> {
        match self {
            Self::Agent(agent) => Some(*agent),
            Self::End => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent(agent) => agent.as_str(),
            Self::End => "END",
        }
    }
}

impl fmt::Display for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    /// The respond worker produced a final response.
    Completed,
    ErrorThreshold,
    IterationCap,
    LoopDetected { agent: AgentId },
    SessionTimeout,
    Cancelled,
}

impl TerminationReason {
    pub fn is_degraded(&self) -> bool {
        !matches!(self, Self::Completed)
    }

    /// Error kind reported to clients for a degraded ending.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Completed => None,
            Self::ErrorThreshold => Some(ErrorKind::ErrorThresholdReached),
            Self::IterationCap => Some(ErrorKind::IterationCapReached),
            Self::LoopDetected { .. } => Some(ErrorKind::LoopDetected),
            Self::SessionTimeout => Some(ErrorKind::SessionTimeout),
            Self::Cancelled => Some(ErrorKind::Cancelled),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ErrorThreshold => "error_threshold",
            Self::IterationCap => "iteration_cap",
            Self::LoopDetected { .. } => "loop_detected",
            Self::SessionTimeout => "session_timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoopDetected { agent } => write!(f, "loop_detected ({})", agent),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub next_agent: Next,
    pub instructions: String,
    pub state_patch: StatePatch,
    /// 0.0 to 1.0. Rule-table and guard decisions are always 1.0.
    pub confidence: f64,
}

impl RoutingDecision {
    fn route(agent: AgentId, instructions: String, confidence: f64) -> Self {
        Self {
            next_agent: Next::Agent(agent),
            instructions,
            state_patch: StatePatch::default(),
            confidence,
        }
    }

    fn end(termination: TerminationReason, final_response: String) -> Self {
        Self {
            next_agent: Next::End,
            instructions: String::new(),
            state_patch: StatePatch {
                termination: Some(termination),
                final_response: Some(final_response),
            },
            confidence: 1.0,
        }
    }

    pub fn is_end(&self) -> bool {
        self.next_agent == Next::End
    }

    pub fn termination(&self) -> Option<&TerminationReason> {
        self.state_patch.termination.as_ref()
    }
}

// ============================================================================
// Policy and Advisor
// ============================================================================

/// Limits the supervisor enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorPolicy {
    pub max_iterations: u32,
    /// Calls allowed to one worker without a visible state change.
    pub max_calls_per_worker: u32,
    /// The session ends once recorded errors exceed this.
    pub error_threshold: usize,
    /// Insert the approval worker before responding in create and fix modes.
    pub require_approval: bool,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_calls_per_worker: 3,
            error_threshold: 3,
            require_approval: false,
        }
    }
}

/// A proposal from an advisor.
#[derive(Debug, Clone, PartialEq)]
pub struct Advice {
    /// Proposed worker name. Names outside the roster are ignored.
    pub agent: String,
    pub confidence: f64,
}

/// Optional non-deterministic routing hint, e.g. a model-assisted choice.
///
/// Runs after the termination guards and before the loop guard, so it can
/// never end a session or bypass a limit. Errors and out-of-roster proposals
/// fall back to the rule table.
pub trait RoutingAdvisor: Send + Sync {
    fn advise(&self, state: &WorkflowState) -> anyhow::Result<Option<Advice>>;
}

// ============================================================================
// Supervisor
// ============================================================================

#[derive(Clone, Default)]
pub struct Supervisor {
    policy: SupervisorPolicy,
    advisor: Option<Arc<dyn RoutingAdvisor>>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("policy", &self.policy)
            .field("advisor", &self.advisor.is_some())
            .finish()
    }
}

impl Supervisor {
    pub fn new(policy: SupervisorPolicy) -> Self {
        Self {
            policy,
            advisor: None,
        }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn RoutingAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.policy
    }

    /// Decide the next step.
    pub fn decide(&self, state: &WorkflowState) -> RoutingDecision {
        if state.response_ready {
            let response = state.final_response.clone().unwrap_or_default();
            return RoutingDecision::end(TerminationReason::Completed, response);
        }

        if state.errors.len() > self.policy.error_threshold {
            return RoutingDecision::end(TerminationReason::ErrorThreshold, error_summary(state));
        }

        if state.iteration > self.policy.max_iterations {
            return RoutingDecision::end(
                TerminationReason::IterationCap,
                format!(
                    "Stopped after reaching the limit of {} iterations before the task was complete. \
                     Partial results: {}.",
                    self.policy.max_iterations,
                    state.artifact_summary()
                ),
            );
        }

        let (candidate, confidence) = self.candidate(state);

        let stalled = state.calls_without_progress(candidate);
        if stalled >= self.policy.max_calls_per_worker {
            warn!(agent = %candidate, calls = stalled, "Loop guard tripped");
            return RoutingDecision::end(
                TerminationReason::LoopDetected { agent: candidate },
                format!(
                    "Stopped because the {} worker was called {} times without making progress. \
                     Partial results: {}.",
                    candidate,
                    stalled,
                    state.artifact_summary()
                ),
            );
        }

        RoutingDecision::route(candidate, instructions_for(candidate, state), confidence)
    }

    fn candidate(&self, state: &WorkflowState) -> (AgentId, f64) {
        if state.research_requested_by.is_some() {
            return (AgentId::Research, 1.0);
        }
        if let Some(advised) = self.advise(state) {
            return advised;
        }
        (rule_table(state, self.policy.require_approval), 1.0)
    }

    fn advise(&self, state: &WorkflowState) -> Option<(AgentId, f64)> {
        let advisor = self.advisor.as_ref()?;
        match advisor.advise(state) {
            Ok(Some(advice)) => match advice.agent.parse::<AgentId>() {
                Ok(agent) => {
                    let confidence = if advice.confidence.is_finite() {
                        advice.confidence.clamp(0.0, 1.0)
                    } else {
                        0.0
                    };
                    debug!(agent = %agent, confidence, "Advisor proposal accepted");
                    Some((agent, confidence))
                }
                Err(e) => {
                    warn!(proposal = %advice.agent, "Ignoring advisor proposal: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Routing advisor failed, using rule table: {}", e);
                None
            }
        }
    }
}

/// Deterministic routing by mode.
fn rule_table(state: &WorkflowState, require_approval: bool) -> AgentId {
    match state.mode {
        Mode::Explain => {
            if state.research_context.is_none() {
                AgentId::Research
            } else {
                AgentId::Respond
            }
        }
        Mode::Review => {
            if state.validation == Validation::NotRun && !state.has_artifact(keys::REVIEW) {
                AgentId::Review
            } else {
                AgentId::Respond
            }
        }
        Mode::Create if !state.has_artifact(keys::DESIGN) => AgentId::Design,
        Mode::Create | Mode::Fix => {
            if !state.has_artifact(keys::CODE) {
                return AgentId::Code;
            }
            match &state.validation {
                Validation::NotRun => AgentId::Review,
                Validation::Failed(_) => AgentId::Code,
                Validation::Passed if require_approval => match state.approval {
                    Approval::NotRequested => AgentId::Approval,
                    Approval::Rejected(_) => AgentId::Code,
                    Approval::Approved => AgentId::Respond,
                },
                Validation::Passed => AgentId::Respond,
            }
        }
    }
}

fn instructions_for(agent: AgentId, state: &WorkflowState) -> String {
    let query = &state.user_query;
    match agent {
        AgentId::Research => match state.research_requested_by {
            Some(requester) => format!(
                "Gather the context the {} worker needs to continue with: {}",
                requester, query
            ),
            None => format!("Research the workspace to answer: {}", query),
        },
        AgentId::Design => {
            let mut text = format!("Produce a design for: {}", query);
            if state.research_context.is_some() {
                text.push_str("\nResearch findings are included in the prior artifacts.");
            }
            text
        }
        AgentId::Code => {
            if let Validation::Failed(errors) = &state.validation {
                let mut text = String::from("Fix the following validation errors:");
                for error in errors {
                    text.push_str("\n- ");
                    text.push_str(error);
                }
                text
            } else if let Approval::Rejected(feedback) = &state.approval {
                format!("Revise the code to address the reviewer's feedback: {}", feedback)
            } else if state.mode == Mode::Fix {
                format!("Fix the reported problem: {}", query)
            } else {
                format!("Implement the design for: {}", query)
            }
        }
        AgentId::Review => match state.mode {
            Mode::Review => format!("Review the workspace code: {}", query),
            _ => format!("Validate the generated code for: {}", query),
        },
        AgentId::Approval => format!("Ask the user to approve the changes made for: {}", query),
        AgentId::Respond => match state.mode {
            Mode::Explain => format!("Answer the question using the research findings: {}", query),
            Mode::Review => format!("Summarize the review findings for: {}", query),
            _ => format!("Summarize the result for the user: {}", query),
        },
    }
}

fn error_summary(state: &WorkflowState) -> String {
    let recent: Vec<String> = state
        .errors
        .iter()
        .rev()
        .take(3)
        .map(|e| format!("{} ({}): {}", e.agent, e.kind, e.message))
        .collect();
    format!(
        "Stopped after {} errors. Most recent: {}. Partial results: {}.",
        state.errors.len(),
        recent.join("; "),
        state.artifact_summary()
    )
}
