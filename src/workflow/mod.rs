// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workflow orchestration.
//!
//! - [`WorkflowState`]: everything a session has produced so far
//! - [`Supervisor`]: pure routing and termination decisions
//! - [`WorkflowDriver`]: the tick loop that executes those decisions

mod driver;
pub mod state;
mod supervisor;

pub use driver::{StateSnapshot, WorkflowDriver, WorkflowOutcome, DEFAULT_SESSION_TIMEOUT};
pub use state::{Approval, ErrorRecord, StatePatch, Validation, WorkflowState};
pub use supervisor::{
    Advice, Next, RoutingAdvisor, RoutingDecision, Supervisor, SupervisorPolicy, TerminationReason,
};
