// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Foreman - a supervisor-driven multi-agent orchestrator.
//!
//! A supervisor decides, one step at a time, which specialised worker
//! (research, design, code, review, approval, respond) runs next. Each worker
//! lives in its own tool-server subprocess spoken to over newline-delimited
//! JSON. Progress streams to connected clients as it happens.
//!
//! # Architecture
//!
//! - [`types`] - Worker roster, modes and the worker call contract
//! - [`error`] - Error taxonomy and result aliases
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Tracing, metrics, and observability infrastructure
//! - [`process`] - Tool-server processes and the process manager
//! - [`events`] - Per-session event bus with priority-based dropping
//! - [`workflow`] - Workflow state, supervisor and driver loop
//! - [`stream`] - Client streaming protocol, transport and server
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use foreman::config::{load_config, CliOptions};
//! use foreman::events::EventBus;
//! use foreman::process::ProcessManager;
//! use foreman::workflow::{Supervisor, WorkflowDriver, WorkflowState};
//! use foreman::types::Mode;
//!
//! let config = load_config(".", CliOptions::default())?;
//! let bus = EventBus::new("session-1", config.event_capacity);
//! let manager = ProcessManager::new(bus.clone(), ".", config.worker_specs());
//! let state = WorkflowState::new("session-1", Mode::Explain, "what does main do?", ".");
//! let mut driver = WorkflowDriver::new(
//!     Supervisor::new(config.supervisor_policy()),
//!     Arc::new(manager),
//!     bus,
//!     state,
//! );
//! let outcome = driver.run().await;
//! println!("{}", outcome.final_response);
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod process;
pub mod stream;
pub mod telemetry;
pub mod types;
pub mod workflow;

// Re-export commonly used types at crate root
pub use error::{ConfigError, ErrorKind, Result};
pub use events::{EventBus, EventKind, EventPayload, ProgressEvent};
pub use process::{CallFailure, CallResult, ProcessManager, WorkerInvoker};
pub use types::{AgentId, Artifacts, Mode, WorkerInput, WorkerOutput};
pub use workflow::{
    RoutingDecision, Supervisor, SupervisorPolicy, TerminationReason, WorkflowDriver,
    WorkflowOutcome, WorkflowState,
};

/// Foreman version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
