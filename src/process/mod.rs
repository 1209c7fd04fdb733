// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Tool-server processes.
//!
//! - [`protocol`]: newline-delimited JSON wire format
//! - [`ToolServerProcess`]: one subprocess with its read loop and correlation map
//! - [`ProcessManager`]: lazy start, health, respawn and per-role call serialization

mod manager;
pub mod protocol;
mod server_process;
mod types;

pub use manager::{ProcessManager, WorkerInvoker, WorkerStatus};
pub use protocol::ProtocolError;
pub use server_process::ToolServerProcess;
pub use types::{CallFailure, CallRequest, CallResult, Health, RestartPolicy, WorkerSpec};
