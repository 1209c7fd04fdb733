// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client streaming boundary.
//!
//! Clients connect over a local socket, open a session with `init`, start a
//! workflow with `chat` and receive the session's events as they happen.

pub mod error;
pub mod protocol;
mod server;
pub mod transport;

pub use error::{StreamError, StreamResult};
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{InvokerFactory, ProcessPool, StreamServer};
