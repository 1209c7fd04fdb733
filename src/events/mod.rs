// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session event fan-in.
//!
//! Every producer in a session writes into one [`EventBus`]; the streaming
//! layer drains it toward the connected client.

mod bus;
mod types;

pub use bus::{DropCounts, EventBus, PublishOutcome};
pub use types::{EventKind, EventPayload, ProgressEvent};
