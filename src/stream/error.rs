// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client streaming error types.

use std::io;
use thiserror::Error;

/// Errors raised by the client-facing stream server.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Failed to bind the listening socket.
    #[error("Failed to bind stream endpoint: {0}")]
    BindFailed(String),

    /// Failed to accept an incoming connection.
    #[error("Failed to accept client connection: {0}")]
    AcceptFailed(String),

    /// Failed to read from a client.
    #[error("Failed to read from client: {0}")]
    ReadFailed(String),

    /// Failed to write to a client.
    #[error("Failed to write to client: {0}")]
    WriteFailed(String),

    /// A client message could not be decoded.
    #[error("Invalid client message: {0}")]
    InvalidMessage(String),

    /// The server has not been started.
    #[error("Server not started")]
    NotStarted,

    /// General transport error.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl StreamError {
    /// Wrap an IO error with context.
    pub fn from_io_error(context: &str, err: io::Error) -> Self {
        StreamError::Transport(format!("{}: {}", context, err))
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
