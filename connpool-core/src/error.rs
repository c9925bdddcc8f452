// SPDX-License-Identifier: MIT
//
// connpool: Bounded Asynchronous HTTP Connection Manager
// Copyright (c) 2025 connpool Contributors

//! Error types for the connection manager
//!
//! Provides a unified error taxonomy using `thiserror` for ergonomic error handling.
//! Errors are `Clone` so a captured failure can be delivered to every waiting caller.

use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for connection management
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS connection options are unusable
    #[error("TLS error: {0}")]
    Tls(String),

    /// Establishing a connection to the endpoint failed
    #[error("Connect error: {0}")]
    Connect(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// The connection was shut down by its transport
    #[error("Connection closed")]
    ConnectionClosed,

    /// The manager is shutting down and no longer serves requests
    #[error("Connection manager is shut down")]
    ManagerShutdown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is transient and a fresh acquire may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connect(_) | Error::Timeout | Error::ConnectionClosed | Error::Io(_)
        )
    }

    /// Check if error stems from configuration and will repeat on every attempt
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Tls(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}
