// SPDX-License-Identifier: MIT
//
// connpool: Bounded Asynchronous HTTP Connection Manager
// Copyright (c) 2025 connpool Contributors

//! connpool Core Library
//!
//! This crate provides a bounded, asynchronous connection manager for a single HTTP
//! endpoint. Connections are created lazily up to a configured maximum, cached while
//! idle, and handed to waiting requests in arrival order.
//!
//! # Architecture
//!
//! The library is organized into modules representing core concerns:
//! - `manager`: The connection manager (idle set, pending queue, lifecycle)
//! - `connection`: Transport interfaces the manager consumes
//! - `config`: Configuration management with validation
//! - `bootstrap`: Runtime handle and host resolution for new connections
//! - `tcp`: Plain TCP transport implementing the connection interfaces
//! - `retry`: Caller-side retry with exponential backoff
//! - `metrics`: Pool activity counters
//! - `error`: Unified error types
//!
//! # Design Principles
//!
//! 1. **Callbacks run unlocked**: No user code ever runs under the pool mutex
//! 2. **Exactly-once delivery**: Every accepted request hears back once
//! 3. **Explicit context**: Runtime and options are passed in, never global
//! 4. **Testability**: The transport is a trait, mocked in unit tests

pub mod bootstrap;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod retry;
pub mod tcp;

#[cfg(test)]
pub(crate) mod testing;

pub use bootstrap::ClientBootstrap;
pub use config::{
    ConnectionManagerOptions, ManagerConfig, MonitoringOptions, SocketOptions, TlsConnectionOptions,
};
pub use connection::{ClientConnection, ConnectionEstablisher, ConnectionId};
pub use error::{Error, Result};
pub use manager::HttpConnectionManager;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default connection limit when none is configured
pub const DEFAULT_MAX_CONNECTIONS: usize = 2;

/// Default initial flow-control window (unbounded)
pub const DEFAULT_INITIAL_WINDOW_SIZE: usize = usize::MAX;

/// Default connect timeout (3 seconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;
