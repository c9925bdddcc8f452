// SPDX-License-Identifier: MIT
//
// connpool: Bounded Asynchronous HTTP Connection Manager
// Copyright (c) 2025 connpool Contributors

//! connpool Probe - Exercises an HTTP endpoint through a pooled connection manager
//!
//! Several workers share one connection manager and issue `HEAD` requests until the
//! request budget is spent. Connections are reused between workers, so the summary
//! shows how many requests were served by how few connections.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   acquire    ┌──────────────┐   establish   ┌──────────────┐
//! │   Workers    │ ────────────>│   Manager    │ ─────────────>│   Endpoint   │
//! │  (HEAD req)  │<──────────── │ (idle/queue) │    (TCP)      │   (HTTP/1.1) │
//! └──────────────┘   release    └──────────────┘               └──────────────┘
//! ```
//!
//! Configuration comes from `CONNPOOL_*` environment variables.

use anyhow::{Context, Result};
use clap::Parser;
use connpool_core::{
    config::{ConnectionManagerOptions, ManagerConfig},
    manager::HttpConnectionManager,
    metrics::PoolSnapshot,
    retry::RetryPolicy,
    tcp::{TcpConnection, TcpEstablisher},
    ClientBootstrap, ClientConnection, Error,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Largest response head accepted from the endpoint
const MAX_HEAD_BYTES: usize = 16 * 1024;

#[derive(Parser, Debug)]
#[command(name = "connpool-probe")]
#[command(about = "connpool Probe - Issues pooled HEAD requests against an HTTP endpoint", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Total number of requests to issue
    #[arg(short, long, default_value_t = 32)]
    requests: usize,

    /// Number of concurrent workers
    #[arg(short, long, default_value_t = 8)]
    concurrency: usize,

    /// Request path
    #[arg(long, default_value = "/")]
    path: String,
}

/// Printed as JSON when the probe finishes
#[derive(Debug, Serialize)]
struct ProbeSummary {
    host: String,
    port: u16,
    requests_ok: u64,
    requests_failed: u64,
    statuses: BTreeMap<u16, u64>,
    elapsed_ms: u128,
    reuse_ratio: f64,
    pool: PoolSnapshot,
    prometheus: String,
}

/// Main probe application state
struct Probe {
    config: ManagerConfig,
    manager: HttpConnectionManager<TcpEstablisher>,
    retry: RetryPolicy,
    request: Vec<u8>,
    remaining: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    statuses: Mutex<BTreeMap<u16, u64>>,
}

impl Probe {
    fn new(config: ManagerConfig, path: &str, requests: usize) -> Result<Self> {
        let bootstrap = ClientBootstrap::current()?;
        let options = ConnectionManagerOptions::from_config(&config, bootstrap);
        let manager = HttpConnectionManager::new(options, TcpEstablisher)
            .context("Failed to create connection manager")?;

        if let Some(e) = manager.last_error() {
            warn!("Connection manager is misconfigured, every request will fail: {}", e);
        }

        let request = format!(
            "HEAD {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: connpool-probe/{}\r\n\r\n",
            path,
            host_header(&config.host_name),
            env!("CARGO_PKG_VERSION")
        )
        .into_bytes();

        Ok(Self {
            config,
            manager,
            retry: RetryPolicy::default(),
            request,
            remaining: AtomicUsize::new(requests),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            statuses: Mutex::new(BTreeMap::new()),
        })
    }

    /// Main run loop
    async fn run(self: Arc<Self>, concurrency: usize) -> ProbeSummary {
        info!(
            "Probing {}:{} with {} workers over at most {} connections",
            self.config.host_name, self.config.port, concurrency, self.config.max_connections
        );

        let started = Instant::now();
        let mut workers = JoinSet::new();
        for id in 0..concurrency {
            let probe = Arc::clone(&self);
            workers.spawn(async move { probe.worker(id).await });
        }

        tokio::select! {
            _ = Self::join_workers(&mut workers) => info!("Request budget spent"),
            _ = Self::wait_for_shutdown() => {
                info!("Shutdown signal received, stopping workers");
                self.remaining.store(0, Ordering::SeqCst);
                // Requests in flight finish and release their connections
                Self::join_workers(&mut workers).await;
            }
        }

        ProbeSummary {
            host: self.config.host_name.clone(),
            port: self.config.port,
            requests_ok: self.succeeded.load(Ordering::Relaxed),
            requests_failed: self.failed.load(Ordering::Relaxed),
            statuses: self.statuses.lock().await.clone(),
            elapsed_ms: started.elapsed().as_millis(),
            reuse_ratio: self.manager.metrics().reuse_ratio(),
            pool: self.manager.stats(),
            prometheus: self.manager.metrics().prometheus_format(&self.manager.stats()),
        }
    }

    async fn join_workers(workers: &mut JoinSet<()>) {
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Worker task failed: {}", e);
            }
        }
    }

    /// Claim one request from the budget
    fn take_request(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn worker(&self, id: usize) {
        while self.take_request() {
            match self.probe_once().await {
                Ok(status) => {
                    self.succeeded.fetch_add(1, Ordering::Relaxed);
                    *self.statuses.lock().await.entry(status).or_insert(0) += 1;
                    debug!("Worker {} got status {}", id, status);
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Worker {} request failed: {}", id, e);
                }
            }
        }
    }

    async fn probe_once(&self) -> connpool_core::Result<u16> {
        let connection = self.retry.acquire(&self.manager).await?;
        let result = self.exchange(&connection).await;

        // A failed exchange has already shut the connection down; the manager drops it
        self.manager.release_connection(connection);
        result
    }

    async fn exchange(&self, connection: &TcpConnection) -> connpool_core::Result<u16> {
        connection.send(&self.request).await?;
        let head = connection.read_head(MAX_HEAD_BYTES).await?;
        let status = parse_status(&head)?;

        if wants_close(&head) {
            debug!("Server asked to close connection {}", connection.id());
            connection.close();
        }

        Ok(status)
    }

    /// Wait for shutdown signal (SIGINT or SIGTERM)
    async fn wait_for_shutdown() {
        #[cfg(unix)]
        {
            use futures::stream::StreamExt;
            use signal_hook::consts::signal::*;
            use signal_hook_tokio::Signals;

            match Signals::new([SIGINT, SIGTERM]) {
                Ok(mut signals) => {
                    if let Some(signal) = signals.next().await {
                        info!("Received signal: {:?}", signal);
                    }
                }
                Err(e) => {
                    error!("Failed to register signal handlers: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }

        #[cfg(windows)]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C signal");
        }
    }
}

/// Status code from the first line of a response head
fn parse_status(head: &[u8]) -> connpool_core::Result<u16> {
    let line = head.split(|&b| b == b'\n').next().unwrap_or_default();
    let line = String::from_utf8_lossy(line);
    let mut parts = line.split_whitespace();

    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| Error::Internal(format!("Invalid status code '{}'", code))),
        _ => Err(Error::Internal(format!(
            "Malformed status line '{}'",
            line.trim()
        ))),
    }
}

/// IPv6 literals go in brackets in the `Host` header
fn host_header(host: &str) -> String {
    match host.parse::<Ipv6Addr>() {
        Ok(_) => format!("[{}]", host),
        Err(_) => host.to_string(),
    }
}

fn wants_close(head: &[u8]) -> bool {
    String::from_utf8_lossy(head).lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("connection:") && line.contains("close")
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .json()
        .init();

    info!("connpool Probe v{}", env!("CARGO_PKG_VERSION"));

    if args.concurrency == 0 {
        anyhow::bail!("--concurrency must be at least 1");
    }

    // Load configuration from environment variables
    info!("Loading configuration from environment variables");
    let config =
        ManagerConfig::from_env().context("Failed to load configuration from environment")?;

    let probe = Arc::new(Probe::new(config, &args.path, args.requests)?);
    let summary = Arc::clone(&probe).run(args.concurrency).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    info!("Draining connection manager");
    probe.manager.initiate_shutdown().await;
    info!("Probe shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap(), 204);
        assert_eq!(parse_status(b"HTTP/1.0 301 Moved\r\nLocation: /\r\n\r\n").unwrap(), 301);
        assert!(parse_status(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
        assert!(parse_status(b"HTTP/1.1 abc\r\n\r\n").is_err());
    }

    fn local_config() -> ManagerConfig {
        ManagerConfig::from_vars(vec![
            ("CONNPOOL_HOST_NAME".to_string(), "127.0.0.1".to_string()),
            ("CONNPOOL_PORT".to_string(), "9".to_string()),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_stopped_budget_hands_out_nothing() {
        let probe = Probe::new(local_config(), "/", 3).unwrap();
        assert!(probe.take_request());
        probe.remaining.store(0, Ordering::SeqCst);
        assert!(!probe.take_request());
    }

    #[tokio::test]
    async fn test_join_workers_waits_for_running_tasks() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::new();
        for delay in [10, 50] {
            let finished = Arc::clone(&finished);
            workers.spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        Probe::join_workers(&mut workers).await;
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert!(workers.is_empty());
    }

    #[test]
    fn test_host_header() {
        assert_eq!(host_header("example.com"), "example.com");
        assert_eq!(host_header("10.0.0.1"), "10.0.0.1");
        assert_eq!(host_header("::1"), "[::1]");
        assert_eq!(host_header("[::1]"), "[::1]");
    }

    #[test]
    fn test_wants_close() {
        assert!(wants_close(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n"));
        assert!(!wants_close(b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\n\r\n"));
        assert!(!wants_close(b"HTTP/1.1 200 OK\r\n\r\n"));
    }
}
