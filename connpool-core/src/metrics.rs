// SPDX-License-Identifier: MIT
//
// connpool: Bounded Asynchronous HTTP Connection Manager
// Copyright (c) 2025 connpool Contributors

//! Metrics collection and reporting

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

const MAX_WAIT_SAMPLES: usize = 10_000;

/// Point-in-time view of the pool's bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub idle: usize,
    pub vended: usize,
    pub establishing: usize,
    pub pending: usize,
    pub max_connections: usize,
}

impl PoolSnapshot {
    /// Connections the pool accounts for against its maximum
    pub fn outstanding(&self) -> usize {
        self.idle + self.vended + self.establishing
    }
}

/// Counters describing manager activity
#[derive(Clone)]
pub struct ManagerMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    start_time: Instant,

    // Acquire metrics
    acquires_total: AtomicU64,
    acquires_failed: AtomicU64,
    idle_hits: AtomicU64,

    // Establishment metrics
    establish_attempts: AtomicU64,
    establish_failures: AtomicU64,
    connections_established: AtomicU64,

    // Return path
    releases_total: AtomicU64,
    dead_releases: AtomicU64,
    shutdown_removals: AtomicU64,

    // Time spent queued, microseconds
    queue_waits: RwLock<Vec<u64>>,
}

impl Default for ManagerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                start_time: Instant::now(),
                acquires_total: AtomicU64::new(0),
                acquires_failed: AtomicU64::new(0),
                idle_hits: AtomicU64::new(0),
                establish_attempts: AtomicU64::new(0),
                establish_failures: AtomicU64::new(0),
                connections_established: AtomicU64::new(0),
                releases_total: AtomicU64::new(0),
                dead_releases: AtomicU64::new(0),
                shutdown_removals: AtomicU64::new(0),
                queue_waits: RwLock::new(Vec::with_capacity(1024)),
            }),
        }
    }

    // Acquire metrics
    pub fn record_acquire(&self) {
        self.inner.acquires_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquire_failure(&self) {
        self.inner.acquires_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_hit(&self) {
        self.inner.idle_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_wait(&self, wait_micros: u64) {
        let mut waits = self.inner.queue_waits.write();
        waits.push(wait_micros);
        if waits.len() > MAX_WAIT_SAMPLES {
            waits.drain(0..MAX_WAIT_SAMPLES / 2);
        }
    }

    pub fn acquires_total(&self) -> u64 {
        self.inner.acquires_total.load(Ordering::Relaxed)
    }

    pub fn acquires_failed(&self) -> u64 {
        self.inner.acquires_failed.load(Ordering::Relaxed)
    }

    pub fn idle_hits(&self) -> u64 {
        self.inner.idle_hits.load(Ordering::Relaxed)
    }

    // Establishment metrics
    pub fn record_establish_attempt(&self) {
        self.inner.establish_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_establish_failure(&self) {
        self.inner.establish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.inner.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn establish_attempts(&self) -> u64 {
        self.inner.establish_attempts.load(Ordering::Relaxed)
    }

    pub fn establish_failures(&self) -> u64 {
        self.inner.establish_failures.load(Ordering::Relaxed)
    }

    pub fn connections_established(&self) -> u64 {
        self.inner.connections_established.load(Ordering::Relaxed)
    }

    // Return path
    pub fn record_release(&self) {
        self.inner.releases_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_release(&self) {
        self.inner.dead_releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shutdown_removal(&self) {
        self.inner.shutdown_removals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn releases_total(&self) -> u64 {
        self.inner.releases_total.load(Ordering::Relaxed)
    }

    pub fn dead_releases(&self) -> u64 {
        self.inner.dead_releases.load(Ordering::Relaxed)
    }

    pub fn shutdown_removals(&self) -> u64 {
        self.inner.shutdown_removals.load(Ordering::Relaxed)
    }

    // Derived metrics
    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    /// Share of acquires served straight from the idle set
    pub fn reuse_ratio(&self) -> f64 {
        let total = self.acquires_total();
        if total > 0 {
            self.idle_hits() as f64 / total as f64
        } else {
            0.0
        }
    }

    pub fn queue_wait_percentile(&self, percentile: f64) -> Option<u64> {
        let waits = self.inner.queue_waits.read();
        if waits.is_empty() {
            return None;
        }

        let mut sorted = waits.clone();
        sorted.sort_unstable();
        let index = ((sorted.len() as f64 * percentile).ceil() as usize).min(sorted.len() - 1);
        Some(sorted[index])
    }

    pub fn queue_wait_p50(&self) -> Option<u64> {
        self.queue_wait_percentile(0.50)
    }

    pub fn queue_wait_p95(&self) -> Option<u64> {
        self.queue_wait_percentile(0.95)
    }

    pub fn queue_wait_p99(&self) -> Option<u64> {
        self.queue_wait_percentile(0.99)
    }

    /// Generate Prometheus-compatible metrics output
    pub fn prometheus_format(&self, snapshot: &PoolSnapshot) -> String {
        let mut output = String::new();

        let counters = [
            ("connpool_acquires_total", "Total acquire requests", self.acquires_total()),
            ("connpool_acquires_failed", "Acquire requests that failed", self.acquires_failed()),
            ("connpool_idle_hits", "Acquires served from the idle set", self.idle_hits()),
            ("connpool_establish_attempts", "Connection establishment attempts", self.establish_attempts()),
            ("connpool_establish_failures", "Failed establishment attempts", self.establish_failures()),
            ("connpool_connections_established", "Connections successfully established", self.connections_established()),
            ("connpool_releases_total", "Connections released back to the manager", self.releases_total()),
            ("connpool_dead_releases", "Released connections that were already shut down", self.dead_releases()),
            ("connpool_shutdown_removals", "Idle connections removed after transport shutdown", self.shutdown_removals()),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value));
        }

        let gauges = [
            ("connpool_idle_connections", "Idle connections", snapshot.idle),
            ("connpool_vended_connections", "Connections held by callers", snapshot.vended),
            ("connpool_establishing_connections", "Establishments in flight", snapshot.establishing),
            ("connpool_pending_requests", "Queued acquire requests", snapshot.pending),
            ("connpool_max_connections", "Configured connection limit", snapshot.max_connections),
        ];
        for (name, help, value) in gauges {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            output.push_str(&format!("{} {}\n", name, value));
        }

        output.push_str("# HELP connpool_uptime_seconds Manager uptime in seconds\n");
        output.push_str("# TYPE connpool_uptime_seconds gauge\n");
        output.push_str(&format!("connpool_uptime_seconds {}\n", self.uptime_seconds()));

        if let Some(p50) = self.queue_wait_p50() {
            output.push_str("# HELP connpool_queue_wait_p50_microseconds Queue wait 50th percentile\n");
            output.push_str("# TYPE connpool_queue_wait_p50_microseconds gauge\n");
            output.push_str(&format!("connpool_queue_wait_p50_microseconds {}\n", p50));
        }

        if let Some(p99) = self.queue_wait_p99() {
            output.push_str("# HELP connpool_queue_wait_p99_microseconds Queue wait 99th percentile\n");
            output.push_str("# TYPE connpool_queue_wait_p99_microseconds gauge\n");
            output.push_str(&format!("connpool_queue_wait_p99_microseconds {}\n", p99));
        }

        output
    }
}
