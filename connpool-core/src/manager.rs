// SPDX-License-Identifier: MIT
//
// connpool: Bounded Asynchronous HTTP Connection Manager
// Copyright (c) 2025 connpool Contributors

//! Bounded connection manager with pending-request queuing
//!
//! [`HttpConnectionManager`] owns a pool of live connections to a single endpoint.
//! An acquire is served from the idle set when possible; otherwise the request is
//! queued and, while the pool is below its limit, a new connection is established
//! for it. Connections coming back (released by a caller, or freshly established)
//! go to the oldest queued request first and only reach the idle set when nobody
//! is waiting.
//!
//! # Locking
//!
//! One mutex guards the idle set, the pending queue and the counters. It is never
//! held while a caller callback runs, while a connection is closed, or while the
//! transport is asked for a new connection, so callbacks may re-enter the manager.

use crate::config::ConnectionManagerOptions;
use crate::connection::{ClientConnection, ConnectionEstablisher, ConnectionId, ConnectionOptions};
use crate::metrics::{ManagerMetrics, PoolSnapshot};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

/// Receives the outcome of one acquire request, exactly once
pub type AcquireCallback<C> = Box<dyn FnOnce(Result<Arc<C>>) + Send + 'static>;

struct PendingRequest<C> {
    ticket: u64,
    queued_at: Instant,
    on_available: AcquireCallback<C>,
}

struct PoolState<C> {
    idle: Vec<Arc<C>>,
    pending: VecDeque<PendingRequest<C>>,
    /// Handed out and not yet released
    vended: usize,
    establishing: usize,
    next_ticket: u64,
    shutting_down: bool,
}

impl<C> PoolState<C> {
    fn outstanding(&self) -> usize {
        self.idle.len() + self.vended + self.establishing
    }
}

/// Where a connection entering the pool comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Released,
    Established,
}

struct ManagerInner<E: ConnectionEstablisher> {
    establisher: E,
    connection_options: ConnectionOptions,
    max_connections: usize,
    /// Set at construction when the TLS options were unusable
    last_error: Option<Error>,
    state: Mutex<PoolState<E::Connection>>,
    drained: Notify,
    metrics: ManagerMetrics,
}

/// Manages a bounded pool of connections to one endpoint sharing socket and TLS options
pub struct HttpConnectionManager<E: ConnectionEstablisher> {
    inner: Arc<ManagerInner<E>>,
    enable_blocking_shutdown: bool,
}

impl<E: ConnectionEstablisher> HttpConnectionManager<E> {
    /// Create a manager.
    ///
    /// Fails on an unusable endpoint or a zero connection limit. Invalid TLS options
    /// do not fail construction: the manager is created in a failed state and rejects
    /// every acquire with the captured error.
    pub fn new(options: ConnectionManagerOptions, establisher: E) -> Result<Self> {
        options.validate()?;

        let last_error = options.tls_options.as_ref().and_then(|tls| tls.validate().err());
        if let Some(error) = &last_error {
            warn!(
                "TLS options for {} rejected, every acquire will fail: {}",
                options.host_name, error
            );
        }

        info!(
            "Connection manager for {}:{} created (max {} connections, tls: {})",
            options.host_name,
            options.port,
            options.max_connections,
            options.tls_options.is_some()
        );

        let connection_options = ConnectionOptions {
            bootstrap: options.bootstrap,
            host_name: options.host_name,
            port: options.port,
            socket_options: options.socket_options,
            tls_options: options.tls_options,
            monitoring_options: options.monitoring_options,
            initial_window_size: options.initial_window_size,
        };

        Ok(Self {
            inner: Arc::new(ManagerInner {
                establisher,
                connection_options,
                max_connections: options.max_connections,
                last_error,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    pending: VecDeque::new(),
                    vended: 0,
                    establishing: 0,
                    next_ticket: 0,
                    shutting_down: false,
                }),
                drained: Notify::new(),
                metrics: ManagerMetrics::new(),
            }),
            enable_blocking_shutdown: options.enable_blocking_shutdown,
        })
    }

    /// Request a connection.
    ///
    /// `on_available` runs exactly once: synchronously on this thread when an idle
    /// connection exists, later from the transport otherwise. `Ok(())` means the
    /// request was accepted, not that a connection was obtained. On `Err` the
    /// callback has already been invoked with the same error.
    pub fn acquire_connection<F>(&self, on_available: F) -> Result<()>
    where
        F: FnOnce(Result<Arc<E::Connection>>) + Send + 'static,
    {
        self.inner.acquire(Box::new(on_available))
    }

    /// Await a connection.
    ///
    /// Dropping the returned future before it completes hands any connection that
    /// arrives afterwards back to the pool.
    pub async fn acquire(&self) -> Result<Arc<E::Connection>> {
        let (tx, rx) = oneshot::channel();
        let weak = Arc::downgrade(&self.inner);

        // A synchronous failure is delivered through the callback as well
        let _ = self.inner.acquire(Box::new(move |result| {
            if let Err(Ok(connection)) = tx.send(result) {
                if let Some(inner) = weak.upgrade() {
                    debug!("Acquirer went away, returning connection {}", connection.id());
                    inner.pool_or_vend(connection, Origin::Released);
                }
            }
        }));

        rx.await.map_err(|_| Error::ManagerShutdown)?
    }

    /// Give a connection back. It goes to the oldest waiting request if there is one.
    pub fn release_connection(&self, connection: Arc<E::Connection>) {
        self.inner.metrics.record_release();
        self.inner.pool_or_vend(connection, Origin::Released);
    }

    /// Idle, vended and establishing connections
    pub fn open_connection_count(&self) -> usize {
        self.inner.state.lock().outstanding()
    }

    pub fn stats(&self) -> PoolSnapshot {
        self.inner.snapshot()
    }

    pub fn metrics(&self) -> &ManagerMetrics {
        &self.inner.metrics
    }

    /// Failure captured at construction, if any
    pub fn last_error(&self) -> Option<&Error> {
        self.inner.last_error.as_ref()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.last_error.is_none()
    }

    pub fn connection_options(&self) -> &ConnectionOptions {
        &self.inner.connection_options
    }

    /// Stop serving requests.
    ///
    /// Idle connections are closed and queued requests fail with
    /// [`Error::ManagerShutdown`]. With blocking shutdown enabled the returned future
    /// completes once every vended and establishing connection is accounted for;
    /// otherwise it completes immediately.
    pub fn initiate_shutdown(&self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.shutdown();

        let inner = Arc::clone(&self.inner);
        let blocking = self.enable_blocking_shutdown;
        async move {
            if !blocking {
                return;
            }

            loop {
                let drained = inner.drained.notified();
                let remaining = inner.state.lock().outstanding();
                if remaining == 0 {
                    break;
                }
                debug!("Shutdown waiting on {} connections", remaining);
                drained.await;
            }
            info!("Connection manager drained");
        }
    }
}

impl<E: ConnectionEstablisher> Drop for HttpConnectionManager<E> {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl<E: ConnectionEstablisher> ManagerInner<E> {
    fn acquire(self: &Arc<Self>, on_available: AcquireCallback<E::Connection>) -> Result<()> {
        self.metrics.record_acquire();

        if let Some(error) = &self.last_error {
            warn!("Rejecting acquire on misconfigured manager: {}", error);
            self.metrics.record_acquire_failure();
            on_available(Err(error.clone()));
            return Err(error.clone());
        }

        let mut state = self.state.lock();

        if state.shutting_down {
            drop(state);
            self.metrics.record_acquire_failure();
            on_available(Err(Error::ManagerShutdown));
            return Err(Error::ManagerShutdown);
        }

        if let Some(connection) = state.idle.pop() {
            state.vended += 1;
            drop(state);
            self.metrics.record_idle_hit();
            debug!("Vending idle connection {}", connection.id());
            on_available(Ok(connection));
            return Ok(());
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.pending.push_back(PendingRequest {
            ticket,
            queued_at: Instant::now(),
            on_available,
        });

        // Reserve the slot before unlocking so concurrent acquires see it
        let establish = state.outstanding() < self.max_connections;
        if establish {
            state.establishing += 1;
        }
        let queued = state.pending.len();
        drop(state);

        if !establish {
            debug!("Pool at capacity, request queued ({} waiting)", queued);
            return Ok(());
        }

        if let Err(error) = self.start_establishment() {
            warn!("Could not start connection establishment: {}", error);
            let request = {
                let mut state = self.state.lock();
                state.establishing -= 1;
                let position = state.pending.iter().position(|r| r.ticket == ticket);
                position.and_then(|index| state.pending.remove(index))
            };
            self.drained.notify_waiters();

            // A concurrent release may already have served this request
            if let Some(request) = request {
                self.deliver(request, Err(error.clone()));
                return Err(error);
            }
        }

        Ok(())
    }

    fn start_establishment(self: &Arc<Self>) -> Result<()> {
        self.metrics.record_establish_attempt();
        let weak = Arc::downgrade(self);

        self.establisher.establish(
            &self.connection_options,
            Box::new(move |result| match weak.upgrade() {
                Some(inner) => inner.on_connection_setup(result),
                None => {
                    if let Ok(connection) = result {
                        debug!("Manager gone, closing new connection {}", connection.id());
                        connection.close();
                    }
                }
            }),
        )
    }

    fn on_connection_setup(self: &Arc<Self>, result: Result<Arc<E::Connection>>) {
        match result {
            Ok(connection) => {
                self.metrics.record_connection_established();
                debug!(
                    "Connection {} established to {}:{}",
                    connection.id(),
                    self.connection_options.host_name,
                    self.connection_options.port
                );

                let weak = Arc::downgrade(self);
                connection.on_shutdown(Box::new(move |id, error| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_connection_shutdown(id, error);
                    }
                }));

                self.pool_or_vend(connection, Origin::Established);
            }
            Err(error) => {
                self.metrics.record_establish_failure();
                warn!(
                    "Connection to {}:{} failed: {}",
                    self.connection_options.host_name, self.connection_options.port, error
                );

                let request = {
                    let mut state = self.state.lock();
                    state.establishing -= 1;
                    state.pending.pop_front()
                };
                self.drained.notify_waiters();

                match request {
                    Some(request) => self.deliver(request, Err(error)),
                    None => debug!("No request waiting for the failed connection"),
                }
            }
        }
    }

    /// Route a connection to the oldest waiter, or into the idle set.
    fn pool_or_vend(self: &Arc<Self>, connection: Arc<E::Connection>, origin: Origin) {
        let mut state = self.state.lock();
        match origin {
            Origin::Released if state.vended == 0 => {
                drop(state);
                warn!("Ignoring connection {} not vended by this manager", connection.id());
                return;
            }
            Origin::Released => state.vended -= 1,
            Origin::Established => state.establishing -= 1,
        }

        if !connection.is_open() {
            let replace = !state.shutting_down
                && !state.pending.is_empty()
                && state.outstanding() < self.max_connections;
            if replace {
                state.establishing += 1;
            }
            drop(state);

            if origin == Origin::Released {
                self.metrics.record_dead_release();
            }
            debug!("Dropping dead connection {}", connection.id());
            self.drained.notify_waiters();

            if replace {
                self.replace_for_waiters();
            }
            return;
        }

        if state.shutting_down {
            drop(state);
            debug!("Closing connection {} returned during shutdown", connection.id());
            connection.close();
            self.drained.notify_waiters();
            return;
        }

        if let Some(request) = state.pending.pop_front() {
            state.vended += 1;
            drop(state);
            debug!("Handing connection {} to a waiting request", connection.id());
            self.deliver(request, Ok(connection));
            return;
        }

        state.idle.push(connection);
    }

    /// Start a replacement establishment whose slot is already reserved
    fn replace_for_waiters(self: &Arc<Self>) {
        if let Err(error) = self.start_establishment() {
            warn!("Could not replace dead connection: {}", error);
            let request = {
                let mut state = self.state.lock();
                state.establishing -= 1;
                state.pending.pop_front()
            };
            self.drained.notify_waiters();

            if let Some(request) = request {
                self.deliver(request, Err(error));
            }
        }
    }

    fn on_connection_shutdown(&self, id: ConnectionId, error: Option<Error>) {
        let removed = {
            let mut state = self.state.lock();
            let before = state.idle.len();
            state.idle.retain(|connection| connection.id() != id);
            before != state.idle.len()
        };

        if removed {
            self.metrics.record_shutdown_removal();
            match error {
                Some(error) => debug!("Idle connection {} shut down: {}", id, error),
                None => debug!("Idle connection {} closed", id),
            }
            self.drained.notify_waiters();
        }
    }

    fn deliver(&self, request: PendingRequest<E::Connection>, result: Result<Arc<E::Connection>>) {
        match &result {
            Ok(_) => self
                .metrics
                .record_queue_wait(request.queued_at.elapsed().as_micros() as u64),
            Err(_) => self.metrics.record_acquire_failure(),
        }
        (request.on_available)(result);
    }

    fn shutdown(&self) {
        let (idle, pending) = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.pending),
            )
        };

        info!(
            "Shutting down connection manager for {}:{} ({} idle, {} waiting)",
            self.connection_options.host_name,
            self.connection_options.port,
            idle.len(),
            pending.len()
        );

        for connection in &idle {
            connection.close();
        }
        for request in pending {
            self.deliver(request, Err(Error::ManagerShutdown));
        }

        self.drained.notify_waiters();
    }

    fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock();
        PoolSnapshot {
            idle: state.idle.len(),
            vended: state.vended,
            establishing: state.establishing,
            pending: state.pending.len(),
            max_connections: self.max_connections,
        }
    }
}
