//! Transport interfaces consumed by the connection manager
//!
//! The manager never opens sockets itself. It asks a [`ConnectionEstablisher`] for new
//! connections and listens for shutdown notifications on every [`ClientConnection`] it
//! receives. [`ShutdownNotifier`] is the shared plumbing transports use to deliver
//! those notifications exactly once.

use crate::bootstrap::ClientBootstrap;
use crate::config::{MonitoringOptions, SocketOptions, TlsConnectionOptions};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identity of a connection, stable for its whole life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Completion of one establishment attempt
pub type SetupCallback<C> = Box<dyn FnOnce(Result<Arc<C>>) + Send + 'static>;

/// Invoked once when a connection's transport shuts down; `None` means a clean close
pub type ShutdownCallback = Box<dyn FnOnce(ConnectionId, Option<Error>) + Send + 'static>;

/// A live client connection as seen by the manager
pub trait ClientConnection: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    /// False once the connection has shut down
    fn is_open(&self) -> bool;

    /// Close the connection. Idempotent; may run shutdown handlers synchronously.
    fn close(&self);

    /// Register a shutdown handler. Runs immediately if the connection is already shut down.
    fn on_shutdown(&self, handler: ShutdownCallback);
}

/// Everything needed to open one connection to the endpoint
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub bootstrap: ClientBootstrap,
    pub host_name: String,
    pub port: u16,
    pub socket_options: SocketOptions,
    pub tls_options: Option<TlsConnectionOptions>,
    pub monitoring_options: Option<MonitoringOptions>,
    pub initial_window_size: usize,
}

/// Asynchronous connection factory
pub trait ConnectionEstablisher: Send + Sync + 'static {
    type Connection: ClientConnection;

    /// Start establishing a connection.
    ///
    /// On `Ok(())` the transport owns `on_setup` and must invoke it exactly once,
    /// possibly before this call returns. On `Err` the attempt never started and
    /// `on_setup` is dropped without being called.
    fn establish(
        &self,
        options: &ConnectionOptions,
        on_setup: SetupCallback<Self::Connection>,
    ) -> Result<()>;
}

impl<T: ConnectionEstablisher> ConnectionEstablisher for Arc<T> {
    type Connection = T::Connection;

    fn establish(
        &self,
        options: &ConnectionOptions,
        on_setup: SetupCallback<Self::Connection>,
    ) -> Result<()> {
        (**self).establish(options, on_setup)
    }
}

enum NotifierState {
    Running(Vec<ShutdownCallback>),
    Fired(Option<Error>),
}

/// Fires registered shutdown handlers exactly once, outside its own lock
pub struct ShutdownNotifier {
    state: Mutex<NotifierState>,
}

impl Default for ShutdownNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownNotifier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NotifierState::Running(Vec::new())),
        }
    }

    pub fn register(&self, id: ConnectionId, handler: ShutdownCallback) {
        let mut state = self.state.lock();
        match &mut *state {
            NotifierState::Running(handlers) => handlers.push(handler),
            NotifierState::Fired(error) => {
                let error = error.clone();
                drop(state);
                handler(id, error);
            }
        }
    }

    /// Mark the connection shut down and run every handler.
    ///
    /// Returns false if it had already fired.
    pub fn fire(&self, id: ConnectionId, error: Option<Error>) -> bool {
        let handlers = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, NotifierState::Fired(error.clone())) {
                NotifierState::Running(handlers) => handlers,
                previous @ NotifierState::Fired(_) => {
                    *state = previous;
                    return false;
                }
            }
        };

        for handler in handlers {
            handler(id, error.clone());
        }
        true
    }

    pub fn has_fired(&self) -> bool {
        matches!(*self.state.lock(), NotifierState::Fired(_))
    }
}
