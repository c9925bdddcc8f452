//! Scripted transport for unit tests

use crate::connection::{
    ClientConnection, ConnectionEstablisher, ConnectionId, ConnectionOptions, SetupCallback,
    ShutdownCallback, ShutdownNotifier,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) struct MockConnection {
    id: ConnectionId,
    open: AtomicBool,
    closes: AtomicUsize,
    shutdown: ShutdownNotifier,
}

impl MockConnection {
    pub(crate) fn new() -> Self {
        Self {
            id: ConnectionId::new(),
            open: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
            shutdown: ShutdownNotifier::new(),
        }
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Simulate the transport dropping the connection
    pub(crate) fn kill(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.shutdown.fire(self.id, Some(Error::ConnectionClosed));
        }
    }
}

impl ClientConnection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.open.swap(false, Ordering::SeqCst) {
            self.shutdown.fire(self.id, None);
        }
    }

    fn on_shutdown(&self, handler: ShutdownCallback) {
        self.shutdown.register(self.id, handler);
    }
}

/// Establisher whose attempts complete only when a test says so
#[derive(Default)]
pub(crate) struct MockEstablisher {
    in_flight: Mutex<VecDeque<SetupCallback<MockConnection>>>,
    attempts: AtomicUsize,
    start_error: Mutex<Option<Error>>,
    immediate: AtomicBool,
}

impl MockEstablisher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Make every following `establish` call fail before starting
    pub(crate) fn fail_to_start(&self, error: Option<Error>) {
        *self.start_error.lock() = error;
    }

    /// Complete attempts inside `establish` itself
    pub(crate) fn complete_immediately(&self, enabled: bool) {
        self.immediate.store(enabled, Ordering::SeqCst);
    }

    /// Finish the oldest in-flight attempt with a fresh connection
    pub(crate) fn succeed_next(&self) -> Arc<MockConnection> {
        let on_setup = self
            .in_flight
            .lock()
            .pop_front()
            .expect("no establishment in flight");
        let connection = Arc::new(MockConnection::new());
        on_setup(Ok(Arc::clone(&connection)));
        connection
    }

    pub(crate) fn fail_next(&self, error: Error) {
        let on_setup = self
            .in_flight
            .lock()
            .pop_front()
            .expect("no establishment in flight");
        on_setup(Err(error));
    }
}

impl ConnectionEstablisher for MockEstablisher {
    type Connection = MockConnection;

    fn establish(
        &self,
        _options: &ConnectionOptions,
        on_setup: SetupCallback<MockConnection>,
    ) -> Result<()> {
        if let Some(error) = self.start_error.lock().clone() {
            return Err(error);
        }

        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.immediate.load(Ordering::SeqCst) {
            on_setup(Ok(Arc::new(MockConnection::new())));
        } else {
            self.in_flight.lock().push_back(on_setup);
        }
        Ok(())
    }
}

/// Records what every acquire callback received, tagged with a request label
#[derive(Clone, Default)]
pub(crate) struct Deliveries {
    received: Arc<Mutex<Vec<(usize, Result<Arc<MockConnection>>)>>>,
}

impl Deliveries {
    pub(crate) fn callback(
        &self,
        label: usize,
    ) -> impl FnOnce(Result<Arc<MockConnection>>) + Send + 'static {
        let received = Arc::clone(&self.received);
        move |result| received.lock().push((label, result))
    }

    pub(crate) fn len(&self) -> usize {
        self.received.lock().len()
    }

    pub(crate) fn labels(&self) -> Vec<usize> {
        self.received.lock().iter().map(|(label, _)| *label).collect()
    }

    pub(crate) fn connection(&self, label: usize) -> Arc<MockConnection> {
        self.received
            .lock()
            .iter()
            .find_map(|(l, result)| match result {
                Ok(connection) if *l == label => Some(Arc::clone(connection)),
                _ => None,
            })
            .expect("no connection delivered for label")
    }

    pub(crate) fn error(&self, label: usize) -> Error {
        self.received
            .lock()
            .iter()
            .find_map(|(l, result)| match result {
                Err(error) if *l == label => Some(error.clone()),
                _ => None,
            })
            .expect("no error delivered for label")
    }
}
