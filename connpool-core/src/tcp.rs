//! Plain TCP transport for the connection manager
//!
//! [`TcpEstablisher`] connects on the bootstrap runtime and reports through the setup
//! callback. [`TcpConnection`] shuts itself down on the first I/O failure, which is
//! how the manager learns a pooled connection has died. A `close()` interrupts any
//! read or write in flight and drops the socket.

use crate::config::MonitoringOptions;
use crate::connection::{
    ClientConnection, ConnectionEstablisher, ConnectionId, ConnectionOptions, SetupCallback,
    ShutdownCallback, ShutdownNotifier,
};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, Instant};
use tracing::debug;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Opens plain TCP connections to the configured endpoint
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpEstablisher;

impl ConnectionEstablisher for TcpEstablisher {
    type Connection = TcpConnection;

    fn establish(
        &self,
        options: &ConnectionOptions,
        on_setup: SetupCallback<TcpConnection>,
    ) -> Result<()> {
        if options.tls_options.is_some() {
            return Err(Error::Tls(
                "plain TCP transport cannot negotiate TLS".to_string(),
            ));
        }

        let bootstrap = options.bootstrap.clone();
        let options = options.clone();
        bootstrap.spawn(async move {
            let result = connect(&options).await.map(Arc::new);
            on_setup(result);
        });

        Ok(())
    }
}

async fn connect(options: &ConnectionOptions) -> Result<TcpConnection> {
    let socket = &options.socket_options;
    let addrs = options
        .bootstrap
        .resolve(&options.host_name, options.port, socket.domain)
        .await?;

    let mut last_error = None;
    for addr in addrs {
        match timeout(socket.connect_timeout(), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(socket.nodelay)?;
                debug!("Connected to {}", addr);
                return Ok(TcpConnection::new(stream, addr, options.monitoring_options));
            }
            Ok(Err(e)) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(Error::Connect(format!("{}: {}", addr, e)));
            }
            Err(_) => {
                debug!("Connect to {} timed out after {:?}", addr, socket.connect_timeout());
                last_error = Some(Error::Timeout);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        Error::Connect(format!("No address to connect to for {}", options.host_name))
    }))
}

/// A pooled TCP connection
pub struct TcpConnection {
    id: ConnectionId,
    peer: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    open: AtomicBool,
    /// Flipped to `true` once, wakes I/O in flight
    closed: watch::Sender<bool>,
    monitoring: Option<MonitoringOptions>,
    shutdown: ShutdownNotifier,
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

impl TcpConnection {
    fn new(stream: TcpStream, peer: SocketAddr, monitoring: Option<MonitoringOptions>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            stream: Mutex::new(Some(stream)),
            open: AtomicBool::new(true),
            closed: watch::channel(false).0,
            monitoring,
            shutdown: ShutdownNotifier::new(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Write all of `data`
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let result = {
            let mut guard = self.stream.lock().await;
            let result = match guard.as_mut() {
                Some(stream) if self.is_open() => tokio::select! {
                    result = stream.write_all(data) => result.map_err(Error::from),
                    _ = wait_closed(self.closed.subscribe()) => Err(Error::ConnectionClosed),
                },
                _ => Err(Error::ConnectionClosed),
            };
            if !self.is_open() {
                guard.take();
            }
            result
        };
        self.check(result)
    }

    /// Read up to and including the first blank line (`\r\n\r\n`).
    ///
    /// Bytes after the blank line are discarded, so this suits bodiless responses.
    /// With monitoring configured, a read that stays below the minimum throughput
    /// for longer than the allowed interval fails with [`Error::Timeout`].
    pub async fn read_head(&self, limit: usize) -> Result<Bytes> {
        let result = {
            let mut guard = self.stream.lock().await;
            let result = match guard.as_mut() {
                Some(stream) if self.is_open() => tokio::select! {
                    result = read_until_blank_line(stream, limit, self.monitoring.as_ref()) => result,
                    _ = wait_closed(self.closed.subscribe()) => Err(Error::ConnectionClosed),
                },
                _ => Err(Error::ConnectionClosed),
            };
            if !self.is_open() {
                guard.take();
            }
            result
        };
        self.check(result)
    }

    fn check<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            self.shut_down(Some(error.clone()));
        }
        result
    }

    fn shut_down(&self, error: Option<Error>) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.closed.send_replace(true);

        // Otherwise the read or write holding the lock wakes up and drops the stream
        if let Ok(mut guard) = self.stream.try_lock() {
            guard.take();
        }

        debug!("Connection {} to {} shut down", self.id, self.peer);
        self.shutdown.fire(self.id, error);
    }
}

impl ClientConnection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.shut_down(None);
    }

    fn on_shutdown(&self, handler: ShutdownCallback) {
        self.shutdown.register(self.id, handler);
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn read_until_blank_line(
    stream: &mut TcpStream,
    limit: usize,
    monitoring: Option<&MonitoringOptions>,
) -> Result<Bytes> {
    let mut buffer = BytesMut::with_capacity(1024);
    let started = Instant::now();

    loop {
        if let Some(end) = find_blank_line(&buffer) {
            return Ok(buffer.split_to(end + HEAD_TERMINATOR.len()).freeze());
        }

        if buffer.len() >= limit {
            return Err(Error::Internal(format!(
                "Response head exceeds {} bytes",
                limit
            )));
        }

        let read = match monitoring {
            Some(monitoring) => timeout(
                monitoring.allowable_throughput_failure_interval,
                stream.read_buf(&mut buffer),
            )
            .await
            .map_err(|_| Error::Timeout)??,
            None => stream.read_buf(&mut buffer).await?,
        };

        if read == 0 {
            return Err(Error::ConnectionClosed);
        }

        if let Some(monitoring) = monitoring {
            if !throughput_ok(monitoring, buffer.len(), started.elapsed()) {
                return Err(Error::Timeout);
            }
        }
    }
}

/// Whether `bytes` read over `elapsed` keeps up with the configured minimum
fn throughput_ok(monitoring: &MonitoringOptions, bytes: usize, elapsed: Duration) -> bool {
    if elapsed <= monitoring.allowable_throughput_failure_interval {
        return true;
    }
    bytes as f64 / elapsed.as_secs_f64() >= monitoring.minimum_throughput_bytes_per_second as f64
}

fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}
