//! Client bootstrap: the runtime and resolver new connections are established on
//!
//! The bootstrap is passed explicitly through configuration rather than living in
//! process-wide state, so several managers can run on different runtimes.

use crate::config::SocketDomain;
use crate::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::lookup_host;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Handle to the runtime that drives connection establishment
#[derive(Debug, Clone)]
pub struct ClientBootstrap {
    handle: Handle,
}

impl ClientBootstrap {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bootstrap on the runtime of the calling task
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::Config(format!("No tokio runtime available for bootstrap: {}", e)))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn work onto the bootstrap runtime
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Resolve `host:port`, keeping only addresses of the requested domain
    pub async fn resolve(&self, host: &str, port: u16, domain: SocketDomain) -> Result<Vec<SocketAddr>> {
        // The resolver wants IPv6 literals without URL brackets
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await?
            .filter(|addr| domain.accepts(addr))
            .collect();

        if addrs.is_empty() {
            return Err(Error::Connect(format!(
                "No {:?} addresses resolved for {}:{}",
                domain, host, port
            )));
        }

        Ok(addrs)
    }
}
