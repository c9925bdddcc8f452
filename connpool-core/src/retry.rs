//! Caller-side retry with exponential backoff and jitter
//!
//! The manager never retries a failed establishment on its own; a caller that wants
//! another attempt acquires again. [`RetryPolicy`] packages that loop.

use crate::connection::ConnectionEstablisher;
use crate::manager::HttpConnectionManager;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Add jitter to spread out reconnect storms
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            ..Default::default()
        }
    }

    /// Acquire a connection, acquiring again after transient failures
    pub async fn acquire<E>(&self, manager: &HttpConnectionManager<E>) -> Result<Arc<E::Connection>>
    where
        E: ConnectionEstablisher,
    {
        self.execute(|| manager.acquire()).await
    }

    /// Execute operation with retry logic
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Succeeded after {} attempts", attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        "Attempt {}/{} failed: {}. Retrying after {:?}",
                        attempt, self.max_attempts, e, backoff
                    );

                    sleep(backoff).await;
                    backoff = self.next_backoff(backoff);
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!("Giving up after {} attempts: {}", attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        let grown = Duration::from_secs_f64(
            (current.as_secs_f64() * self.multiplier).min(self.max_backoff.as_secs_f64()),
        );

        if !self.jitter {
            return grown;
        }

        use rand::Rng;
        let jitter_ms = rand::thread_rng().gen_range(0..=grown.as_millis() / 4);
        grown + Duration::from_millis(jitter_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::ClientBootstrap;
    use crate::config::{ConnectionManagerOptions, TlsConnectionOptions};
    use crate::testing::MockEstablisher;
    use crate::Error;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retry_success() {
        let policy = quick_policy(5);
        let mut attempts = 0;

        let result = policy
            .execute(|| {
                attempts += 1;
                let current = attempts;
                async move {
                    if current < 3 {
                        Err(Error::Connect("refused".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let policy = quick_policy(2);
        let mut attempts = 0;

        let result = policy
            .execute(|| {
                attempts += 1;
                async { Err::<(), _>(Error::Timeout) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_config_errors_not_retried() {
        let policy = quick_policy(5);
        let mut attempts = 0;

        let result = policy
            .execute(|| {
                attempts += 1;
                async { Err::<(), _>(Error::Tls("bad".into())) }
            })
            .await;

        assert!(matches!(result, Err(Error::Tls(_))));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_backoff_capped() {
        let policy = RetryPolicy {
            max_backoff: Duration::from_millis(300),
            jitter: false,
            ..Default::default()
        };
        assert_eq!(policy.next_backoff(Duration::from_millis(100)), Duration::from_millis(200));
        assert_eq!(policy.next_backoff(Duration::from_millis(200)), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_acquire_through_manager() {
        let establisher = MockEstablisher::new();
        establisher.complete_immediately(true);
        let options =
            ConnectionManagerOptions::new(ClientBootstrap::current().unwrap(), "localhost", 8080);
        let manager = HttpConnectionManager::new(options, Arc::clone(&establisher)).unwrap();

        let connection = quick_policy(3).acquire(&manager).await.unwrap();
        assert_eq!(manager.stats().vended, 1);
        manager.release_connection(connection);
    }

    #[tokio::test]
    async fn test_acquire_stops_on_misconfigured_manager() {
        let establisher = MockEstablisher::new();
        let options =
            ConnectionManagerOptions::new(ClientBootstrap::current().unwrap(), "localhost", 8443)
                .with_tls_options(TlsConnectionOptions::default().with_server_name("bad name"));
        let manager = HttpConnectionManager::new(options, Arc::clone(&establisher)).unwrap();

        let result = quick_policy(3).acquire(&manager).await;
        assert!(matches!(result, Err(Error::Tls(_))));
        assert_eq!(manager.metrics().acquires_total(), 1);
        assert_eq!(establisher.attempts(), 0);
    }
}
