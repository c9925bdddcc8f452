//! Configuration management for the connection manager

use crate::bootstrap::ClientBootstrap;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use url::Host;

/// Longest protocol id TLS allows in an ALPN extension
const MAX_ALPN_PROTOCOL_LEN: usize = 255;

/// Address family used when connecting
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SocketDomain {
    /// Use whichever addresses the resolver returns
    Any,
    /// IPv4 only
    Ipv4,
    /// IPv6 only
    Ipv6,
}

impl Default for SocketDomain {
    fn default() -> Self {
        Self::Any
    }
}

impl SocketDomain {
    pub fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            SocketDomain::Any => true,
            SocketDomain::Ipv4 => addr.is_ipv4(),
            SocketDomain::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// Socket-level options applied to every connection the manager creates
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SocketOptions {
    #[serde(default)]
    pub domain: SocketDomain,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Disable Nagle's algorithm
    #[serde(default = "default_true")]
    pub nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            domain: SocketDomain::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            nodelay: true,
        }
    }
}

impl SocketOptions {
    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    pub fn with_domain(mut self, domain: SocketDomain) -> Self {
        self.domain = domain;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Minimum-throughput health check for established connections
///
/// A connection whose reads fall below `minimum_throughput_bytes_per_second` for
/// longer than `allowable_throughput_failure_interval` is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoringOptions {
    pub minimum_throughput_bytes_per_second: u64,
    pub allowable_throughput_failure_interval: Duration,
}

impl MonitoringOptions {
    pub fn new(minimum_throughput_bytes_per_second: u64, interval: Duration) -> Self {
        Self {
            minimum_throughput_bytes_per_second,
            allowable_throughput_failure_interval: interval,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.allowable_throughput_failure_interval.is_zero() {
            return Err(Error::Config(
                "throughput failure interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// TLS options for connections to the endpoint
///
/// Only validated here; the handshake itself belongs to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TlsConnectionOptions {
    /// SNI / certificate name, defaults to the target host
    #[serde(default)]
    pub server_name: Option<String>,

    #[serde(default)]
    pub alpn_protocols: Vec<String>,

    #[serde(default = "default_true")]
    pub verify_peer: bool,

    /// PEM bundle of trusted roots
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

impl Default for TlsConnectionOptions {
    fn default() -> Self {
        Self {
            server_name: None,
            alpn_protocols: Vec::new(),
            verify_peer: true,
            ca_file: None,
        }
    }
}

impl TlsConnectionOptions {
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn with_alpn_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.alpn_protocols.push(protocol.into());
        self
    }

    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Validate TLS options
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.server_name {
            Host::parse(name)
                .map_err(|e| Error::Tls(format!("Invalid server name '{}': {}", name, e)))?;
        }

        for protocol in &self.alpn_protocols {
            if protocol.is_empty() || protocol.len() > MAX_ALPN_PROTOCOL_LEN {
                return Err(Error::Tls(format!(
                    "ALPN protocol '{}' must be between 1 and {} bytes",
                    protocol, MAX_ALPN_PROTOCOL_LEN
                )));
            }
        }

        if let Some(path) = &self.ca_file {
            if !path.is_file() {
                return Err(Error::Tls(format!(
                    "CA file '{}' does not exist",
                    path.display()
                )));
            }
        }

        Ok(())
    }
}

/// Connection manager configuration, loadable from `CONNPOOL_*` environment variables
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManagerConfig {
    /// Target host name
    pub host_name: String,

    /// Target port
    pub port: u16,

    /// Maximum number of connections the manager may hold open
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Initial flow-control window for each connection
    #[serde(default = "default_initial_window_size")]
    pub initial_window_size: usize,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub socket_domain: SocketDomain,

    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,

    /// Wrap connections in TLS
    #[serde(default)]
    pub tls_enabled: bool,

    #[serde(default)]
    pub tls_server_name: Option<String>,

    #[serde(default)]
    pub tls_alpn_protocols: Vec<String>,

    #[serde(default = "default_true")]
    pub tls_verify_peer: bool,

    #[serde(default)]
    pub tls_ca_file: Option<PathBuf>,

    /// Make `initiate_shutdown` wait for every vended connection to come back
    #[serde(default)]
    pub enable_blocking_shutdown: bool,

    /// Minimum read throughput in bytes per second; 0 disables monitoring
    #[serde(default)]
    pub min_throughput_bytes_per_sec: u64,

    #[serde(default = "default_throughput_failure_interval_secs")]
    pub throughput_failure_interval_secs: u64,
}

impl ManagerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load configuration from `CONNPOOL_*` key/value pairs
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config: Self = envy::prefixed("CONNPOOL_")
            .from_iter(vars)
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {}", e)))?;

        // envy splits lists on commas but keeps the whitespace around each item
        config.tls_alpn_protocols = config
            .tls_alpn_protocols
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// TLS settings are deliberately left to the manager, which records them as its
    /// failure state instead of refusing to start.
    pub fn validate(&self) -> Result<()> {
        validate_host_name(&self.host_name)?;

        if self.port == 0 {
            return Err(Error::Config("port must be > 0".to_string()));
        }

        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be >= 1".to_string()));
        }

        if self.initial_window_size == 0 {
            return Err(Error::Config("initial_window_size must be > 0".to_string()));
        }

        if self.connect_timeout_ms == 0 {
            return Err(Error::Config("connect_timeout_ms must be > 0".to_string()));
        }

        if let Some(monitoring) = self.monitoring_options() {
            monitoring.validate()?;
        }

        Ok(())
    }

    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            domain: self.socket_domain,
            connect_timeout_ms: self.connect_timeout_ms,
            nodelay: self.tcp_nodelay,
        }
    }

    pub fn monitoring_options(&self) -> Option<MonitoringOptions> {
        (self.min_throughput_bytes_per_sec > 0).then(|| {
            MonitoringOptions::new(
                self.min_throughput_bytes_per_sec,
                Duration::from_secs(self.throughput_failure_interval_secs),
            )
        })
    }

    pub fn tls_options(&self) -> Option<TlsConnectionOptions> {
        if !self.tls_enabled {
            return None;
        }

        Some(TlsConnectionOptions {
            server_name: self.tls_server_name.clone(),
            alpn_protocols: self.tls_alpn_protocols.clone(),
            verify_peer: self.tls_verify_peer,
            ca_file: self.tls_ca_file.clone(),
        })
    }
}

/// Everything a connection manager is constructed from
#[derive(Debug, Clone)]
pub struct ConnectionManagerOptions {
    pub bootstrap: ClientBootstrap,
    pub host_name: String,
    pub port: u16,
    pub max_connections: usize,
    pub initial_window_size: usize,
    pub socket_options: SocketOptions,
    pub tls_options: Option<TlsConnectionOptions>,
    pub monitoring_options: Option<MonitoringOptions>,
    pub enable_blocking_shutdown: bool,
}

impl ConnectionManagerOptions {
    pub fn new(bootstrap: ClientBootstrap, host_name: impl Into<String>, port: u16) -> Self {
        Self {
            bootstrap,
            host_name: host_name.into(),
            port,
            max_connections: default_max_connections(),
            initial_window_size: default_initial_window_size(),
            socket_options: SocketOptions::default(),
            tls_options: None,
            monitoring_options: None,
            enable_blocking_shutdown: false,
        }
    }

    pub fn from_config(config: &ManagerConfig, bootstrap: ClientBootstrap) -> Self {
        Self {
            bootstrap,
            host_name: config.host_name.clone(),
            port: config.port,
            max_connections: config.max_connections,
            initial_window_size: config.initial_window_size,
            socket_options: config.socket_options(),
            tls_options: config.tls_options(),
            monitoring_options: config.monitoring_options(),
            enable_blocking_shutdown: config.enable_blocking_shutdown,
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_initial_window_size(mut self, window_size: usize) -> Self {
        self.initial_window_size = window_size;
        self
    }

    pub fn with_socket_options(mut self, socket_options: SocketOptions) -> Self {
        self.socket_options = socket_options;
        self
    }

    pub fn with_tls_options(mut self, tls_options: TlsConnectionOptions) -> Self {
        self.tls_options = Some(tls_options);
        self
    }

    pub fn with_monitoring_options(mut self, monitoring_options: MonitoringOptions) -> Self {
        self.monitoring_options = Some(monitoring_options);
        self
    }

    pub fn with_blocking_shutdown(mut self, enabled: bool) -> Self {
        self.enable_blocking_shutdown = enabled;
        self
    }

    /// Validate the options a manager cannot run without
    pub fn validate(&self) -> Result<()> {
        validate_host_name(&self.host_name)?;

        if self.port == 0 {
            return Err(Error::Config("port must be > 0".to_string()));
        }

        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be >= 1".to_string()));
        }

        if let Some(monitoring) = &self.monitoring_options {
            monitoring.validate()?;
        }

        Ok(())
    }
}

fn validate_host_name(host_name: &str) -> Result<()> {
    if host_name.is_empty() {
        return Err(Error::Config("host_name cannot be empty".to_string()));
    }

    // Bare IPv6 literals are valid hosts but not valid URL hosts
    if host_name.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    Host::parse(host_name)
        .map_err(|e| Error::Config(format!("Invalid host_name '{}': {}", host_name, e)))?;

    Ok(())
}

// Default value functions
fn default_max_connections() -> usize {
    crate::DEFAULT_MAX_CONNECTIONS
}

fn default_initial_window_size() -> usize {
    crate::DEFAULT_INITIAL_WINDOW_SIZE
}

fn default_connect_timeout_ms() -> u64 {
    crate::DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_throughput_failure_interval_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_config() -> ManagerConfig {
        ManagerConfig {
            host_name: "example.com".to_string(),
            port: 443,
            max_connections: 4,
            initial_window_size: 65_535,
            connect_timeout_ms: 1000,
            socket_domain: SocketDomain::Ipv4,
            tcp_nodelay: false,
            tls_enabled: true,
            tls_server_name: Some("api.example.com".to_string()),
            tls_alpn_protocols: vec!["http/1.1".to_string()],
            tls_verify_peer: true,
            tls_ca_file: None,
            enable_blocking_shutdown: true,
            min_throughput_bytes_per_sec: 0,
            throughput_failure_interval_secs: 5,
        }
    }

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_manager_config_validation() {
        assert!(manager_config().validate().is_ok());

        let mut config = manager_config();
        config.max_connections = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = manager_config();
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = manager_config();
        config.host_name = String::new();
        assert!(config.validate().is_err());

        let mut config = manager_config();
        config.host_name = "bad host".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ip_literal_hosts() {
        for host in ["127.0.0.1", "::1", "[::1]", "fe80::1"] {
            assert!(validate_host_name(host).is_ok(), "{} rejected", host);
        }
        assert!(validate_host_name("[::1").is_err());
    }

    #[test]
    fn test_from_vars_defaults() {
        let config = ManagerConfig::from_vars(vars(&[
            ("CONNPOOL_HOST_NAME", "example.com"),
            ("CONNPOOL_PORT", "8080"),
            ("PATH", "/usr/bin"),
        ]))
        .unwrap();

        assert_eq!(config.host_name, "example.com");
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_connections, crate::DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.initial_window_size, crate::DEFAULT_INITIAL_WINDOW_SIZE);
        assert_eq!(config.connect_timeout_ms, crate::DEFAULT_CONNECT_TIMEOUT_MS);
        assert_eq!(config.socket_domain, SocketDomain::Any);
        assert!(config.tcp_nodelay);
        assert!(!config.tls_enabled);
        assert!(config.tls_options().is_none());
        assert!(config.monitoring_options().is_none());
        assert!(!config.enable_blocking_shutdown);
    }

    #[test]
    fn test_from_vars_overrides() {
        let config = ManagerConfig::from_vars(vars(&[
            ("CONNPOOL_HOST_NAME", "api.example.com"),
            ("CONNPOOL_PORT", "443"),
            ("CONNPOOL_MAX_CONNECTIONS", "16"),
            ("CONNPOOL_SOCKET_DOMAIN", "ipv6"),
            ("CONNPOOL_TLS_ENABLED", "true"),
            ("CONNPOOL_TLS_ALPN_PROTOCOLS", " h2 , http/1.1,"),
            ("CONNPOOL_MIN_THROUGHPUT_BYTES_PER_SEC", "1024"),
            ("CONNPOOL_ENABLE_BLOCKING_SHUTDOWN", "true"),
        ]))
        .unwrap();

        assert_eq!(config.max_connections, 16);
        assert_eq!(config.socket_domain, SocketDomain::Ipv6);
        assert!(config.enable_blocking_shutdown);

        let tls = config.tls_options().unwrap();
        assert_eq!(tls.alpn_protocols, vec!["h2".to_string(), "http/1.1".to_string()]);

        let monitoring = config.monitoring_options().unwrap();
        assert_eq!(monitoring.minimum_throughput_bytes_per_second, 1024);
        assert_eq!(
            monitoring.allowable_throughput_failure_interval,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_from_vars_rejects_invalid() {
        let missing_host = ManagerConfig::from_vars(vars(&[("CONNPOOL_PORT", "80")]));
        assert!(matches!(missing_host, Err(Error::Config(_))));

        let zero_max = ManagerConfig::from_vars(vars(&[
            ("CONNPOOL_HOST_NAME", "example.com"),
            ("CONNPOOL_PORT", "80"),
            ("CONNPOOL_MAX_CONNECTIONS", "0"),
        ]));
        assert!(matches!(zero_max, Err(Error::Config(_))));

        let bad_port = ManagerConfig::from_vars(vars(&[
            ("CONNPOOL_HOST_NAME", "example.com"),
            ("CONNPOOL_PORT", "http"),
        ]));
        assert!(matches!(bad_port, Err(Error::Config(_))));

        let zero_interval = ManagerConfig::from_vars(vars(&[
            ("CONNPOOL_HOST_NAME", "example.com"),
            ("CONNPOOL_PORT", "80"),
            ("CONNPOOL_MIN_THROUGHPUT_BYTES_PER_SEC", "1"),
            ("CONNPOOL_THROUGHPUT_FAILURE_INTERVAL_SECS", "0"),
        ]));
        assert!(matches!(zero_interval, Err(Error::Config(_))));
    }

    #[test]
    fn test_config_ignores_bad_tls_at_validation() {
        let mut config = manager_config();
        config.tls_alpn_protocols = vec![String::new()];
        assert!(config.validate().is_ok());
        assert!(config.tls_options().unwrap().validate().is_err());
    }

    #[test]
    fn test_derived_options() {
        let config = manager_config();
        let socket = config.socket_options();
        assert_eq!(socket.domain, SocketDomain::Ipv4);
        assert_eq!(socket.connect_timeout(), Duration::from_millis(1000));
        assert!(!socket.nodelay);

        let tls = config.tls_options().unwrap();
        assert_eq!(tls.server_name.as_deref(), Some("api.example.com"));
        assert_eq!(tls.alpn_protocols, vec!["http/1.1".to_string()]);

        let mut plain = manager_config();
        plain.tls_enabled = false;
        assert!(plain.tls_options().is_none());
    }

    #[test]
    fn test_tls_validation() {
        assert!(TlsConnectionOptions::default().validate().is_ok());
        assert!(TlsConnectionOptions::default()
            .with_server_name("s3.amazonaws.com")
            .with_alpn_protocol("h2")
            .validate()
            .is_ok());

        let bad_name = TlsConnectionOptions::default().with_server_name("not a host");
        assert!(matches!(bad_name.validate(), Err(Error::Tls(_))));

        let long_alpn = TlsConnectionOptions::default().with_alpn_protocol("x".repeat(256));
        assert!(long_alpn.validate().is_err());

        let missing_ca = TlsConnectionOptions::default().with_ca_file("/nonexistent/ca.pem");
        assert!(matches!(missing_ca.validate(), Err(Error::Tls(_))));
    }

    #[test]
    fn test_socket_domain_filter() {
        let v4: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(SocketDomain::Any.accepts(&v4) && SocketDomain::Any.accepts(&v6));
        assert!(SocketDomain::Ipv4.accepts(&v4) && !SocketDomain::Ipv4.accepts(&v6));
        assert!(SocketDomain::Ipv6.accepts(&v6) && !SocketDomain::Ipv6.accepts(&v4));
    }

    #[tokio::test]
    async fn test_manager_options_from_config() {
        let bootstrap = ClientBootstrap::current().unwrap();
        let options = ConnectionManagerOptions::from_config(&manager_config(), bootstrap.clone());
        assert_eq!(options.max_connections, 4);
        assert!(options.tls_options.is_some());
        assert!(options.enable_blocking_shutdown);
        assert!(options.validate().is_ok());

        let defaults = ConnectionManagerOptions::new(bootstrap, "localhost", 8080);
        assert_eq!(defaults.max_connections, crate::DEFAULT_MAX_CONNECTIONS);
        assert_eq!(defaults.initial_window_size, usize::MAX);
        assert!(defaults.validate().is_ok());
        assert!(defaults.clone().with_max_connections(0).validate().is_err());

        let stalled = MonitoringOptions::new(1024, Duration::ZERO);
        assert!(defaults.with_monitoring_options(stalled).validate().is_err());
    }
}
