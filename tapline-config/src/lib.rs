use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Tapline configuration loaded from YAML.
///
/// Defines listen addresses, client/server timeouts, metrics, and the optional
/// connection pool, TLS, process attribution and scheduler sections.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// List of addresses to listen on (e.g., "127.0.0.1:8888", "[::1]:8888")
    pub listen_addrs: Vec<String>,
    /// Timeout configuration for client and server pipes
    pub timeouts: Timeouts,
    /// Prometheus metrics configuration
    pub metrics: Metrics,
    /// Connection pooling configuration (optional)
    #[serde(default)]
    pub connection_pool: Option<ConnectionPool>,
    /// TLS settings for pipes secured by the proxy (optional)
    #[serde(default)]
    pub tls: Option<Tls>,
    /// Client process attribution settings (optional)
    #[serde(default)]
    pub process: Option<Process>,
    /// Background scheduler tick resolution (optional)
    #[serde(default)]
    pub scheduler: Option<Scheduler>,
}

/// Connection pooling configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConnectionPool {
    /// Enable connection pooling (default: true)
    #[serde(default = "default_pool_enabled")]
    pub enabled: bool,
    /// Maximum idle pipes kept per pool key (default: 64)
    #[serde(default = "default_max_per_key")]
    pub max_per_key: usize,
    /// Seconds an idle pipe may stay pooled before it is scavenged (default: 115)
    #[serde(default = "default_pooled_lifetime")]
    pub pooled_lifetime: u64,
    /// Scavenge interval in seconds (default: 30)
    #[serde(default = "default_scavenge_interval")]
    pub scavenge_interval: u64,
}

fn default_pool_enabled() -> bool {
    true
}

fn default_max_per_key() -> usize {
    64
}

fn default_pooled_lifetime() -> u64 {
    115
}

fn default_scavenge_interval() -> u64 {
    30
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self {
            enabled: default_pool_enabled(),
            max_per_key: default_max_per_key(),
            pooled_lifetime: default_pooled_lifetime(),
            scavenge_interval: default_scavenge_interval(),
        }
    }
}

/// Timeout settings for pipe operations (all values in seconds).
#[derive(Debug, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time to establish a server connection
    pub connect: u64,
    /// Maximum wait for the first byte of a new client exchange
    pub first_byte: u64,
    /// Maximum wait between reads once an exchange has started
    pub mid_read: u64,
    /// Maximum idle time of a blind tunnel direction (0 disables)
    #[serde(default)]
    pub tunnel_idle: u64,
}

/// Prometheus metrics server configuration.
#[derive(Debug, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection
    pub enabled: bool,
    /// Address to bind metrics HTTP server (e.g., "127.0.0.1:9000")
    pub address: String,
}

/// TLS protocol versions accepted in configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsProtocol {
    #[serde(rename = "ssl3")]
    Ssl3,
    #[serde(rename = "tls1.0")]
    Tls10,
    #[serde(rename = "tls1.1")]
    Tls11,
    #[serde(rename = "tls1.2")]
    Tls12,
    #[serde(rename = "tls1.3")]
    Tls13,
}

/// TLS settings used when the proxy terminates TLS from clients.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Tls {
    /// Enabled protocol versions (default: tls1.2, tls1.3)
    #[serde(default = "default_tls_protocols")]
    pub protocols: Vec<TlsProtocol>,
    /// Ask clients for a certificate during the handshake (default: false)
    #[serde(default)]
    pub request_client_certificate: bool,
}

fn default_tls_protocols() -> Vec<TlsProtocol> {
    vec![TlsProtocol::Tls12, TlsProtocol::Tls13]
}

impl Default for Tls {
    fn default() -> Self {
        Self {
            protocols: default_tls_protocols(),
            request_client_certificate: false,
        }
    }
}

/// Client process attribution settings.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Process {
    /// Look up the owning process even for non-loopback peers (default: false)
    #[serde(default)]
    pub attribute_remote_clients: bool,
}

/// Tick resolution of the background scheduler (milliseconds).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Scheduler {
    /// Periodic worker tick (default: 500)
    #[serde(default = "default_periodic_tick_ms")]
    pub periodic_tick_ms: u64,
    /// Debounced one-shot tick (default: 25)
    #[serde(default = "default_debounce_tick_ms")]
    pub debounce_tick_ms: u64,
}

fn default_periodic_tick_ms() -> u64 {
    500
}

fn default_debounce_tick_ms() -> u64 {
    25
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            periodic_tick_ms: default_periodic_tick_ms(),
            debounce_tick_ms: default_debounce_tick_ms(),
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use tapline_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Examples
    ///
    /// ```
    /// use tapline_config::Config;
    ///
    /// let yaml = r#"
    /// listen_addrs:
    ///   - "127.0.0.1:8888"
    /// timeouts:
    ///   connect: 10
    ///   first_byte: 60
    ///   mid_read: 15
    /// metrics:
    ///   enabled: false
    ///   address: "127.0.0.1:9000"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.listen_addrs[0], "127.0.0.1:8888");
    /// ```
    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config = serde_yaml_ng::from_str(contents)?;
        Ok(config)
    }

    /// Pool settings, falling back to defaults when the section is absent.
    pub fn pool_or_default(&self) -> ConnectionPool {
        self.connection_pool.clone().unwrap_or_default()
    }

    /// TLS settings, falling back to defaults when the section is absent.
    pub fn tls_or_default(&self) -> Tls {
        self.tls.clone().unwrap_or_default()
    }

    /// Scheduler settings, falling back to defaults when the section is absent.
    pub fn scheduler_or_default(&self) -> Scheduler {
        self.scheduler.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config_parsing() {
        let yaml = r#"
listen_addrs:
  - "127.0.0.1:8888"
  - "[::1]:8888"
timeouts:
  connect: 10
  first_byte: 60
  mid_read: 15
  tunnel_idle: 300
metrics:
  enabled: true
  address: "127.0.0.1:9000"
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.listen_addrs.len(), 2);
        assert_eq!(config.listen_addrs[0], "127.0.0.1:8888");
        assert_eq!(config.timeouts.connect, 10);
        assert_eq!(config.timeouts.first_byte, 60);
        assert_eq!(config.timeouts.mid_read, 15);
        assert_eq!(config.timeouts.tunnel_idle, 300);
        assert!(config.metrics.enabled);
        assert!(config.connection_pool.is_none());
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_optional_sections_use_defaults() {
        let yaml = r#"
listen_addrs:
  - "127.0.0.1:8888"
timeouts:
  connect: 5
  first_byte: 30
  mid_read: 5
metrics:
  enabled: false
  address: "127.0.0.1:9000"
connection_pool: {}
tls: {}
scheduler: {}
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.timeouts.tunnel_idle, 0);

        let pool = config.connection_pool.as_ref().unwrap();
        assert!(pool.enabled);
        assert_eq!(pool.max_per_key, 64);
        assert_eq!(pool.pooled_lifetime, 115);
        assert_eq!(pool.scavenge_interval, 30);

        let tls = config.tls.as_ref().unwrap();
        assert_eq!(tls.protocols, vec![TlsProtocol::Tls12, TlsProtocol::Tls13]);
        assert!(!tls.request_client_certificate);

        let scheduler = config.scheduler_or_default();
        assert_eq!(scheduler.periodic_tick_ms, 500);
        assert_eq!(scheduler.debounce_tick_ms, 25);
    }

    #[test]
    fn test_tls_protocol_names() {
        let yaml = r#"
listen_addrs: []
timeouts:
  connect: 5
  first_byte: 30
  mid_read: 5
metrics:
  enabled: false
  address: "127.0.0.1:9000"
tls:
  protocols: ["tls1.0", "tls1.1", "tls1.2"]
  request_client_certificate: true
"#;
        let config = Config::parse(yaml).unwrap();
        let tls = config.tls_or_default();
        assert_eq!(
            tls.protocols,
            vec![TlsProtocol::Tls10, TlsProtocol::Tls11, TlsProtocol::Tls12]
        );
        assert!(tls.request_client_certificate);
        assert!(TlsProtocol::Ssl3 < TlsProtocol::Tls13);
    }

    #[test]
    fn test_missing_required_field() {
        let yaml = r#"
listen_addrs:
  - "127.0.0.1:8888"
timeouts:
  connect: 5
  mid_read: 5
metrics:
  enabled: false
  address: "127.0.0.1:9000"
"#;
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_unknown_tls_protocol_rejected() {
        let yaml = r#"
listen_addrs: []
timeouts:
  connect: 5
  first_byte: 30
  mid_read: 5
metrics:
  enabled: false
  address: "127.0.0.1:9000"
tls:
  protocols: ["tls9"]
"#;
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_invalid_yaml() {
        let yaml = "invalid: yaml: content: ::::";
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_empty_config() {
        assert!(Config::parse("").is_err());
    }
}
