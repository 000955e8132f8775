//! Server Configuration
//!
//! Everything `NetworkServer::start` needs: where to bind, which transport
//! backs the server, and the per-connection limits the drivers enforce.
//! Durations are carried as milliseconds in JSON.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::outbound::OverflowPolicy;
use crate::network::transport::raknet::codec::MAX_MOTD_LEN;
use crate::network::NetworkType;

/// Default bind address (all interfaces, the classic Bedrock port).
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:19132";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address and port.
    pub bind_addr: SocketAddr,
    /// Transport backing the server.
    pub network_type: NetworkType,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// A connection with no inbound traffic for this long is disconnected.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Upper bound for a single transport handshake.
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
    /// Interval between keepalive probes sent to each peer.
    #[serde(with = "duration_ms")]
    pub keepalive_interval: Duration,
    /// How long `stop()` waits for connections to wind down.
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Per-connection outbound queue capacity (buffers).
    pub outbound_queue_capacity: usize,
    /// What `send` does when the outbound queue is full.
    pub overflow_policy: OverflowPolicy,
    /// Largest payload accepted in either direction (bytes).
    pub max_payload_size: usize,
    /// Message of the day, answered to RakNet unconnected pings.
    pub motd: String,
    /// TLS identity for the secure datagram transport.
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 19132)),
            network_type: NetworkType::RakNetLike,
            max_connections: 1000,
            idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            outbound_queue_capacity: 256,
            overflow_policy: OverflowPolicy::DropOldest,
            max_payload_size: 64 * 1024,
            motd: "Multinet Server".to_string(),
            tls: TlsConfig::default(),
        }
    }
}

/// Where the secure datagram transport gets its certificate from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TlsConfig {
    /// Generate a throwaway self-signed certificate at start.
    SelfSigned {
        /// Subject alternative names for the generated certificate.
        subject_alt_names: Vec<String>,
    },
    /// PEM certificate chain and private key on disk.
    CertificateFiles {
        /// Certificate chain (PEM).
        certificate: PathBuf,
        /// Private key (PEM, PKCS#8/PKCS#1/SEC1).
        private_key: PathBuf,
    },
    /// PEM material held in memory.
    Pem {
        /// Certificate chain (PEM).
        certificate_pem: String,
        /// Private key (PEM).
        private_key_pem: String,
    },
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig::SelfSigned {
            subject_alt_names: vec!["localhost".to_string()],
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// Config file is not valid JSON for `ServerConfig`.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// An environment variable holds an unusable value.
    #[error("invalid value for {var}: {value:?}")]
    Env {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// The configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ServerConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse a JSON config document.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Create config from environment variables, falling back to defaults.
    ///
    /// Recognised: `NETSERVER_BIND`, `NETSERVER_TRANSPORT`,
    /// `NETSERVER_MAX_CONNECTIONS`, `NETSERVER_IDLE_TIMEOUT_MS`,
    /// `NETSERVER_QUEUE_CAPACITY`, `NETSERVER_MOTD`, `NETSERVER_TLS_CERT`
    /// and `NETSERVER_TLS_KEY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = env_var("NETSERVER_BIND") {
            config.bind_addr = parse_env("NETSERVER_BIND", value)?;
        }
        if let Some(value) = env_var("NETSERVER_TRANSPORT") {
            config.network_type = parse_env("NETSERVER_TRANSPORT", value)?;
        }
        if let Some(value) = env_var("NETSERVER_MAX_CONNECTIONS") {
            config.max_connections = parse_env("NETSERVER_MAX_CONNECTIONS", value)?;
        }
        if let Some(value) = env_var("NETSERVER_IDLE_TIMEOUT_MS") {
            config.idle_timeout =
                Duration::from_millis(parse_env("NETSERVER_IDLE_TIMEOUT_MS", value)?);
        }
        if let Some(value) = env_var("NETSERVER_QUEUE_CAPACITY") {
            config.outbound_queue_capacity = parse_env("NETSERVER_QUEUE_CAPACITY", value)?;
        }
        if let Some(value) = env_var("NETSERVER_MOTD") {
            config.motd = value;
        }
        match (env_var("NETSERVER_TLS_CERT"), env_var("NETSERVER_TLS_KEY")) {
            (Some(certificate), Some(private_key)) => {
                config.tls = TlsConfig::CertificateFiles {
                    certificate: certificate.into(),
                    private_key: private_key.into(),
                };
            }
            (None, None) => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "NETSERVER_TLS_CERT and NETSERVER_TLS_KEY must be set together".into(),
                ))
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values no driver can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network_type == NetworkType::Unknown {
            return Err(ConfigError::Invalid("network type is unknown".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_payload_size == 0 {
            return Err(ConfigError::Invalid("max_payload_size must be at least 1".into()));
        }
        if self.idle_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.keepalive_interval.is_zero() || self.keepalive_interval >= self.idle_timeout {
            return Err(ConfigError::Invalid(format!(
                "keepalive_interval ({:?}) must be non-zero and below idle_timeout ({:?})",
                self.keepalive_interval, self.idle_timeout
            )));
        }
        if let OverflowPolicy::Block { timeout } = self.overflow_policy {
            if timeout.is_zero() {
                return Err(ConfigError::Invalid("block timeout must be non-zero".into()));
            }
        }
        if self.motd.len() > MAX_MOTD_LEN {
            return Err(ConfigError::Invalid(format!(
                "motd is {} bytes, at most {MAX_MOTD_LEN} allowed",
                self.motd.len()
            )));
        }
        if let TlsConfig::SelfSigned { subject_alt_names } = &self.tls {
            if subject_alt_names.is_empty() {
                return Err(ConfigError::Invalid(
                    "self-signed certificate needs at least one subject name".into(),
                ));
            }
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Env { var, value })
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
