//! Declarative configuration loading from YAML, TOML and environment variables.
//!
//! The structs here mirror [`DriverConfig`](crate::config::DriverConfig) with
//! serde-friendly types and convert into it through the builder API, so file
//! based settings get the same validation as programmatic ones.
//!
//! # Example TOML
//!
//! ```toml
//! contact-points = ["10.0.0.1:9042", "cassandra-2.internal"]
//! local-datacenter = "dc1"
//! protocol-version = 4
//!
//! [pool]
//! local-size = 2
//! max-requests-per-channel = 1024
//!
//! [request]
//! request-timeout-ms = 2000
//! idempotent = false
//!
//! [profiles.analytics]
//! request-timeout-ms = 30000
//! speculative-execution = false
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{
    ConfigError, DriverConfig, DriverConfigBuilder, ExecutionProfileBuilder, ProtocolVersion,
    DEFAULT_PORT,
};

/// Top-level file-based configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileConfig {
    /// Contact points as `host:port`, `ip` or `host`; the port defaults to 9042.
    pub contact_points: Option<Vec<String>>,
    /// Local datacenter name.
    pub local_datacenter: Option<String>,
    /// Highest protocol version to negotiate (3 or 4).
    pub protocol_version: Option<u8>,
    /// Network settings.
    pub network: Option<FileNetworkConfig>,
    /// Pool settings.
    pub pool: Option<FilePoolConfig>,
    /// Reconnection settings.
    pub reconnection: Option<FileReconnectionConfig>,
    /// Speculative execution settings.
    pub speculative: Option<FileSpeculativeConfig>,
    /// Settings of the default execution profile.
    pub request: Option<FileProfileConfig>,
    /// Named execution profiles.
    pub profiles: Option<BTreeMap<String, FileProfileConfig>>,
    /// Plain-text credentials.
    pub credentials: Option<FileCredentials>,
    /// Replicas preferred by token-aware routing.
    pub replication_factor: Option<usize>,
    /// Retry idempotent requests after a server error.
    pub retry_server_errors: Option<bool>,
}

/// File-based network settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileNetworkConfig {
    /// Connect and handshake timeout in milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: Option<u64>,
    /// Heartbeat response timeout in milliseconds.
    pub heartbeat_timeout_ms: Option<u64>,
    /// Disable Nagle's algorithm.
    pub tcp_nodelay: Option<bool>,
}

/// File-based pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FilePoolConfig {
    /// Channels per local node.
    pub local_size: Option<usize>,
    /// Channels per remote node.
    pub remote_size: Option<usize>,
    /// Concurrent requests per channel.
    pub max_requests_per_channel: Option<usize>,
    /// Orphaned stream ids tolerated before a channel is recycled.
    pub max_orphaned_streams: Option<usize>,
    /// Drain timeout of removed channels in milliseconds.
    pub drain_timeout_ms: Option<u64>,
}

/// File-based reconnection settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileReconnectionConfig {
    /// First delay in milliseconds.
    pub base_delay_ms: Option<u64>,
    /// Maximum delay in milliseconds.
    pub max_delay_ms: Option<u64>,
    /// Growth factor between delays.
    pub multiplier: Option<f64>,
    /// Jitter ratio (0.0 to 1.0).
    pub jitter: Option<f64>,
}

/// File-based speculative execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileSpeculativeConfig {
    /// Executions per request, the first one included.
    pub max_executions: Option<usize>,
    /// Delay between executions in milliseconds.
    pub delay_ms: Option<u64>,
}

/// File-based execution profile.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileProfileConfig {
    /// Per-attempt timeout in milliseconds.
    pub request_timeout_ms: Option<u64>,
    /// Overall deadline in milliseconds; 0 removes an inherited deadline.
    pub deadline_ms: Option<u64>,
    /// Default idempotence of requests.
    pub idempotent: Option<bool>,
    /// Whether speculative executions are allowed.
    pub speculative_execution: Option<bool>,
}

/// File-based credentials.
#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileCredentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl std::fmt::Debug for FileCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl FileProfileConfig {
    fn apply(&self, mut p: ExecutionProfileBuilder) -> ExecutionProfileBuilder {
        if let Some(ms) = self.request_timeout_ms {
            p = p.request_timeout(Duration::from_millis(ms));
        }
        match self.deadline_ms {
            Some(0) => p = p.no_deadline(),
            Some(ms) => p = p.deadline(Duration::from_millis(ms)),
            None => {}
        }
        if let Some(idempotent) = self.idempotent {
            p = p.idempotent(idempotent);
        }
        if let Some(enabled) = self.speculative_execution {
            p = p.speculative_execution(enabled);
        }
        p
    }
}

enum ContactPoint {
    Address(SocketAddr),
    Host(String),
}

fn parse_contact_point(value: &str) -> ContactPoint {
    let value = value.trim();
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return ContactPoint::Address(addr);
    }
    if let Ok(ip) = value.parse::<std::net::IpAddr>() {
        return ContactPoint::Address(SocketAddr::new(ip, DEFAULT_PORT));
    }
    if value.contains(':') {
        ContactPoint::Host(value.to_string())
    } else {
        ContactPoint::Host(format!("{value}:{DEFAULT_PORT}"))
    }
}

impl TryFrom<FileConfig> for DriverConfig {
    type Error = ConfigError;

    fn try_from(file: FileConfig) -> Result<Self, Self::Error> {
        let mut builder = DriverConfigBuilder::new();

        let version = match file.protocol_version {
            Some(value) => Some(ProtocolVersion::from_value(value).ok_or_else(|| {
                ConfigError::new(format!("unsupported protocol version {value}"))
            })?),
            None => None,
        };

        let net = file.network.unwrap_or_default();
        let contact_points = file.contact_points.unwrap_or_default();
        let local_datacenter = file.local_datacenter;
        builder = builder.network(|mut n| {
            for point in &contact_points {
                n = match parse_contact_point(point) {
                    ContactPoint::Address(addr) => n.add_contact_point(addr),
                    ContactPoint::Host(host) => n.add_contact_host(host),
                };
            }
            if let Some(dc) = local_datacenter {
                n = n.local_datacenter(dc);
            }
            if let Some(version) = version {
                n = n.protocol_version(version);
            }
            if let Some(ms) = net.connect_timeout_ms {
                n = n.connect_timeout(Duration::from_millis(ms));
            }
            if let Some(ms) = net.heartbeat_interval_ms {
                n = n.heartbeat_interval(Duration::from_millis(ms));
            }
            if let Some(ms) = net.heartbeat_timeout_ms {
                n = n.heartbeat_timeout(Duration::from_millis(ms));
            }
            if let Some(v) = net.tcp_nodelay {
                n = n.tcp_nodelay(v);
            }
            n
        });

        if let Some(pool) = file.pool {
            builder = builder.pool(|mut p| {
                if let Some(v) = pool.local_size {
                    p = p.local_size(v);
                }
                if let Some(v) = pool.remote_size {
                    p = p.remote_size(v);
                }
                if let Some(v) = pool.max_requests_per_channel {
                    p = p.max_requests_per_channel(v);
                }
                if let Some(v) = pool.max_orphaned_streams {
                    p = p.max_orphaned_streams(v);
                }
                if let Some(ms) = pool.drain_timeout_ms {
                    p = p.drain_timeout(Duration::from_millis(ms));
                }
                p
            });
        }

        if let Some(reconnection) = file.reconnection {
            builder = builder.reconnection(|mut r| {
                if let Some(ms) = reconnection.base_delay_ms {
                    r = r.base_delay(Duration::from_millis(ms));
                }
                if let Some(ms) = reconnection.max_delay_ms {
                    r = r.max_delay(Duration::from_millis(ms));
                }
                if let Some(m) = reconnection.multiplier {
                    r = r.multiplier(m);
                }
                if let Some(j) = reconnection.jitter {
                    r = r.jitter(j);
                }
                r
            });
        }

        if let Some(speculative) = file.speculative {
            builder = builder.speculative(|mut s| {
                if let Some(n) = speculative.max_executions {
                    s = s.max_executions(n);
                }
                if let Some(ms) = speculative.delay_ms {
                    s = s.delay(Duration::from_millis(ms));
                }
                s
            });
        }

        if let Some(request) = file.request {
            builder = builder.request(|p| request.apply(p));
        }

        for (name, profile) in file.profiles.unwrap_or_default() {
            builder = builder.profile(name, |p| profile.apply(p));
        }

        if let Some(credentials) = file.credentials {
            builder = builder.credentials(credentials.username, credentials.password);
        }

        if let Some(replicas) = file.replication_factor {
            builder = builder.replication_factor(replicas);
        }

        if let Some(retry) = file.retry_server_errors {
            builder = builder.retry_server_errors(retry);
        }

        builder.build()
    }
}

impl FileConfig {
    /// Collects settings from `CQL_*` variables through a lookup function.
    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::new(format!("invalid value for {name}: {value}")))
        }

        let mut file = FileConfig::default();

        if let Some(val) = var("CQL_CONTACT_POINTS") {
            file.contact_points = Some(
                val.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            );
        }
        if let Some(val) = var("CQL_LOCAL_DATACENTER") {
            file.local_datacenter = Some(val);
        }
        if let Some(val) = var("CQL_PROTOCOL_VERSION") {
            file.protocol_version = Some(parse("CQL_PROTOCOL_VERSION", val)?);
        }
        if let Some(val) = var("CQL_CONNECT_TIMEOUT_MS") {
            file.network.get_or_insert_with(Default::default).connect_timeout_ms =
                Some(parse("CQL_CONNECT_TIMEOUT_MS", val)?);
        }
        if let Some(val) = var("CQL_HEARTBEAT_INTERVAL_MS") {
            file.network.get_or_insert_with(Default::default).heartbeat_interval_ms =
                Some(parse("CQL_HEARTBEAT_INTERVAL_MS", val)?);
        }
        if let Some(val) = var("CQL_POOL_LOCAL_SIZE") {
            file.pool.get_or_insert_with(Default::default).local_size =
                Some(parse("CQL_POOL_LOCAL_SIZE", val)?);
        }
        if let Some(val) = var("CQL_POOL_REMOTE_SIZE") {
            file.pool.get_or_insert_with(Default::default).remote_size =
                Some(parse("CQL_POOL_REMOTE_SIZE", val)?);
        }
        if let Some(val) = var("CQL_REQUEST_TIMEOUT_MS") {
            file.request.get_or_insert_with(Default::default).request_timeout_ms =
                Some(parse("CQL_REQUEST_TIMEOUT_MS", val)?);
        }
        if let Some(val) = var("CQL_IDEMPOTENT") {
            file.request.get_or_insert_with(Default::default).idempotent =
                Some(val.eq_ignore_ascii_case("true"));
        }
        if let (Some(username), Some(password)) = (var("CQL_USERNAME"), var("CQL_PASSWORD")) {
            file.credentials = Some(FileCredentials { username, password });
        }

        Ok(file)
    }
}

impl DriverConfig {
    /// Loads configuration from a YAML file.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_yaml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("failed to read YAML config file: {e}")))?;
        let file: FileConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::new(format!("failed to parse YAML config: {e}")))?;
        file.try_into()
    }

    /// Loads configuration from a TOML file.
    ///
    /// Requires the `config-file` feature.
    #[cfg(feature = "config-file")]
    pub fn from_toml<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("failed to read TOML config file: {e}")))?;
        let file: FileConfig = toml_crate::from_str(&content)
            .map_err(|e| ConfigError::new(format!("failed to parse TOML config: {e}")))?;
        file.try_into()
    }

    /// Loads configuration from environment variables.
    ///
    /// | Variable | Maps to |
    /// |----------|---------|
    /// | `CQL_CONTACT_POINTS` | Comma-separated contact points |
    /// | `CQL_LOCAL_DATACENTER` | Local datacenter |
    /// | `CQL_PROTOCOL_VERSION` | `3` or `4` |
    /// | `CQL_CONNECT_TIMEOUT_MS` | Connect timeout |
    /// | `CQL_HEARTBEAT_INTERVAL_MS` | Heartbeat interval |
    /// | `CQL_POOL_LOCAL_SIZE` | Channels per local node |
    /// | `CQL_POOL_REMOTE_SIZE` | Channels per remote node |
    /// | `CQL_REQUEST_TIMEOUT_MS` | Default per-attempt timeout |
    /// | `CQL_IDEMPOTENT` | `"true"` or `"false"` |
    /// | `CQL_USERNAME`, `CQL_PASSWORD` | Plain-text credentials, both required |
    pub fn from_env() -> Result<Self, ConfigError> {
        FileConfig::from_vars(|name| std::env::var(name).ok())?.try_into()
    }
}

/// Loads a configuration file, picking the format from its extension.
///
/// Supports `.yaml`, `.yml` and `.toml`. Requires the `config-file` feature.
#[cfg(feature = "config-file")]
pub fn load_config<P: AsRef<std::path::Path>>(path: P) -> Result<DriverConfig, ConfigError> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => DriverConfig::from_yaml(path),
        Some("toml") => DriverConfig::from_toml(path),
        Some(ext) => Err(ConfigError::new(format!(
            "unsupported config file extension: .{ext} (expected .yaml, .yml, or .toml)"
        ))),
        None => Err(ConfigError::new(
            "config file has no extension; expected .yaml, .yml, or .toml",
        )),
    }
}
