//! Driver configuration types and builders.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use cql_core::protocol::MAX_STREAM_IDS;

/// Port used when a contact point does not name one.
pub const DEFAULT_PORT: u16 = 9042;
/// Name of the profile used when a request names none.
pub const DEFAULT_PROFILE: &str = "default";

/// Default connect and handshake timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default heartbeat interval.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Default heartbeat response timeout.
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default channels per local node.
const DEFAULT_LOCAL_POOL_SIZE: usize = 2;
/// Default channels per remote node.
const DEFAULT_REMOTE_POOL_SIZE: usize = 1;
/// Default concurrent requests per channel.
const DEFAULT_MAX_REQUESTS_PER_CHANNEL: usize = 1024;
/// Default orphaned stream ids tolerated before a channel is recycled.
const DEFAULT_MAX_ORPHANED_STREAMS: usize = 256;
/// Default time a removed channel may spend draining.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Default initial reconnection delay.
const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Default maximum reconnection delay.
const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
/// Default reconnection multiplier.
const DEFAULT_RECONNECT_MULTIPLIER: f64 = 2.0;
/// Default reconnection jitter ratio.
const DEFAULT_RECONNECT_JITTER: f64 = 0.15;
/// Default per-attempt request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// Default delay before a speculative execution.
const DEFAULT_SPECULATIVE_DELAY: Duration = Duration::from_millis(100);
/// Default number of replicas preferred by token-aware routing.
const DEFAULT_REPLICATION_FACTOR: usize = 3;

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for cql_core::DriverError {
    fn from(err: ConfigError) -> Self {
        cql_core::DriverError::Configuration(err.message)
    }
}

/// Native protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    /// Protocol v3.
    V3,
    /// Protocol v4.
    V4,
}

impl ProtocolVersion {
    /// Returns the version number sent on the wire.
    pub fn value(self) -> u8 {
        match self {
            Self::V3 => 3,
            Self::V4 => 4,
        }
    }

    /// Creates a version from its number.
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            3 => Some(Self::V3),
            4 => Some(Self::V4),
            _ => None,
        }
    }

    /// Returns the next lower supported version.
    pub fn downgrade(self) -> Option<Self> {
        match self {
            Self::V4 => Some(Self::V3),
            Self::V3 => None,
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::V4
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.value())
    }
}

/// Network configuration for cluster connections.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    contact_points: Vec<SocketAddr>,
    contact_hosts: Vec<String>,
    local_datacenter: Option<String>,
    protocol_version: ProtocolVersion,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    tcp_nodelay: bool,
}

impl NetworkConfig {
    /// Returns the configured contact point addresses.
    pub fn contact_points(&self) -> &[SocketAddr] {
        &self.contact_points
    }

    /// Returns contact points given as host names, resolved at startup.
    pub fn contact_hosts(&self) -> &[String] {
        &self.contact_hosts
    }

    /// Returns true if contact points were configured explicitly.
    pub fn has_explicit_contact_points(&self) -> bool {
        !self.contact_points.is_empty() || !self.contact_hosts.is_empty()
    }

    /// Returns the contact point used when none is configured.
    pub fn implicit_contact_point() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))
    }

    /// Returns the configured local datacenter.
    pub fn local_datacenter(&self) -> Option<&str> {
        self.local_datacenter.as_deref()
    }

    /// Returns the highest protocol version to negotiate.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Returns the connect and handshake timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Returns how long a heartbeat may wait for its answer.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Returns whether Nagle's algorithm is disabled.
    pub fn tcp_nodelay(&self) -> bool {
        self.tcp_nodelay
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfigBuilder::default()
            .build()
            .unwrap_or_else(|_| unreachable!("default network configuration is valid"))
    }
}

/// Builder for [`NetworkConfig`].
#[derive(Debug, Clone, Default)]
pub struct NetworkConfigBuilder {
    contact_points: Vec<SocketAddr>,
    contact_hosts: Vec<String>,
    local_datacenter: Option<String>,
    protocol_version: Option<ProtocolVersion>,
    connect_timeout: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    heartbeat_timeout: Option<Duration>,
    tcp_nodelay: Option<bool>,
}

impl NetworkConfigBuilder {
    /// Creates a new network configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a contact point.
    pub fn add_contact_point(mut self, address: SocketAddr) -> Self {
        self.contact_points.push(address);
        self
    }

    /// Sets the contact points, replacing any previously configured.
    pub fn contact_points(mut self, addresses: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.contact_points = addresses.into_iter().collect();
        self
    }

    /// Adds a contact point given as `host` or `host:port`, resolved at startup.
    pub fn add_contact_host(mut self, host: impl Into<String>) -> Self {
        self.contact_hosts.push(host.into());
        self
    }

    /// Sets the local datacenter.
    pub fn local_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.local_datacenter = Some(datacenter.into());
        self
    }

    /// Sets the highest protocol version to negotiate.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = Some(version);
        self
    }

    /// Sets the connect and handshake timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Sets the heartbeat response timeout.
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    /// Enables or disables TCP_NODELAY.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = Some(nodelay);
        self
    }

    /// Builds the network configuration.
    pub fn build(self) -> Result<NetworkConfig, ConfigError> {
        let connect_timeout = self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        if connect_timeout.is_zero() {
            return Err(ConfigError::new("connect_timeout must be greater than zero"));
        }
        let heartbeat_interval = self
            .heartbeat_interval
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval.is_zero() {
            return Err(ConfigError::new("heartbeat_interval must be greater than zero"));
        }
        let heartbeat_timeout = self.heartbeat_timeout.unwrap_or(DEFAULT_HEARTBEAT_TIMEOUT);
        if heartbeat_timeout.is_zero() {
            return Err(ConfigError::new("heartbeat_timeout must be greater than zero"));
        }
        if matches!(self.local_datacenter.as_deref(), Some(dc) if dc.trim().is_empty()) {
            return Err(ConfigError::new("local_datacenter must not be blank"));
        }

        Ok(NetworkConfig {
            contact_points: self.contact_points,
            contact_hosts: self.contact_hosts,
            local_datacenter: self.local_datacenter,
            protocol_version: self.protocol_version.unwrap_or_default(),
            connect_timeout,
            heartbeat_interval,
            heartbeat_timeout,
            tcp_nodelay: self.tcp_nodelay.unwrap_or(true),
        })
    }
}

/// Channel pool sizing and per-channel limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    local_size: usize,
    remote_size: usize,
    max_requests_per_channel: usize,
    max_orphaned_streams: usize,
    drain_timeout: Duration,
}

impl PoolConfig {
    /// Returns the number of channels kept to each local node.
    pub fn local_size(&self) -> usize {
        self.local_size
    }

    /// Returns the number of channels kept to each remote node.
    pub fn remote_size(&self) -> usize {
        self.remote_size
    }

    /// Returns the number of stream ids usable on one channel.
    pub fn max_requests_per_channel(&self) -> usize {
        self.max_requests_per_channel
    }

    /// Returns the number of orphaned stream ids after which a channel is
    /// closed and replaced.
    pub fn max_orphaned_streams(&self) -> usize {
        self.max_orphaned_streams
    }

    /// Returns how long a channel being removed may wait for in-flight requests.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfigBuilder::default()
            .build()
            .unwrap_or_else(|_| unreachable!("default pool configuration is valid"))
    }
}

/// Builder for [`PoolConfig`].
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    local_size: Option<usize>,
    remote_size: Option<usize>,
    max_requests_per_channel: Option<usize>,
    max_orphaned_streams: Option<usize>,
    drain_timeout: Option<Duration>,
}

impl PoolConfigBuilder {
    /// Creates a new pool configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of channels per local node.
    pub fn local_size(mut self, size: usize) -> Self {
        self.local_size = Some(size);
        self
    }

    /// Sets the number of channels per remote node.
    pub fn remote_size(mut self, size: usize) -> Self {
        self.remote_size = Some(size);
        self
    }

    /// Sets the number of stream ids usable on one channel.
    pub fn max_requests_per_channel(mut self, max: usize) -> Self {
        self.max_requests_per_channel = Some(max);
        self
    }

    /// Sets the orphaned stream threshold.
    pub fn max_orphaned_streams(mut self, max: usize) -> Self {
        self.max_orphaned_streams = Some(max);
        self
    }

    /// Sets the drain timeout for removed channels.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Builds the pool configuration.
    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        let local_size = self.local_size.unwrap_or(DEFAULT_LOCAL_POOL_SIZE);
        if local_size == 0 {
            return Err(ConfigError::new("local_size must be at least 1"));
        }
        let max_requests = self
            .max_requests_per_channel
            .unwrap_or(DEFAULT_MAX_REQUESTS_PER_CHANNEL);
        if max_requests == 0 || max_requests > MAX_STREAM_IDS {
            return Err(ConfigError::new(format!(
                "max_requests_per_channel must be between 1 and {}",
                MAX_STREAM_IDS
            )));
        }
        let max_orphaned = self
            .max_orphaned_streams
            .unwrap_or(DEFAULT_MAX_ORPHANED_STREAMS);
        if max_orphaned == 0 {
            return Err(ConfigError::new("max_orphaned_streams must be at least 1"));
        }

        Ok(PoolConfig {
            local_size,
            remote_size: self.remote_size.unwrap_or(DEFAULT_REMOTE_POOL_SIZE),
            max_requests_per_channel: max_requests,
            max_orphaned_streams: max_orphaned,
            drain_timeout: self.drain_timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT),
        })
    }
}

/// Reconnection backoff settings.
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl ReconnectionConfig {
    /// Returns the first delay after a failure.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Returns the cap on the delay.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Returns the growth factor between consecutive delays.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Returns the jitter ratio applied to each delay.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        ReconnectionConfigBuilder::default()
            .build()
            .unwrap_or_else(|_| unreachable!("default reconnection configuration is valid"))
    }
}

/// Builder for [`ReconnectionConfig`].
#[derive(Debug, Clone, Default)]
pub struct ReconnectionConfigBuilder {
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
}

impl ReconnectionConfigBuilder {
    /// Creates a new reconnection configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the first delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Sets the maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Sets the growth factor.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Sets the jitter ratio (0.0 to 1.0).
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Builds the reconnection configuration.
    pub fn build(self) -> Result<ReconnectionConfig, ConfigError> {
        let base_delay = self.base_delay.unwrap_or(DEFAULT_RECONNECT_BASE_DELAY);
        let max_delay = self.max_delay.unwrap_or(DEFAULT_RECONNECT_MAX_DELAY);
        let multiplier = self.multiplier.unwrap_or(DEFAULT_RECONNECT_MULTIPLIER);
        let jitter = self.jitter.unwrap_or(DEFAULT_RECONNECT_JITTER);

        if base_delay > max_delay {
            return Err(ConfigError::new("base_delay must not exceed max_delay"));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::new("multiplier must be a finite value of at least 1.0"));
        }
        if !jitter.is_finite() || !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::new("jitter must be between 0.0 and 1.0"));
        }

        Ok(ReconnectionConfig {
            base_delay,
            max_delay,
            multiplier,
            jitter,
        })
    }
}

/// Request execution settings that can vary per request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionProfile {
    name: String,
    request_timeout: Duration,
    deadline: Option<Duration>,
    idempotent: bool,
    speculative_execution: bool,
}

impl ExecutionProfile {
    /// Returns the profile name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the timeout of one attempt on one node.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns the overall time budget of a request across all attempts.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Returns the idempotence assumed for requests that do not declare it.
    pub fn idempotent(&self) -> bool {
        self.idempotent
    }

    /// Returns whether speculative executions may be launched.
    pub fn speculative_execution(&self) -> bool {
        self.speculative_execution
    }
}

impl Default for ExecutionProfile {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROFILE.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            deadline: None,
            idempotent: false,
            speculative_execution: true,
        }
    }
}

/// Builder for [`ExecutionProfile`]. Unset values inherit from the default
/// profile.
#[derive(Debug, Clone, Default)]
pub struct ExecutionProfileBuilder {
    request_timeout: Option<Duration>,
    deadline: Option<Option<Duration>>,
    idempotent: Option<bool>,
    speculative_execution: Option<bool>,
}

impl ExecutionProfileBuilder {
    /// Creates a new execution profile builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-attempt timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Sets the overall request deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(Some(deadline));
        self
    }

    /// Removes an inherited overall request deadline.
    pub fn no_deadline(mut self) -> Self {
        self.deadline = Some(None);
        self
    }

    /// Sets the default idempotence.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    /// Allows or forbids speculative executions.
    pub fn speculative_execution(mut self, enabled: bool) -> Self {
        self.speculative_execution = Some(enabled);
        self
    }

    fn build(self, name: &str, parent: &ExecutionProfile) -> Result<ExecutionProfile, ConfigError> {
        let request_timeout = self.request_timeout.unwrap_or(parent.request_timeout);
        if request_timeout.is_zero() {
            return Err(ConfigError::new(format!(
                "profile {}: request_timeout must be greater than zero",
                name
            )));
        }
        let deadline = self.deadline.unwrap_or(parent.deadline);
        if deadline.map_or(false, |d| d.is_zero()) {
            return Err(ConfigError::new(format!(
                "profile {}: deadline must be greater than zero",
                name
            )));
        }
        Ok(ExecutionProfile {
            name: name.to_string(),
            request_timeout,
            deadline,
            idempotent: self.idempotent.unwrap_or(parent.idempotent),
            speculative_execution: self
                .speculative_execution
                .unwrap_or(parent.speculative_execution),
        })
    }
}

/// Speculative execution settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeculativeConfig {
    max_executions: usize,
    delay: Duration,
}

impl SpeculativeConfig {
    /// Returns the maximum number of concurrent executions of one request,
    /// including the first. One disables speculative execution.
    pub fn max_executions(&self) -> usize {
        self.max_executions
    }

    /// Returns the delay before each additional execution.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Returns true if more than one execution is allowed.
    pub fn is_enabled(&self) -> bool {
        self.max_executions > 1
    }
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            max_executions: 1,
            delay: DEFAULT_SPECULATIVE_DELAY,
        }
    }
}

/// Builder for [`SpeculativeConfig`].
#[derive(Debug, Clone, Default)]
pub struct SpeculativeConfigBuilder {
    max_executions: Option<usize>,
    delay: Option<Duration>,
}

impl SpeculativeConfigBuilder {
    /// Creates a new speculative execution builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of executions, including the first.
    pub fn max_executions(mut self, max: usize) -> Self {
        self.max_executions = Some(max);
        self
    }

    /// Sets the delay before each additional execution.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Builds the speculative execution configuration.
    pub fn build(self) -> Result<SpeculativeConfig, ConfigError> {
        let max_executions = self.max_executions.unwrap_or(1);
        if max_executions == 0 {
            return Err(ConfigError::new("max_executions must be at least 1"));
        }
        Ok(SpeculativeConfig {
            max_executions,
            delay: self.delay.unwrap_or(DEFAULT_SPECULATIVE_DELAY),
        })
    }
}

/// Plain-text credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Returns the user name.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the password.
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Complete driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    network: NetworkConfig,
    pool: PoolConfig,
    reconnection: ReconnectionConfig,
    speculative: SpeculativeConfig,
    profiles: HashMap<String, ExecutionProfile>,
    credentials: Option<Credentials>,
    replication_factor: usize,
    retry_server_errors: bool,
}

impl DriverConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::new()
    }

    /// Returns the network configuration.
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    /// Returns the pool configuration.
    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    /// Returns the reconnection configuration.
    pub fn reconnection(&self) -> &ReconnectionConfig {
        &self.reconnection
    }

    /// Returns the speculative execution configuration.
    pub fn speculative(&self) -> &SpeculativeConfig {
        &self.speculative
    }

    /// Returns the default execution profile.
    pub fn default_profile(&self) -> &ExecutionProfile {
        self.profiles
            .get(DEFAULT_PROFILE)
            .unwrap_or_else(|| unreachable!("the default profile is always present"))
    }

    /// Returns a named execution profile.
    pub fn profile(&self, name: &str) -> Option<&ExecutionProfile> {
        self.profiles.get(name)
    }

    /// Returns the names of every profile.
    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Returns the configured credentials.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Returns how many replicas token-aware routing prefers.
    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Returns whether idempotent requests are retried on server errors.
    pub fn retry_server_errors(&self) -> bool {
        self.retry_server_errors
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfigBuilder::new()
            .build()
            .unwrap_or_else(|_| unreachable!("default driver configuration is valid"))
    }
}

/// Builder for [`DriverConfig`].
#[derive(Debug, Clone, Default)]
pub struct DriverConfigBuilder {
    network: NetworkConfigBuilder,
    pool: PoolConfigBuilder,
    reconnection: ReconnectionConfigBuilder,
    speculative: SpeculativeConfigBuilder,
    default_profile: ExecutionProfileBuilder,
    profiles: Vec<(String, ExecutionProfileBuilder)>,
    credentials: Option<Credentials>,
    replication_factor: Option<usize>,
    retry_server_errors: Option<bool>,
}

impl DriverConfigBuilder {
    /// Creates a new driver configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a contact point.
    pub fn add_contact_point(mut self, address: SocketAddr) -> Self {
        self.network = self.network.add_contact_point(address);
        self
    }

    /// Sets the local datacenter.
    pub fn local_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.network = self.network.local_datacenter(datacenter);
        self
    }

    /// Configures network settings using a builder function.
    pub fn network<F>(mut self, f: F) -> Self
    where
        F: FnOnce(NetworkConfigBuilder) -> NetworkConfigBuilder,
    {
        self.network = f(self.network);
        self
    }

    /// Configures pool settings using a builder function.
    pub fn pool<F>(mut self, f: F) -> Self
    where
        F: FnOnce(PoolConfigBuilder) -> PoolConfigBuilder,
    {
        self.pool = f(self.pool);
        self
    }

    /// Configures reconnection settings using a builder function.
    pub fn reconnection<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ReconnectionConfigBuilder) -> ReconnectionConfigBuilder,
    {
        self.reconnection = f(self.reconnection);
        self
    }

    /// Configures speculative execution using a builder function.
    pub fn speculative<F>(mut self, f: F) -> Self
    where
        F: FnOnce(SpeculativeConfigBuilder) -> SpeculativeConfigBuilder,
    {
        self.speculative = f(self.speculative);
        self
    }

    /// Configures the default execution profile using a builder function.
    pub fn request<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ExecutionProfileBuilder) -> ExecutionProfileBuilder,
    {
        self.default_profile = f(self.default_profile);
        self
    }

    /// Adds a named execution profile deriving from the default profile.
    pub fn profile<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(ExecutionProfileBuilder) -> ExecutionProfileBuilder,
    {
        self.profiles.push((name.into(), f(ExecutionProfileBuilder::new())));
        self
    }

    /// Sets plain-text credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    /// Sets how many replicas token-aware routing prefers.
    pub fn replication_factor(mut self, replicas: usize) -> Self {
        self.replication_factor = Some(replicas);
        self
    }

    /// Retries idempotent requests on the next node after a server error.
    pub fn retry_server_errors(mut self, retry: bool) -> Self {
        self.retry_server_errors = Some(retry);
        self
    }

    /// Builds the driver configuration.
    pub fn build(self) -> Result<DriverConfig, ConfigError> {
        let default_profile = self
            .default_profile
            .build(DEFAULT_PROFILE, &ExecutionProfile::default())?;

        let mut profiles = HashMap::new();
        for (name, builder) in self.profiles {
            if name.is_empty() {
                return Err(ConfigError::new("profile name must not be empty"));
            }
            if name == DEFAULT_PROFILE || profiles.contains_key(&name) {
                return Err(ConfigError::new(format!("duplicate profile {}", name)));
            }
            let profile = builder.build(&name, &default_profile)?;
            profiles.insert(name, profile);
        }
        profiles.insert(DEFAULT_PROFILE.to_string(), default_profile);

        let replication_factor = self
            .replication_factor
            .unwrap_or(DEFAULT_REPLICATION_FACTOR);
        if replication_factor == 0 {
            return Err(ConfigError::new("replication_factor must be at least 1"));
        }

        Ok(DriverConfig {
            network: self.network.build()?,
            pool: self.pool.build()?,
            reconnection: self.reconnection.build()?,
            speculative: self.speculative.build()?,
            profiles,
            credentials: self.credentials,
            replication_factor,
            retry_server_errors: self.retry_server_errors.unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DriverConfig::default();
        assert!(config.network().contact_points().is_empty());
        assert!(!config.network().has_explicit_contact_points());
        assert_eq!(config.network().protocol_version(), ProtocolVersion::V4);
        assert_eq!(config.pool().local_size(), 2);
        assert_eq!(config.pool().remote_size(), 1);
        assert_eq!(config.pool().max_requests_per_channel(), 1024);
        assert_eq!(config.default_profile().request_timeout(), Duration::from_secs(2));
        assert!(!config.default_profile().idempotent());
        assert!(!config.speculative().is_enabled());
        assert!(config.credentials().is_none());
    }

    #[test]
    fn test_implicit_contact_point() {
        assert_eq!(
            NetworkConfig::implicit_contact_point(),
            "127.0.0.1:9042".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_network_builder() {
        let addr: SocketAddr = "10.0.0.1:9042".parse().unwrap();
        let config = DriverConfig::builder()
            .add_contact_point(addr)
            .local_datacenter("dc1")
            .network(|n| {
                n.connect_timeout(Duration::from_secs(1))
                    .heartbeat_interval(Duration::from_secs(10))
                    .protocol_version(ProtocolVersion::V3)
                    .add_contact_host("db.example.com")
            })
            .build()
            .unwrap();

        assert_eq!(config.network().contact_points(), &[addr]);
        assert_eq!(config.network().contact_hosts(), &["db.example.com".to_string()]);
        assert!(config.network().has_explicit_contact_points());
        assert_eq!(config.network().local_datacenter(), Some("dc1"));
        assert_eq!(config.network().connect_timeout(), Duration::from_secs(1));
        assert_eq!(config.network().protocol_version(), ProtocolVersion::V3);
    }

    #[test]
    fn test_blank_datacenter_rejected() {
        let result = DriverConfig::builder().local_datacenter("  ").build();
        assert!(result.unwrap_err().to_string().contains("local_datacenter"));
    }

    #[test]
    fn test_pool_validation() {
        assert!(PoolConfigBuilder::new().local_size(0).build().is_err());
        assert!(PoolConfigBuilder::new()
            .max_requests_per_channel(40000)
            .build()
            .is_err());
        assert!(PoolConfigBuilder::new()
            .max_requests_per_channel(0)
            .build()
            .is_err());
        let pool = PoolConfigBuilder::new()
            .local_size(4)
            .remote_size(0)
            .build()
            .unwrap();
        assert_eq!(pool.local_size(), 4);
        assert_eq!(pool.remote_size(), 0);
    }

    #[test]
    fn test_reconnection_validation() {
        assert!(ReconnectionConfigBuilder::new()
            .base_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(1))
            .build()
            .is_err());
        assert!(ReconnectionConfigBuilder::new().multiplier(0.5).build().is_err());
        assert!(ReconnectionConfigBuilder::new().jitter(1.5).build().is_err());
        let config = ReconnectionConfigBuilder::new()
            .base_delay(Duration::from_millis(50))
            .jitter(0.0)
            .build()
            .unwrap();
        assert_eq!(config.base_delay(), Duration::from_millis(50));
        assert_eq!(config.jitter(), 0.0);
    }

    #[test]
    fn test_reconnection_rejects_non_finite_values() {
        assert!(ReconnectionConfigBuilder::new()
            .multiplier(f64::INFINITY)
            .build()
            .is_err());
        assert!(ReconnectionConfigBuilder::new().multiplier(f64::NAN).build().is_err());
        assert!(ReconnectionConfigBuilder::new().jitter(f64::NAN).build().is_err());
    }

    #[test]
    fn test_profiles_inherit_from_default() {
        let config = DriverConfig::builder()
            .request(|r| r.request_timeout(Duration::from_secs(5)).idempotent(true))
            .profile("analytics", |p| p.deadline(Duration::from_secs(30)))
            .profile("oltp", |p| p.request_timeout(Duration::from_millis(200)).idempotent(false))
            .build()
            .unwrap();

        let analytics = config.profile("analytics").unwrap();
        assert_eq!(analytics.request_timeout(), Duration::from_secs(5));
        assert!(analytics.idempotent());
        assert_eq!(analytics.deadline(), Some(Duration::from_secs(30)));

        let oltp = config.profile("oltp").unwrap();
        assert_eq!(oltp.request_timeout(), Duration::from_millis(200));
        assert!(!oltp.idempotent());
        assert_eq!(oltp.deadline(), None);

        assert!(config.profile("missing").is_none());
        assert_eq!(config.profile_names().count(), 3);
    }

    #[test]
    fn test_duplicate_profile_rejected() {
        let result = DriverConfig::builder()
            .profile("a", |p| p)
            .profile("a", |p| p)
            .build();
        assert!(result.is_err());

        let result = DriverConfig::builder().profile(DEFAULT_PROFILE, |p| p).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_request_timeout_rejected() {
        let result = DriverConfig::builder()
            .request(|r| r.request_timeout(Duration::ZERO))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_speculative_config() {
        let config = DriverConfig::builder()
            .speculative(|s| s.max_executions(3).delay(Duration::from_millis(20)))
            .build()
            .unwrap();
        assert!(config.speculative().is_enabled());
        assert_eq!(config.speculative().max_executions(), 3);
        assert!(SpeculativeConfigBuilder::new().max_executions(0).build().is_err());
    }

    #[test]
    fn test_credentials_are_redacted() {
        let config = DriverConfig::builder()
            .credentials("cassandra", "secret")
            .build()
            .unwrap();
        let creds = config.credentials().unwrap();
        assert_eq!(creds.username(), "cassandra");
        assert!(!format!("{:?}", creds).contains("secret"));
    }

    #[test]
    fn test_protocol_version_downgrade() {
        assert_eq!(ProtocolVersion::V4.downgrade(), Some(ProtocolVersion::V3));
        assert_eq!(ProtocolVersion::V3.downgrade(), None);
        assert_eq!(ProtocolVersion::from_value(4), Some(ProtocolVersion::V4));
        assert_eq!(ProtocolVersion::from_value(5), None);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::new("bad value");
        assert_eq!(err.to_string(), "configuration error: bad value");
        let driver: cql_core::DriverError = err.into();
        assert!(matches!(driver, cql_core::DriverError::Configuration(_)));
    }
}
