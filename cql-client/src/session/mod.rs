//! The session: the entry point tying registry, pools, policies and the
//! control connection together.

mod control;
mod pools;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cql_core::protocol::ServerEvent;
use cql_core::{ConnectionError, DriverError, Result};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use self::control::ControlConnection;
use self::pools::PoolManager;
use crate::config::{DriverConfig, NetworkConfig, ProtocolVersion};
use crate::connection::{
    Authenticator, ChannelConfig, ExponentialReconnectionPolicy, PlainTextAuthenticator,
    ReconnectionPolicy,
};
use crate::metadata::{
    ClusterSnapshot, Node, NodeEvent, NodeInfo, NodeRegistry, StaticTopologyMonitor,
    TopologyMonitor,
};
use crate::policy::{
    discover_local_datacenter, ConstantSpeculativeExecution, DefaultLoadBalancingPolicy,
    DefaultRetryPolicy, LoadBalancingPolicy, NoSpeculativeExecution, RetryPolicy,
    SpeculativeExecutionPolicy,
};
use crate::request::{PoolMap, Request, RequestHandler, Response};

/// Capacity of the push event and lifecycle channels.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// The session started connecting.
    Starting,
    /// The session is connected and accepts requests.
    Started,
    /// The session started closing.
    ShuttingDown,
    /// Every channel is closed.
    Shutdown,
}

impl SessionEvent {
    /// Returns the name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Configures the policies and collaborators of a [`Session`].
///
/// Anything left unset falls back to the default implementation configured
/// from the [`DriverConfig`].
pub struct SessionBuilder {
    config: DriverConfig,
    load_balancing: Option<Arc<dyn LoadBalancingPolicy>>,
    retry: Option<Arc<dyn RetryPolicy>>,
    speculative: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    reconnection: Option<Arc<dyn ReconnectionPolicy>>,
    monitor: Option<Arc<dyn TopologyMonitor>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    lifecycle: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionBuilder {
    /// Creates a builder for the given configuration.
    pub fn new(config: DriverConfig) -> Self {
        let (lifecycle, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            load_balancing: None,
            retry: None,
            speculative: None,
            reconnection: None,
            monitor: None,
            authenticator: None,
            lifecycle,
        }
    }

    /// Replaces the load balancing policy.
    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.load_balancing = Some(policy);
        self
    }

    /// Replaces the retry policy.
    pub fn retry(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Replaces the speculative execution policy.
    pub fn speculative(mut self, policy: Arc<dyn SpeculativeExecutionPolicy>) -> Self {
        self.speculative = Some(policy);
        self
    }

    /// Replaces the reconnection policy used by pools and the control
    /// connection.
    pub fn reconnection(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.reconnection = Some(policy);
        self
    }

    /// Sets the source of node information.
    pub fn topology_monitor(mut self, monitor: Arc<dyn TopologyMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Replaces the authenticator derived from the configured credentials.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Subscribes to lifecycle events, including those emitted while
    /// connecting.
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<SessionEvent> {
        self.lifecycle.subscribe()
    }

    /// Connects to the cluster.
    ///
    /// Opens the control connection, discovers the nodes and the local
    /// datacenter, then opens the pools. Fails if no contact point accepts
    /// a connection or the local datacenter cannot be determined.
    #[instrument(name = "session.connect", skip(self))]
    pub async fn connect(self) -> Result<Session> {
        let _ = self.lifecycle.send(SessionEvent::Starting);
        tracing::debug!("session lifecycle: Starting");

        let config = Arc::new(self.config);
        let contact_points = resolve_contact_points(config.network()).await?;

        let authenticator = self.authenticator.or_else(|| {
            config.credentials().map(|c| {
                Arc::new(PlainTextAuthenticator::new(c.username(), c.password()))
                    as Arc<dyn Authenticator>
            })
        });
        let reconnection = self.reconnection.unwrap_or_else(|| {
            Arc::new(ExponentialReconnectionPolicy::from_config(config.reconnection()))
        });
        let balancer = self.load_balancing.unwrap_or_else(|| {
            Arc::new(DefaultLoadBalancingPolicy::new(config.replication_factor()))
        });
        let retry = self.retry.unwrap_or_else(|| {
            Arc::new(DefaultRetryPolicy::new().with_server_error_retries(config.retry_server_errors()))
        });
        let speculative: Arc<dyn SpeculativeExecutionPolicy> = match self.speculative {
            Some(policy) => policy,
            None if config.speculative().is_enabled() => {
                Arc::new(ConstantSpeculativeExecution::from_config(config.speculative()))
            }
            None => Arc::new(NoSpeculativeExecution),
        };
        let monitor = self.monitor.unwrap_or_else(|| {
            Arc::new(StaticTopologyMonitor::from_addresses(
                &contact_points,
                config.network().local_datacenter(),
            ))
        });

        let (server_events, control_events) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let base = ChannelConfig::from_config(&config, config.network().protocol_version())
            .with_authenticator(authenticator);
        let (control_channel, version) =
            control::connect_first(&contact_points, base.clone().with_events(server_events.clone()))
                .await?;
        let control_address = control_channel.address();

        let mut infos = monitor.refresh_node_list().await?;
        if !infos.iter().any(|i| i.address == control_address) {
            infos.push(NodeInfo::new(control_address));
        }
        let find = |address: SocketAddr| {
            infos
                .iter()
                .find(|i| i.address == address)
                .cloned()
                .unwrap_or_else(|| NodeInfo::new(address))
        };
        let contact_infos: Vec<NodeInfo> = contact_points.iter().map(|a| find(*a)).collect();
        let control_info = find(control_address);
        let local_datacenter = discover_local_datacenter(
            config.network().local_datacenter(),
            !config.network().has_explicit_contact_points(),
            &contact_infos,
            Some(&control_info),
        )?;
        balancer.init(Some(&local_datacenter));

        let registry = Arc::new(NodeRegistry::new());
        let node_events = registry.subscribe();
        for info in infos {
            let distance = balancer.distance(&info);
            registry.add_node(info, distance);
        }
        if let Some(node) = registry.by_address(&control_address) {
            registry.signal_up(node.id());
        }

        let pools: PoolMap = PoolMap::default();
        let channel_config = ChannelConfig {
            version,
            ..base.clone()
        };
        let manager = PoolManager::new(
            Arc::clone(&registry),
            Arc::clone(&pools),
            config.pool().clone(),
            channel_config.clone(),
            Arc::clone(&reconnection),
        );
        let usable = manager.init().await;
        if usable == 0 {
            tracing::warn!("no node accepted a pooled connection yet");
        }

        let control = ControlConnection::new(
            control_channel,
            ChannelConfig {
                version,
                ..base.with_events(server_events.clone())
            },
            Arc::clone(&registry),
            Arc::clone(&balancer),
            Arc::clone(&monitor),
            reconnection,
        );

        let handler = RequestHandler::new(Arc::clone(&pools), retry, speculative);
        let shutdown = CancellationToken::new();
        let tasks = vec![
            manager.spawn(node_events, shutdown.clone()),
            control.spawn(control_events, shutdown.clone()),
        ];

        let inner = Arc::new(SessionInner {
            config,
            registry,
            pools,
            balancer,
            handler,
            monitor,
            control,
            manager,
            version,
            local_datacenter,
            server_events,
            lifecycle: self.lifecycle,
            shutdown,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        });

        tracing::info!(
            version = %version,
            local_datacenter = %inner.local_datacenter,
            nodes = inner.registry.snapshot().len(),
            "session connected"
        );
        let _ = inner.lifecycle.send(SessionEvent::Started);
        tracing::debug!("session lifecycle: Started");

        Ok(Session { inner })
    }
}

/// Resolves configured contact points, falling back to the implicit local
/// contact point.
async fn resolve_contact_points(network: &NetworkConfig) -> Result<Vec<SocketAddr>> {
    if !network.has_explicit_contact_points() {
        return Ok(vec![NetworkConfig::implicit_contact_point()]);
    }
    let mut addresses: Vec<SocketAddr> = network.contact_points().to_vec();
    for host in network.contact_hosts() {
        match tokio::net::lookup_host(host.as_str()).await {
            Ok(resolved) => {
                for address in resolved {
                    if !addresses.contains(&address) {
                        addresses.push(address);
                    }
                }
            }
            Err(e) => tracing::warn!(host = %host, error = %e, "failed to resolve contact point"),
        }
    }
    if addresses.is_empty() {
        return Err(ConnectionError::Resolve(network.contact_hosts().join(", ")).into());
    }
    Ok(addresses)
}

struct SessionInner {
    config: Arc<DriverConfig>,
    registry: Arc<NodeRegistry>,
    pools: PoolMap,
    balancer: Arc<dyn LoadBalancingPolicy>,
    handler: RequestHandler,
    monitor: Arc<dyn TopologyMonitor>,
    control: Arc<ControlConnection>,
    manager: Arc<PoolManager>,
    version: ProtocolVersion,
    local_datacenter: String,
    server_events: broadcast::Sender<ServerEvent>,
    lifecycle: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionInner {
    async fn execute(&self, request: &Request, cancel: CancellationToken) -> Result<Response> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::ChannelClosed("session is closed".to_string()));
        }
        let profile = match request.profile() {
            Some(name) => self.config.profile(name).ok_or_else(|| {
                DriverError::Configuration(format!("unknown execution profile {name}"))
            })?,
            None => self.config.default_profile(),
        };
        let plan = self
            .balancer
            .new_query_plan(request.token(), &self.registry.snapshot());
        self.handler.execute(request, profile, plan, cancel).await
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A connected session.
///
/// Cloning is cheap; clones share the same pools and background tasks.
///
/// # Example
///
/// ```ignore
/// use cql_client::{Consistency, DriverConfig, Request, Session};
///
/// let config = DriverConfig::builder()
///     .add_contact_point("10.0.0.1:9042".parse()?)
///     .local_datacenter("dc1")
///     .build()?;
/// let session = Session::connect(config).await?;
///
/// let request = Request::query("SELECT release_version FROM system.local", Consistency::One)
///     .with_idempotent(true);
/// let response = session.execute(&request).await?;
/// println!("answered by {:?}", response.info().coordinator);
///
/// session.close().await;
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("version", &self.inner.version)
            .field("local_datacenter", &self.inner.local_datacenter)
            .field("nodes", &self.inner.registry.snapshot().len())
            .finish()
    }
}

impl Session {
    /// Returns a builder for customizing policies.
    pub fn builder(config: DriverConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Connects with the default policies.
    pub async fn connect(config: DriverConfig) -> Result<Self> {
        SessionBuilder::new(config).connect().await
    }

    /// Executes a request and waits for its outcome.
    ///
    /// Dropping the returned future cancels the request.
    pub async fn execute(&self, request: &Request) -> Result<Response> {
        let cancel = self.inner.shutdown.child_token();
        self.inner.execute(request, cancel).await
    }

    /// Starts a request in the background.
    pub fn submit(&self, request: Request) -> ExecutionHandle {
        let cancel = self.inner.shutdown.child_token();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let task = tokio::spawn(async move { inner.execute(&request, token).await });
        ExecutionHandle { cancel, task }
    }

    /// Returns the protocol version negotiated with the cluster.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.inner.version
    }

    /// Returns the local datacenter.
    pub fn local_datacenter(&self) -> &str {
        &self.inner.local_datacenter
    }

    /// Returns the driver configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    /// Returns the current view of the cluster.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.inner.registry.snapshot()
    }

    /// Returns a node by address.
    pub fn node(&self, address: SocketAddr) -> Option<Arc<Node>> {
        self.inner.registry.by_address(&address)
    }

    /// Returns the number of open pooled channels to a node.
    pub fn open_channels(&self, address: SocketAddr) -> usize {
        let Some(node) = self.node(address) else {
            return 0;
        };
        self.inner
            .pools
            .read()
            .get(&node.id())
            .map_or(0, |pool| pool.size())
    }

    /// Returns the address the control connection is connected to.
    pub fn control_address(&self) -> Option<SocketAddr> {
        self.inner.control.address()
    }

    /// Subscribes to node registry transitions.
    pub fn subscribe_nodes(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.registry.subscribe()
    }

    /// Subscribes to push events received on the control connection,
    /// schema changes included.
    pub fn subscribe_server_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.server_events.subscribe()
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.lifecycle.subscribe()
    }

    /// Administratively disables a node: its pool is drained and it leaves
    /// every query plan until [`force_up`](Self::force_up).
    pub fn force_down(&self, address: SocketAddr) -> bool {
        match self.node(address) {
            Some(node) => self.inner.registry.force_down(node.id()),
            None => false,
        }
    }

    /// Re-enables a node disabled by [`force_down`](Self::force_down) and
    /// reconnects to it.
    pub fn force_up(&self, address: SocketAddr) -> bool {
        match self.node(address) {
            Some(node) => self.inner.registry.force_up(node.id()),
            None => false,
        }
    }

    /// Removes a node from the registry and closes its pool.
    pub fn forget_node(&self, address: SocketAddr) -> bool {
        self.inner.registry.remove_node(&address).is_some()
    }

    /// Reloads the node list from the topology monitor.
    pub async fn refresh_nodes(&self) -> Result<()> {
        self.inner.control.refresh_nodes().await
    }

    /// Asks the topology monitor whether every node agrees on the schema.
    pub async fn check_schema_agreement(&self) -> Result<bool> {
        self.inner.monitor.check_schema_agreement().await
    }

    /// Returns true once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes every channel. Pending requests fail or are cancelled. Idempotent.
    #[instrument(name = "session.close", skip(self))]
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.lifecycle.send(SessionEvent::ShuttingDown);
        tracing::debug!("session lifecycle: ShuttingDown");

        self.inner.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "background task ended abnormally");
            }
        }
        self.inner.control.close();
        self.inner.manager.close_all();

        let _ = self.inner.lifecycle.send(SessionEvent::Shutdown);
        tracing::debug!("session lifecycle: Shutdown");
        tracing::info!("session closed");
    }
}

/// A request running in the background.
#[derive(Debug)]
pub struct ExecutionHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<Response>>,
}

impl ExecutionHandle {
    /// Cancels the request. Its outcome is discarded and
    /// [`result`](Self::result) returns [`DriverError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the request completed.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the outcome.
    pub async fn result(self) -> Result<Response> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(DriverError::Cancelled),
            Err(e) => Err(DriverError::Protocol(format!("execution task failed: {e}"))),
        }
    }
}
