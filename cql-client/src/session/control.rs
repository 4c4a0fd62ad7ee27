//! The control connection: one channel registered for push events, used to
//! keep the node registry in sync with the cluster.

use std::net::SocketAddr;
use std::sync::Arc;

use cql_core::protocol::{ServerEvent, StatusChangeType, TopologyChangeType};
use cql_core::{ConnectionError, DriverError, NodeErrors, Result};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::ProtocolVersion;
use crate::connection::{ChannelConfig, DriverChannel, ReconnectionPolicy};
use crate::metadata::{Distance, NodeInfo, NodeRegistry, NodeState, TopologyMonitor};
use crate::policy::LoadBalancingPolicy;

/// Opens the first control channel, trying contact points in order.
///
/// A server rejecting the requested protocol version is retried with the
/// next lower version; the version that worked is returned and used for
/// every later channel.
#[instrument(name = "control.connect", skip(contact_points, config), fields(contact_points = contact_points.len()))]
pub(crate) async fn connect_first(
    contact_points: &[SocketAddr],
    config: ChannelConfig,
) -> Result<(DriverChannel, ProtocolVersion)> {
    let mut version = config.version;
    let mut errors = NodeErrors::new();

    for &address in contact_points {
        loop {
            let attempt = ChannelConfig {
                version,
                ..config.clone()
            };
            match DriverChannel::connect(address, attempt).await {
                Ok(channel) => {
                    tracing::info!(%address, %version, "control connection established");
                    return Ok((channel, version));
                }
                Err(error) => {
                    let lower = match &error {
                        DriverError::Connection(ConnectionError::ProtocolMismatch { .. }) => {
                            version.downgrade()
                        }
                        _ => None,
                    };
                    match lower {
                        Some(lower) => {
                            tracing::info!(%address, rejected = %version, next = %lower, "downgrading protocol version");
                            version = lower;
                        }
                        None => {
                            tracing::warn!(%address, error = %error, "contact point unreachable");
                            errors.push(address, error);
                            break;
                        }
                    }
                }
            }
        }
    }
    Err(DriverError::NoNodeAvailable(errors))
}

/// Keeps the control channel open and applies push events to the registry.
pub(crate) struct ControlConnection {
    channel: RwLock<Option<Arc<DriverChannel>>>,
    config: ChannelConfig,
    registry: Arc<NodeRegistry>,
    balancer: Arc<dyn LoadBalancingPolicy>,
    monitor: Arc<dyn TopologyMonitor>,
    reconnection: Arc<dyn ReconnectionPolicy>,
}

impl std::fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlConnection")
            .field("address", &self.address())
            .finish()
    }
}

impl ControlConnection {
    pub(crate) fn new(
        channel: DriverChannel,
        config: ChannelConfig,
        registry: Arc<NodeRegistry>,
        balancer: Arc<dyn LoadBalancingPolicy>,
        monitor: Arc<dyn TopologyMonitor>,
        reconnection: Arc<dyn ReconnectionPolicy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel: RwLock::new(Some(Arc::new(channel))),
            config,
            registry,
            balancer,
            monitor,
            reconnection,
        })
    }

    /// Returns the address of the node the control channel is connected to.
    pub(crate) fn address(&self) -> Option<SocketAddr> {
        self.channel
            .read()
            .as_ref()
            .filter(|c| c.is_open())
            .map(|c| c.address())
    }

    /// Runs the event loop until `shutdown` fires.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<ServerEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let control = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let closed: BoxFuture<'static, ()> = match control.channel.read().as_ref() {
                    Some(channel) => channel.closed().boxed(),
                    None => futures::future::pending().boxed(),
                };
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => control.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "missed push events, refreshing nodes");
                            if let Err(e) = control.refresh_nodes().await {
                                tracing::warn!(error = %e, "node refresh failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = closed => control.reconnect(&shutdown).await,
                }
            }
            control.close();
        })
    }

    /// Closes the control channel.
    pub(crate) fn close(&self) {
        if let Some(channel) = self.channel.write().take() {
            channel.close("session closed");
        }
    }

    #[instrument(name = "control.reconnect", skip(self, shutdown))]
    async fn reconnect(&self, shutdown: &CancellationToken) {
        if let Some(old) = self.channel.write().take() {
            tracing::warn!(
                address = %old.address(),
                reason = old.close_reason().unwrap_or_default(),
                "control connection lost"
            );
        }
        let mut schedule = self.reconnection.new_schedule();
        loop {
            if let Some(channel) = self.open_any().await {
                tracing::info!(address = %channel.address(), "control connection re-established");
                *self.channel.write() = Some(channel);
                if let Err(e) = self.refresh_nodes().await {
                    tracing::warn!(error = %e, "node refresh after reconnection failed");
                }
                return;
            }
            let delay = schedule.next_delay();
            tracing::debug!(delay = ?delay, "retrying control connection");
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn open_any(&self) -> Option<Arc<DriverChannel>> {
        let snapshot = self.registry.snapshot();
        let mut candidates: Vec<SocketAddr> = self
            .balancer
            .new_query_plan(None, &snapshot)
            .map(|n| n.address())
            .collect();
        if candidates.is_empty() {
            candidates = snapshot
                .nodes()
                .into_iter()
                .filter(|n| n.state() != NodeState::ForcedDown && n.distance() != Distance::Ignored)
                .map(|n| n.address())
                .collect();
        }
        for address in candidates {
            match DriverChannel::connect(address, self.config.clone()).await {
                Ok(channel) => return Some(Arc::new(channel)),
                Err(e) => tracing::debug!(%address, error = %e, "control connection attempt failed"),
            }
        }
        None
    }

    /// Applies one push event.
    pub(crate) async fn handle_event(&self, event: ServerEvent) {
        tracing::debug!(%event, "push event");
        match event {
            ServerEvent::TopologyChange { change, address } => match change {
                TopologyChangeType::NewNode => self.on_new_node(address).await,
                TopologyChangeType::RemovedNode => {
                    if self.registry.remove_node(&address).is_some() {
                        tracing::info!(%address, "node removed from the cluster");
                    }
                }
                TopologyChangeType::MovedNode => self.on_moved_node(address).await,
            },
            ServerEvent::StatusChange { change, address } => {
                let Some(node) = self.registry.by_address(&address) else {
                    tracing::debug!(%address, "status change for unknown node");
                    return;
                };
                match change {
                    StatusChangeType::Up => self.registry.signal_up(node.id()),
                    StatusChangeType::Down => self.registry.signal_down(node.id()),
                };
            }
            ServerEvent::SchemaChange { .. } => {}
        }
    }

    async fn on_new_node(&self, address: SocketAddr) {
        if self.registry.by_address(&address).is_some() {
            return;
        }
        match self.monitor.get_new_node_info(address).await {
            Ok(Some(info)) => {
                let distance = self.balancer.distance(&info);
                let node = self.registry.add_node(info, distance);
                tracing::info!(node = %node, %distance, "node added to the cluster");
            }
            Ok(None) => tracing::debug!(%address, "ignoring unknown new node"),
            Err(e) => tracing::warn!(%address, error = %e, "failed to look up new node"),
        }
    }

    async fn on_moved_node(&self, address: SocketAddr) {
        let Some(node) = self.registry.by_address(&address) else {
            return;
        };
        match self.monitor.refresh_node(&node).await {
            Ok(Some(info)) => {
                self.apply_info(info);
            }
            Ok(None) => tracing::debug!(%address, "moved node is no longer known"),
            Err(e) => tracing::warn!(%address, error = %e, "failed to refresh moved node"),
        }
    }

    /// Replaces the registry contents with a full node list.
    #[instrument(name = "control.refresh_nodes", skip(self))]
    pub(crate) async fn refresh_nodes(&self) -> Result<()> {
        let infos = self.monitor.refresh_node_list().await?;
        if infos.is_empty() {
            tracing::debug!("topology monitor returned no nodes, keeping the current list");
            return Ok(());
        }
        for node in self.registry.snapshot().nodes() {
            if !infos.iter().any(|i| i.address == node.address()) {
                self.registry.remove_node(&node.address());
            }
        }
        for info in infos {
            self.apply_info(info);
        }
        Ok(())
    }

    fn apply_info(&self, info: NodeInfo) {
        let distance = self.balancer.distance(&info);
        match self.registry.by_address(&info.address) {
            Some(node) => {
                self.registry.refresh_node(info);
                self.registry.set_distance(node.id(), distance);
            }
            None => {
                self.registry.add_node(info, distance);
            }
        }
    }
}
