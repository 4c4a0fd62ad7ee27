//! Per-node channel pools.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use cql_core::{DriverError, Result};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::channel::{ChannelConfig, ChannelId, DriverChannel};
use super::reconnection::ReconnectionPolicy;
use crate::config::PoolConfig;
use crate::metadata::{Distance, NodeId, NodeRegistry, NodeState};

/// The set of channels kept open to one node.
///
/// The pool converges its size towards a target derived from the node's
/// distance and state, and reconnects with backoff when channels fail.
pub struct ChannelPool {
    node: NodeId,
    address: SocketAddr,
    registry: Arc<NodeRegistry>,
    config: PoolConfig,
    channel_config: ChannelConfig,
    reconnection: Arc<dyn ReconnectionPolicy>,
    channels: RwLock<Vec<Arc<DriverChannel>>>,
    resize: tokio::sync::Mutex<()>,
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("node", &self.node)
            .field("address", &self.address)
            .field("size", &self.size())
            .finish()
    }
}

impl ChannelPool {
    /// Creates an empty pool. Call [`ensure_size`](Self::ensure_size) to open
    /// channels.
    pub fn new(
        node: NodeId,
        address: SocketAddr,
        registry: Arc<NodeRegistry>,
        config: PoolConfig,
        channel_config: ChannelConfig,
        reconnection: Arc<dyn ReconnectionPolicy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            address,
            registry,
            config,
            channel_config,
            reconnection,
            channels: RwLock::new(Vec::new()),
            resize: tokio::sync::Mutex::new(()),
            reconnecting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Returns the node this pool connects to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Returns the address of the node.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Returns the number of channels the pool should hold right now.
    pub fn target_size(&self) -> usize {
        let Some(node) = self.registry.get(self.node) else {
            return 0;
        };
        if node.state() == NodeState::ForcedDown {
            return 0;
        }
        match node.distance() {
            Distance::Local => self.config.local_size(),
            Distance::Remote => self.config.remote_size(),
            Distance::Ignored => 0,
        }
    }

    /// Returns the number of open channels.
    pub fn size(&self) -> usize {
        self.channels.read().iter().filter(|c| c.is_open()).count()
    }

    /// Returns the channels currently held.
    pub fn channels(&self) -> Vec<Arc<DriverChannel>> {
        self.channels.read().clone()
    }

    /// Returns true if at least one channel accepts requests.
    pub fn is_usable(&self) -> bool {
        self.channels.read().iter().any(|c| c.is_open())
    }

    /// Returns true once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Returns the open channel with the fewest reserved stream ids.
    pub fn pick_channel(&self) -> Result<Arc<DriverChannel>> {
        self.channels
            .read()
            .iter()
            .filter(|c| c.is_open())
            .min_by_key(|c| c.streams_in_use())
            .cloned()
            .ok_or(DriverError::NodeUnavailable(self.address))
    }

    /// Opens or drains channels until the pool matches its target size.
    ///
    /// Channels that are kept are never interrupted. Returns the number of
    /// open channels. Fails only if channels were needed and none could be
    /// opened; the node is then signalled down and reconnection starts.
    #[instrument(
        name = "pool.ensure_size",
        skip(self),
        fields(node = %self.node, address = %self.address)
    )]
    pub async fn ensure_size(self: &Arc<Self>) -> Result<usize> {
        let _resizing = self.resize.lock().await;
        if self.is_closed() {
            return Ok(0);
        }

        let target = self.target_size();
        let (current, excess) = {
            let mut channels = self.channels.write();
            channels.retain(|c| !c.is_closed());
            let current = channels.len();
            if current > target {
                channels.sort_by_key(|c| std::cmp::Reverse(c.streams_in_use()));
                (current, channels.split_off(target))
            } else {
                (current, Vec::new())
            }
        };

        if !excess.is_empty() {
            tracing::debug!(target, draining = excess.len(), "shrinking pool");
            let drain_timeout = self.config.drain_timeout();
            join_all(excess.iter().map(|c| c.close_gracefully(drain_timeout))).await;
            return Ok(self.size());
        }

        if current == target {
            return Ok(current);
        }

        let missing = target - current;
        tracing::debug!(target, missing, "growing pool");
        let results = join_all(
            (0..missing).map(|_| DriverChannel::connect(self.address, self.channel_config.clone())),
        )
        .await;

        let mut opened = 0;
        let mut last_error = None;
        for result in results {
            match result {
                Ok(channel) => {
                    let channel = Arc::new(channel);
                    self.watch(&channel);
                    self.channels.write().push(channel);
                    opened += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open channel");
                    last_error = Some(e);
                }
            }
        }

        if self.is_closed() {
            self.close_channels("pool closed");
            return Ok(0);
        }

        let size = self.channels.read().len();
        if opened > 0 {
            self.registry.signal_up(self.node);
        }
        if size < target {
            self.schedule_reconnect();
        }
        match last_error {
            Some(error) if size == 0 => {
                self.registry.signal_down(self.node);
                Err(error)
            }
            _ => {
                tracing::debug!(size, "pool resized");
                Ok(size)
            }
        }
    }

    fn watch(self: &Arc<Self>, channel: &Arc<DriverChannel>) {
        let pool: Weak<Self> = Arc::downgrade(self);
        let closed = channel.closed();
        let id = channel.id();
        tokio::spawn(async move {
            closed.await;
            if let Some(pool) = pool.upgrade() {
                pool.on_channel_closed(id);
            }
        });
    }

    fn on_channel_closed(self: &Arc<Self>, id: ChannelId) {
        let (removed, remaining) = {
            let mut channels = self.channels.write();
            let before = channels.len();
            channels.retain(|c| c.id() != id);
            (before != channels.len(), channels.len())
        };
        if !removed || self.is_closed() {
            return;
        }
        tracing::debug!(node = %self.node, channel = %id, remaining, "pool lost a channel");
        if remaining == 0 {
            self.registry.signal_down(self.node);
        }
        if remaining < self.target_size() {
            self.schedule_reconnect();
        }
    }

    /// Starts a background reconnection loop unless one is already running.
    ///
    /// Each outage gets a fresh backoff schedule.
    pub fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_closed() || self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = Arc::downgrade(self);
        let mut schedule = self.reconnection.new_schedule();
        let shutdown = self.shutdown.clone();
        let address = self.address;

        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let delay = schedule.next_delay();
                tracing::debug!(%address, attempt, delay = ?delay, "scheduling reconnection");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let Some(pool) = pool.upgrade() else {
                    return;
                };
                let target = pool.target_size();
                if target == 0 {
                    pool.reconnecting.store(false, Ordering::Release);
                    return;
                }
                match pool.ensure_size().await {
                    Ok(size) if size >= pool.target_size() => {
                        tracing::info!(%address, attempt, "reconnected");
                        pool.reconnecting.store(false, Ordering::Release);
                        return;
                    }
                    Ok(size) => tracing::debug!(%address, size, "pool still below target"),
                    Err(e) => tracing::warn!(%address, attempt, error = %e, "reconnection failed"),
                }
            }
        });
    }

    /// Returns true while a reconnection loop is running.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    /// Closes every channel after the node was reported down, and starts
    /// reconnecting.
    pub fn on_node_down(self: &Arc<Self>) {
        self.close_channels("node reported down");
        self.schedule_reconnect();
    }

    fn close_channels(&self, reason: &str) {
        let channels = std::mem::take(&mut *self.channels.write());
        for channel in channels {
            channel.close(reason);
        }
    }

    /// Closes the pool and every channel. In-flight requests fail with
    /// [`DriverError::ChannelClosed`].
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.close_channels("pool closed");
        tracing::debug!(node = %self.node, address = %self.address, "pool closed");
    }
}

impl Drop for ChannelPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{DriverConfig, ProtocolVersion};
    use crate::connection::reconnection::ConstantReconnectionPolicy;
    use crate::metadata::NodeInfo;

    fn pool_for(registry: &Arc<NodeRegistry>, distance: Distance) -> Arc<ChannelPool> {
        let address: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let node = registry.add_node(NodeInfo::new(address), distance);
        let config = DriverConfig::default();
        ChannelPool::new(
            node.id(),
            address,
            Arc::clone(registry),
            config.pool().clone(),
            ChannelConfig::from_config(&config, ProtocolVersion::V4),
            Arc::new(ConstantReconnectionPolicy::new(Duration::from_secs(3600))),
        )
    }

    #[test]
    fn test_target_size_follows_distance() {
        let registry = Arc::new(NodeRegistry::new());
        let pool = pool_for(&registry, Distance::Local);
        assert_eq!(pool.target_size(), 2);

        registry.set_distance(pool.node(), Distance::Remote);
        assert_eq!(pool.target_size(), 1);

        registry.set_distance(pool.node(), Distance::Ignored);
        assert_eq!(pool.target_size(), 0);
    }

    #[test]
    fn test_target_size_zero_when_forced_down_or_removed() {
        let registry = Arc::new(NodeRegistry::new());
        let pool = pool_for(&registry, Distance::Local);

        registry.force_down(pool.node());
        assert_eq!(pool.target_size(), 0);

        registry.force_up(pool.node());
        assert_eq!(pool.target_size(), 2);

        registry.remove_node(&pool.address());
        assert_eq!(pool.target_size(), 0);
    }

    #[test]
    fn test_pick_channel_on_empty_pool() {
        let registry = Arc::new(NodeRegistry::new());
        let pool = pool_for(&registry, Distance::Local);
        assert!(matches!(
            pool.pick_channel(),
            Err(DriverError::NodeUnavailable(addr)) if addr == pool.address()
        ));
        assert!(!pool.is_usable());
    }

    #[tokio::test]
    async fn test_ignored_node_opens_nothing() {
        let registry = Arc::new(NodeRegistry::new());
        let pool = pool_for(&registry, Distance::Ignored);
        assert_eq!(pool.ensure_size().await.unwrap(), 0);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_signalled_down() {
        let registry = Arc::new(NodeRegistry::new());
        let pool = pool_for(&registry, Distance::Local);

        assert!(pool.ensure_size().await.is_err());
        assert_eq!(registry.get(pool.node()).unwrap().state(), NodeState::Down);
        assert!(pool.is_reconnecting());

        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.ensure_size().await.unwrap(), 0);
    }
}
