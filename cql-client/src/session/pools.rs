//! Keeps one channel pool per known node and resizes pools as the registry
//! changes.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::connection::{ChannelConfig, ChannelPool, ReconnectionPolicy};
use crate::metadata::{Node, NodeEvent, NodeRegistry, NodeState};
use crate::request::PoolMap;

pub(crate) struct PoolManager {
    registry: Arc<NodeRegistry>,
    pools: PoolMap,
    config: PoolConfig,
    channel_config: ChannelConfig,
    reconnection: Arc<dyn ReconnectionPolicy>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("pools", &self.pools.read().len())
            .finish()
    }
}

impl PoolManager {
    pub(crate) fn new(
        registry: Arc<NodeRegistry>,
        pools: PoolMap,
        config: PoolConfig,
        channel_config: ChannelConfig,
        reconnection: Arc<dyn ReconnectionPolicy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pools,
            config,
            channel_config,
            reconnection,
        })
    }

    fn pool_for(&self, node: &Node) -> Arc<ChannelPool> {
        let mut pools = self.pools.write();
        Arc::clone(pools.entry(node.id()).or_insert_with(|| {
            ChannelPool::new(
                node.id(),
                node.address(),
                Arc::clone(&self.registry),
                self.config.clone(),
                self.channel_config.clone(),
                Arc::clone(&self.reconnection),
            )
        }))
    }

    /// Creates a pool for every known node and waits until each reached its
    /// target size or failed.
    pub(crate) async fn init(&self) -> usize {
        let pools: Vec<_> = self
            .registry
            .snapshot()
            .nodes()
            .iter()
            .map(|node| self.pool_for(node))
            .collect();
        let results = join_all(pools.iter().map(|pool| pool.ensure_size())).await;
        let mut usable = 0;
        for (pool, result) in pools.iter().zip(results) {
            match result {
                Ok(size) if size > 0 => usable += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(address = %pool.address(), error = %e, "initial pool failed"),
            }
        }
        usable
    }

    /// Reacts to registry transitions until `shutdown` fires.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<NodeEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => manager.on_event(event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "missed node events, resynchronizing pools");
                            manager.resync();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            manager.close_all();
        })
    }

    fn on_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::Added(node) => resize(self.pool_for(&node)),
            NodeEvent::Removed(node) => {
                if let Some(pool) = self.pools.write().remove(&node.id()) {
                    pool.close();
                }
            }
            NodeEvent::StateChanged { node, new, .. } => {
                let Some(pool) = self.pools.read().get(&node.id()).cloned() else {
                    return;
                };
                match new {
                    NodeState::Down => pool.on_node_down(),
                    NodeState::Up | NodeState::Unknown | NodeState::ForcedDown => resize(pool),
                }
            }
            NodeEvent::DistanceChanged { node, .. } => {
                if let Some(pool) = self.pools.read().get(&node.id()).cloned() {
                    resize(pool);
                }
            }
        }
    }

    fn resync(&self) {
        let snapshot = self.registry.snapshot();
        let stale: Vec<_> = {
            let mut pools = self.pools.write();
            let ids: Vec<_> = pools
                .keys()
                .copied()
                .filter(|id| snapshot.get(*id).is_none())
                .collect();
            ids.into_iter().filter_map(|id| pools.remove(&id)).collect()
        };
        for pool in stale {
            pool.close();
        }
        for node in snapshot.nodes() {
            resize(self.pool_for(&node));
        }
    }

    /// Closes every pool.
    pub(crate) fn close_all(&self) {
        let pools: Vec<_> = self.pools.write().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close();
        }
    }
}

fn resize(pool: Arc<ChannelPool>) {
    tokio::spawn(async move {
        if let Err(e) = pool.ensure_size().await {
            tracing::debug!(address = %pool.address(), error = %e, "pool resize failed");
        }
    });
}
