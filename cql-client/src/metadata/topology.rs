//! Topology refresh collaborator.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use cql_core::Result;
use parking_lot::RwLock;

use super::node::{Node, NodeInfo};

/// Source of node information for the session lifecycle.
///
/// Implementations usually query system tables over the control channel;
/// the execution core only consumes the results.
#[async_trait]
pub trait TopologyMonitor: Send + Sync {
    /// Returns information about every node of the cluster.
    async fn refresh_node_list(&self) -> Result<Vec<NodeInfo>>;

    /// Returns fresh information about a known node, or `None` if the node
    /// is no longer part of the cluster.
    async fn refresh_node(&self, node: &Node) -> Result<Option<NodeInfo>>;

    /// Looks up a node announced by a push event.
    async fn get_new_node_info(&self, address: SocketAddr) -> Result<Option<NodeInfo>>;

    /// Returns true once every node reports the same schema version.
    async fn check_schema_agreement(&self) -> Result<bool>;
}

impl std::fmt::Debug for dyn TopologyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TopologyMonitor")
    }
}

/// A topology monitor backed by a fixed, updatable list of nodes.
///
/// Nodes announced by push events but missing from the list are reported
/// with their address only.
#[derive(Debug, Default)]
pub struct StaticTopologyMonitor {
    nodes: RwLock<BTreeMap<SocketAddr, NodeInfo>>,
    accept_unknown: bool,
}

impl StaticTopologyMonitor {
    /// Creates a monitor from a list of node descriptions.
    pub fn new(nodes: impl IntoIterator<Item = NodeInfo>) -> Self {
        Self {
            nodes: RwLock::new(nodes.into_iter().map(|n| (n.address, n)).collect()),
            accept_unknown: true,
        }
    }

    /// Creates a monitor knowing only addresses, all in the given datacenter.
    pub fn from_addresses(addresses: &[SocketAddr], datacenter: Option<&str>) -> Self {
        Self::new(addresses.iter().map(|address| {
            let info = NodeInfo::new(*address);
            match datacenter {
                Some(dc) => info.with_datacenter(dc),
                None => info,
            }
        }))
    }

    /// Controls whether nodes missing from the list are accepted when a push
    /// event announces them.
    pub fn accept_unknown_nodes(mut self, accept: bool) -> Self {
        self.accept_unknown = accept;
        self
    }

    /// Adds or replaces a node description.
    pub fn upsert(&self, info: NodeInfo) {
        self.nodes.write().insert(info.address, info);
    }

    /// Removes a node description.
    pub fn remove(&self, address: &SocketAddr) -> Option<NodeInfo> {
        self.nodes.write().remove(address)
    }
}

#[async_trait]
impl TopologyMonitor for StaticTopologyMonitor {
    async fn refresh_node_list(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.nodes.read().values().cloned().collect())
    }

    async fn refresh_node(&self, node: &Node) -> Result<Option<NodeInfo>> {
        Ok(self.nodes.read().get(&node.address()).cloned())
    }

    async fn get_new_node_info(&self, address: SocketAddr) -> Result<Option<NodeInfo>> {
        if let Some(info) = self.nodes.read().get(&address) {
            return Ok(Some(info.clone()));
        }
        Ok(self.accept_unknown.then(|| NodeInfo::new(address)))
    }

    async fn check_schema_agreement(&self) -> Result<bool> {
        Ok(true)
    }
}
