//! Load balancing: node distances and per-request query plans.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cql_core::Token;
use parking_lot::RwLock;

use crate::metadata::{ClusterSnapshot, Distance, Node, NodeInfo};

/// Replica count used by token-aware routing when none is configured.
const DEFAULT_REPLICAS: usize = 3;

/// The ordered candidates of one request.
///
/// A plan is computed once from a registry snapshot and never changes
/// afterwards, even if the registry does.
#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
    nodes: std::collections::VecDeque<Arc<Node>>,
}

impl QueryPlan {
    /// Creates a plan visiting `nodes` in order.
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        Self {
            nodes: nodes.into(),
        }
    }

    /// Creates a plan with no candidates.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the number of candidates not yet consumed.
    pub fn remaining(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if every candidate was consumed.
    pub fn is_exhausted(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Iterator for QueryPlan {
    type Item = Arc<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        self.nodes.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.nodes.len(), Some(self.nodes.len()))
    }
}

impl ExactSizeIterator for QueryPlan {}

/// Decides node distances and orders nodes for each request.
pub trait LoadBalancingPolicy: Send + Sync {
    /// Called once at session start with the local datacenter.
    fn init(&self, local_datacenter: Option<&str>);

    /// Returns the distance of a node, used at discovery and on refresh.
    fn distance(&self, node: &NodeInfo) -> Distance;

    /// Returns the candidates for one request.
    ///
    /// Only `UP` nodes that are not `IGNORED` may appear in the plan.
    fn new_query_plan(&self, token: Option<Token>, snapshot: &ClusterSnapshot) -> QueryPlan;
}

impl std::fmt::Debug for dyn LoadBalancingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LoadBalancingPolicy")
    }
}

/// Datacenter-aware, token-aware round-robin.
///
/// Replicas owning the request's token come first, local before remote.
/// The remaining local nodes follow in rotating order, then remote nodes.
#[derive(Debug)]
pub struct DefaultLoadBalancingPolicy {
    local_datacenter: RwLock<Option<String>>,
    replicas: usize,
    index: AtomicUsize,
}

impl Default for DefaultLoadBalancingPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

impl DefaultLoadBalancingPolicy {
    /// Creates a policy preferring up to `replicas` replicas per token.
    pub fn new(replicas: usize) -> Self {
        Self {
            local_datacenter: RwLock::new(None),
            replicas,
            index: AtomicUsize::new(0),
        }
    }

    /// Returns the local datacenter set by [`init`](LoadBalancingPolicy::init).
    pub fn local_datacenter(&self) -> Option<String> {
        self.local_datacenter.read().clone()
    }
}

fn rotate(mut nodes: Vec<Arc<Node>>, start: usize) -> Vec<Arc<Node>> {
    if !nodes.is_empty() {
        let len = nodes.len();
        nodes.rotate_left(start % len);
    }
    nodes
}

impl LoadBalancingPolicy for DefaultLoadBalancingPolicy {
    fn init(&self, local_datacenter: Option<&str>) {
        tracing::debug!(local_datacenter, "load balancing initialized");
        *self.local_datacenter.write() = local_datacenter.map(str::to_string);
    }

    fn distance(&self, node: &NodeInfo) -> Distance {
        let local = self.local_datacenter.read();
        match (local.as_deref(), node.datacenter.as_deref()) {
            (None, _) => Distance::Local,
            (Some(_), None) => Distance::Remote,
            (Some(local), Some(dc)) if local == dc => Distance::Local,
            (Some(_), Some(_)) => Distance::Remote,
        }
    }

    fn new_query_plan(&self, token: Option<Token>, snapshot: &ClusterSnapshot) -> QueryPlan {
        let candidates: Vec<Arc<Node>> = snapshot
            .nodes()
            .into_iter()
            .filter(|n| n.is_routable())
            .collect();
        if candidates.is_empty() {
            return QueryPlan::empty();
        }

        let mut plan = Vec::with_capacity(candidates.len());

        if let Some(token) = token {
            let replicas: Vec<Arc<Node>> = snapshot
                .token_map()
                .replicas(token, self.replicas)
                .into_iter()
                .filter_map(|id| snapshot.get(id))
                .filter(|n| n.is_routable())
                .cloned()
                .collect();
            let (local, remote): (Vec<_>, Vec<_>) = replicas
                .into_iter()
                .partition(|n| n.distance() == Distance::Local);
            plan.extend(local);
            plan.extend(remote);
        }

        let start = self.index.fetch_add(1, Ordering::Relaxed);
        let (local, remote): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .filter(|n| !plan.iter().any(|p: &Arc<Node>| p.id() == n.id()))
            .partition(|n| n.distance() == Distance::Local);
        plan.extend(rotate(local, start));
        plan.extend(rotate(remote, start));

        QueryPlan::new(plan)
    }
}
