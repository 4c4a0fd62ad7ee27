//! Cluster node types.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use cql_core::Token;
use uuid::Uuid;

/// Opaque identifier of a node inside the registry.
///
/// Pools and policies refer to nodes by id and resolve them through the
/// registry, so nothing outside the registry owns a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Health of a node as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Reachable and accepting requests.
    Up,
    /// Unreachable; reconnection is in progress.
    Down,
    /// Disabled by an administrative call; no traffic, no reconnection.
    ForcedDown,
    /// Discovered but not yet confirmed.
    Unknown,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
            Self::ForcedDown => write!(f, "FORCED_DOWN"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Proximity class of a node, deciding pooling and routing preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distance {
    /// Same datacenter; preferred and pooled generously.
    Local,
    /// Other datacenter; used after local nodes.
    Remote,
    /// Never connected to and never routed to.
    Ignored,
}

impl std::fmt::Display for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "LOCAL"),
            Self::Remote => write!(f, "REMOTE"),
            Self::Ignored => write!(f, "IGNORED"),
        }
    }
}

/// Descriptive information about a node, as reported by topology refreshes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Address the driver connects to.
    pub address: SocketAddr,
    /// Datacenter name, if known.
    pub datacenter: Option<String>,
    /// Rack name, if known.
    pub rack: Option<String>,
    /// Tokens owned by the node.
    pub tokens: Vec<Token>,
    /// Server-assigned host id, if known.
    pub host_id: Option<Uuid>,
}

impl NodeInfo {
    /// Creates node information carrying only an address.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            datacenter: None,
            rack: None,
            tokens: Vec::new(),
            host_id: None,
        }
    }

    /// Sets the datacenter.
    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    /// Sets the rack.
    pub fn with_rack(mut self, rack: impl Into<String>) -> Self {
        self.rack = Some(rack.into());
        self
    }

    /// Sets the owned tokens.
    pub fn with_tokens(mut self, tokens: impl IntoIterator<Item = Token>) -> Self {
        self.tokens = tokens.into_iter().collect();
        self
    }

    /// Sets the host id.
    pub fn with_host_id(mut self, host_id: Uuid) -> Self {
        self.host_id = Some(host_id);
        self
    }
}

/// An immutable view of one node at a point in time.
///
/// The registry replaces the whole value on every transition, so a
/// `Node` held by a query plan never changes under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    id: NodeId,
    info: NodeInfo,
    state: NodeState,
    distance: Distance,
}

impl Node {
    pub(crate) fn new(id: NodeId, info: NodeInfo, distance: Distance) -> Self {
        Self {
            id,
            info,
            state: NodeState::Unknown,
            distance,
        }
    }

    pub(crate) fn with_state(&self, state: NodeState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    pub(crate) fn with_distance(&self, distance: Distance) -> Self {
        Self {
            distance,
            ..self.clone()
        }
    }

    pub(crate) fn with_info(&self, info: NodeInfo) -> Self {
        Self {
            info,
            ..self.clone()
        }
    }

    /// Returns the registry id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the address the driver connects to.
    pub fn address(&self) -> SocketAddr {
        self.info.address
    }

    /// Returns the datacenter, if known.
    pub fn datacenter(&self) -> Option<&str> {
        self.info.datacenter.as_deref()
    }

    /// Returns the rack, if known.
    pub fn rack(&self) -> Option<&str> {
        self.info.rack.as_deref()
    }

    /// Returns the owned tokens.
    pub fn tokens(&self) -> &[Token] {
        &self.info.tokens
    }

    /// Returns the server-assigned host id, if known.
    pub fn host_id(&self) -> Option<Uuid> {
        self.info.host_id
    }

    /// Returns the descriptive information.
    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    /// Returns the health state.
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Returns the distance.
    pub fn distance(&self) -> Distance {
        self.distance
    }

    /// Returns true if the node may appear in a query plan.
    pub fn is_routable(&self) -> bool {
        self.state == NodeState::Up && self.distance != Distance::Ignored
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.info.address, self.id)
    }
}
