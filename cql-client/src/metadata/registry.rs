//! Node registry and health state machine.
//!
//! The registry is the single source of truth for node state. Readers take
//! cheap copy-on-write snapshots and never wait on writers for longer than
//! an `Arc` clone. Every transition is published on a broadcast channel in
//! the order it was applied.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::node::{Distance, Node, NodeId, NodeInfo, NodeState};
use super::token_map::TokenMap;

/// Capacity of the node event channel.
const NODE_EVENT_CAPACITY: usize = 256;

/// A change applied to the registry.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A node was discovered.
    Added(Arc<Node>),
    /// A node was removed or forgotten.
    Removed(Arc<Node>),
    /// A node changed health state.
    StateChanged {
        /// The node after the transition.
        node: Arc<Node>,
        /// State before the transition.
        old: NodeState,
        /// State after the transition.
        new: NodeState,
    },
    /// A node changed distance.
    DistanceChanged {
        /// The node after the change.
        node: Arc<Node>,
        /// Distance before the change.
        old: Distance,
        /// Distance after the change.
        new: Distance,
    },
}

impl NodeEvent {
    /// Returns the node the event is about.
    pub fn node(&self) -> &Arc<Node> {
        match self {
            Self::Added(node) | Self::Removed(node) => node,
            Self::StateChanged { node, .. } | Self::DistanceChanged { node, .. } => node,
        }
    }
}

/// A frozen view of every known node and the token ring.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    nodes: HashMap<NodeId, Arc<Node>>,
    by_address: HashMap<SocketAddr, NodeId>,
    token_map: TokenMap,
}

impl ClusterSnapshot {
    /// Returns a node by id.
    pub fn get(&self, id: NodeId) -> Option<&Arc<Node>> {
        self.nodes.get(&id)
    }

    /// Returns a node by connect address.
    pub fn by_address(&self, address: &SocketAddr) -> Option<&Arc<Node>> {
        self.by_address.get(address).and_then(|id| self.nodes.get(id))
    }

    /// Returns every node, ordered by id.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<_> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id());
        nodes
    }

    /// Returns the token ring.
    pub fn token_map(&self) -> &TokenMap {
        &self.token_map
    }

    /// Returns the number of known nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no node is known.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn rebuild_token_map(&mut self) {
        self.token_map = TokenMap::build(self.nodes.values().map(|n| (n.id(), n.tokens())));
    }
}

/// Holds the set of known nodes and applies state transitions.
#[derive(Debug)]
pub struct NodeRegistry {
    snapshot: RwLock<Arc<ClusterSnapshot>>,
    events: broadcast::Sender<NodeEvent>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(NODE_EVENT_CAPACITY);
        Self {
            snapshot: RwLock::new(Arc::new(ClusterSnapshot::default())),
            events,
        }
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Subscribes to registry transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Returns a node by id.
    pub fn get(&self, id: NodeId) -> Option<Arc<Node>> {
        self.snapshot.read().get(id).cloned()
    }

    /// Returns a node by connect address.
    pub fn by_address(&self, address: &SocketAddr) -> Option<Arc<Node>> {
        self.snapshot.read().by_address(address).cloned()
    }

    /// Applies `f` to a private copy of the snapshot and publishes the
    /// result. Events are sent while the write lock is held so subscribers
    /// observe them in application order.
    fn update<R>(&self, f: impl FnOnce(&mut ClusterSnapshot) -> (R, Option<NodeEvent>)) -> R {
        let mut guard = self.snapshot.write();
        let mut next = ClusterSnapshot::clone(&guard);
        let (result, event) = f(&mut next);
        if let Some(event) = event {
            *guard = Arc::new(next);
            tracing::debug!(event = ?event_name(&event), node = %event.node(), "registry transition");
            let _ = self.events.send(event);
        }
        result
    }

    /// Adds a node in the `UNKNOWN` state.
    ///
    /// A node already registered under the same address is returned as is.
    pub fn add_node(&self, info: NodeInfo, distance: Distance) -> Arc<Node> {
        self.update(|snapshot| {
            if let Some(existing) = snapshot.by_address(&info.address) {
                return (Arc::clone(existing), None);
            }
            let node = Arc::new(Node::new(NodeId::next(), info, distance));
            snapshot.by_address.insert(node.address(), node.id());
            snapshot.nodes.insert(node.id(), Arc::clone(&node));
            if !node.tokens().is_empty() {
                snapshot.rebuild_token_map();
            }
            (Arc::clone(&node), Some(NodeEvent::Added(node)))
        })
    }

    /// Replaces the descriptive information of a known node.
    ///
    /// Returns `false` if no node has that address or nothing changed.
    pub fn refresh_node(&self, info: NodeInfo) -> bool {
        let mut guard = self.snapshot.write();
        let Some(current) = guard.by_address(&info.address).cloned() else {
            return false;
        };
        if current.info() == &info {
            return false;
        }
        let mut next = ClusterSnapshot::clone(&guard);
        let tokens_changed = current.tokens() != info.tokens.as_slice();
        next.nodes.insert(current.id(), Arc::new(current.with_info(info)));
        if tokens_changed {
            next.rebuild_token_map();
        }
        *guard = Arc::new(next);
        tracing::debug!(node = %current, "refreshed node information");
        true
    }

    /// Removes a node.
    pub fn remove_node(&self, address: &SocketAddr) -> Option<Arc<Node>> {
        self.update(|snapshot| {
            let Some(id) = snapshot.by_address.remove(address) else {
                return (None, None);
            };
            let node = snapshot.nodes.remove(&id);
            if node.as_ref().map_or(false, |n| !n.tokens().is_empty()) {
                snapshot.rebuild_token_map();
            }
            let event = node.clone().map(NodeEvent::Removed);
            (node, event)
        })
    }

    /// Changes a node's distance.
    pub fn set_distance(&self, id: NodeId, distance: Distance) -> bool {
        self.update(|snapshot| {
            let Some(current) = snapshot.nodes.get(&id).cloned() else {
                return (false, None);
            };
            if current.distance() == distance {
                return (false, None);
            }
            let node = Arc::new(current.with_distance(distance));
            snapshot.nodes.insert(id, Arc::clone(&node));
            (
                true,
                Some(NodeEvent::DistanceChanged {
                    node,
                    old: current.distance(),
                    new: distance,
                }),
            )
        })
    }

    fn transition(&self, id: NodeId, allowed: impl FnOnce(NodeState) -> Option<NodeState>) -> bool {
        self.update(|snapshot| {
            let Some(current) = snapshot.nodes.get(&id).cloned() else {
                return (false, None);
            };
            let old = current.state();
            let Some(new) = allowed(old) else {
                return (false, None);
            };
            if new == old {
                return (false, None);
            }
            let node = Arc::new(current.with_state(new));
            snapshot.nodes.insert(id, Arc::clone(&node));
            (true, Some(NodeEvent::StateChanged { node, old, new }))
        })
    }

    /// Marks a node `UP` after a confirmed connection or an up event.
    ///
    /// Has no effect on a `FORCED_DOWN` node.
    pub fn signal_up(&self, id: NodeId) -> bool {
        self.transition(id, |state| match state {
            NodeState::Unknown | NodeState::Down => Some(NodeState::Up),
            _ => None,
        })
    }

    /// Marks a node `DOWN` after all its channels failed or a down event.
    ///
    /// Has no effect on a `FORCED_DOWN` node.
    pub fn signal_down(&self, id: NodeId) -> bool {
        self.transition(id, |state| match state {
            NodeState::Up | NodeState::Unknown => Some(NodeState::Down),
            _ => None,
        })
    }

    /// Administratively disables a node.
    pub fn force_down(&self, id: NodeId) -> bool {
        self.transition(id, |_| Some(NodeState::ForcedDown))
    }

    /// Lifts a previous [`force_down`](Self::force_down); the node returns to
    /// `UNKNOWN` until a channel opens.
    pub fn force_up(&self, id: NodeId) -> bool {
        self.transition(id, |state| match state {
            NodeState::ForcedDown => Some(NodeState::Unknown),
            _ => None,
        })
    }

    /// Forgets every node.
    pub fn clear(&self) {
        let nodes = self.snapshot().nodes();
        for node in nodes {
            self.remove_node(&node.address());
        }
    }
}

fn event_name(event: &NodeEvent) -> String {
    match event {
        NodeEvent::Added(_) => "added".to_string(),
        NodeEvent::Removed(_) => "removed".to_string(),
        NodeEvent::StateChanged { old, new, .. } => format!("{} -> {}", old, new),
        NodeEvent::DistanceChanged { old, new, .. } => format!("{} -> {}", old, new),
    }
}

#[cfg(test)]
mod tests {
    use cql_core::Token;

    use super::*;

    fn info(port: u16) -> NodeInfo {
        NodeInfo::new(SocketAddr::from(([127, 0, 0, 1], port))).with_datacenter("dc1")
    }

    #[test]
    fn test_add_node_starts_unknown_and_emits_event() {
        let registry = NodeRegistry::new();
        let mut events = registry.subscribe();

        let node = registry.add_node(info(1), Distance::Local);

        assert_eq!(node.state(), NodeState::Unknown);
        assert!(matches!(events.try_recv(), Ok(NodeEvent::Added(n)) if n.id() == node.id()));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_add_same_address_twice_returns_existing() {
        let registry = NodeRegistry::new();
        let first = registry.add_node(info(1), Distance::Local);
        let second = registry.add_node(info(1), Distance::Remote);
        assert_eq!(first.id(), second.id());
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_up_down_transitions() {
        let registry = NodeRegistry::new();
        let id = registry.add_node(info(1), Distance::Local).id();

        assert!(registry.signal_up(id));
        assert_eq!(registry.get(id).unwrap().state(), NodeState::Up);
        assert!(!registry.signal_up(id));

        assert!(registry.signal_down(id));
        assert_eq!(registry.get(id).unwrap().state(), NodeState::Down);

        assert!(registry.signal_up(id));
        assert_eq!(registry.get(id).unwrap().state(), NodeState::Up);
    }

    #[test]
    fn test_forced_down_ignores_automatic_transitions() {
        let registry = NodeRegistry::new();
        let id = registry.add_node(info(1), Distance::Local).id();
        registry.signal_up(id);

        assert!(registry.force_down(id));
        assert!(!registry.signal_up(id));
        assert!(!registry.signal_down(id));
        assert_eq!(registry.get(id).unwrap().state(), NodeState::ForcedDown);

        assert!(registry.force_up(id));
        assert_eq!(registry.get(id).unwrap().state(), NodeState::Unknown);
        assert!(registry.signal_up(id));
    }

    #[test]
    fn test_force_up_only_leaves_forced_down() {
        let registry = NodeRegistry::new();
        let id = registry.add_node(info(1), Distance::Local).id();
        registry.signal_up(id);
        assert!(!registry.force_up(id));
        assert_eq!(registry.get(id).unwrap().state(), NodeState::Up);
    }

    #[test]
    fn test_transitions_are_published_in_order() {
        let registry = NodeRegistry::new();
        let id = registry.add_node(info(1), Distance::Local).id();
        let mut events = registry.subscribe();

        registry.signal_up(id);
        registry.signal_down(id);
        registry.force_down(id);

        let mut seen = Vec::new();
        while let Ok(NodeEvent::StateChanged { old, new, .. }) = events.try_recv() {
            seen.push((old, new));
        }
        assert_eq!(
            seen,
            vec![
                (NodeState::Unknown, NodeState::Up),
                (NodeState::Up, NodeState::Down),
                (NodeState::Down, NodeState::ForcedDown),
            ]
        );
    }

    #[test]
    fn test_snapshot_is_not_affected_by_later_changes() {
        let registry = NodeRegistry::new();
        let id = registry.add_node(info(1), Distance::Local).id();
        registry.signal_up(id);

        let before = registry.snapshot();
        registry.set_distance(id, Distance::Ignored);

        assert_eq!(before.get(id).unwrap().distance(), Distance::Local);
        assert_eq!(registry.get(id).unwrap().distance(), Distance::Ignored);
    }

    #[test]
    fn test_set_distance_emits_once() {
        let registry = NodeRegistry::new();
        let id = registry.add_node(info(1), Distance::Local).id();
        let mut events = registry.subscribe();

        assert!(registry.set_distance(id, Distance::Remote));
        assert!(!registry.set_distance(id, Distance::Remote));

        assert!(matches!(
            events.try_recv(),
            Ok(NodeEvent::DistanceChanged {
                old: Distance::Local,
                new: Distance::Remote,
                ..
            })
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_token_map_follows_membership() {
        let registry = NodeRegistry::new();
        let a = registry.add_node(info(1).with_tokens([Token(99)]), Distance::Local);
        let b = registry.add_node(info(2).with_tokens([Token(199)]), Distance::Local);

        assert_eq!(registry.snapshot().token_map().owner(Token(50)), Some(a.id()));

        registry.remove_node(&a.address());
        assert_eq!(registry.snapshot().token_map().owner(Token(50)), Some(b.id()));
    }

    #[test]
    fn test_refresh_node_updates_tokens() {
        let registry = NodeRegistry::new();
        let a = registry.add_node(info(1).with_tokens([Token(99)]), Distance::Local);
        let b = registry.add_node(info(2).with_tokens([Token(199)]), Distance::Local);

        assert!(registry.refresh_node(info(2).with_tokens([Token(10)])));
        assert!(!registry.refresh_node(info(2).with_tokens([Token(10)])));
        assert!(!registry.refresh_node(info(3)));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.token_map().owner(Token(5)), Some(b.id()));
        assert_eq!(snapshot.token_map().owner(Token(50)), Some(a.id()));
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = NodeRegistry::new();
        registry.add_node(info(1), Distance::Local);
        registry.add_node(info(2), Distance::Local);

        assert!(registry.remove_node(&info(1).address).is_some());
        assert!(registry.remove_node(&info(1).address).is_none());

        registry.clear();
        assert!(registry.snapshot().is_empty());
    }
}
