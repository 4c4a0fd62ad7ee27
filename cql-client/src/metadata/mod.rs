//! Cluster metadata: nodes, their health and the token ring.

mod node;
mod registry;
mod token_map;
mod topology;

pub use node::{Distance, Node, NodeId, NodeInfo, NodeState};
pub use registry::{ClusterSnapshot, NodeEvent, NodeRegistry};
pub use token_map::TokenMap;
pub use topology::{StaticTopologyMonitor, TopologyMonitor};
