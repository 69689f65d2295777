//! Cluster layer for griddle nodes: gossip membership, shard placement, and
//! the orchestrator that routes writes and fans searches out to peers.

pub mod assignment;
pub mod config;
pub mod membership;
pub mod network;
pub mod orchestrator;
pub mod peer;
pub mod types;

pub use assignment::{compute_assignments, AssignmentTable};
pub use config::NodeConfig;
pub use membership::{GossipTransport, HttpGossipTransport, Membership, MembershipConfig};
pub use network::{InMemoryNetwork, NodeNetwork};
pub use orchestrator::Orchestrator;
pub use peer::{HttpConnector, PeerClient, PeerConnector, ShardRpc};
pub use types::{
    ClusterEvent, ClusterEventKind, ClusterSnapshot, CreateIndexRequest, Node, NodeMetadata,
    NodeName, NodeState, Role,
};
