use griddle::mapping::IndexMapping;
use griddle::{Document, IndexName, ShardName};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub type NodeName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Indexer,
    Searcher,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Indexer => f.write_str("indexer"),
            Role::Searcher => f.write_str("searcher"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "indexer" => Ok(Role::Indexer),
            "searcher" => Ok(Role::Searcher),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// What a node advertises about itself through gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub advertise_addr: String,
    pub rpc_port: u16,
    pub http_port: u16,
    pub roles: BTreeSet<Role>,
}

impl NodeMetadata {
    /// `host:port` of the internal RPC listener (gossip and forwarding).
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.advertise_addr, self.rpc_port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.advertise_addr, self.http_port)
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl NodeState {
    /// Alive and Suspect nodes still take part in placement.
    pub fn is_live(self) -> bool {
        matches!(self, NodeState::Alive | NodeState::Suspect)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: NodeName,
    pub metadata: NodeMetadata,
    pub state: NodeState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterEventKind {
    Join,
    Leave,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub kind: ClusterEventKind,
    pub node_name: NodeName,
    pub metadata: NodeMetadata,
    pub state: NodeState,
    /// Names of every live member after this event was applied.
    pub members: Vec<NodeName>,
}

/// One member's entry in a gossip exchange. `(generation, heartbeat)`
/// orders freshness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigest {
    pub name: NodeName,
    pub metadata: NodeMetadata,
    pub generation: i64,
    pub heartbeat: u64,
    pub state: NodeState,
}

impl GossipDigest {
    pub fn version(&self) -> (i64, u64) {
        (self.generation, self.heartbeat)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub from: NodeName,
    pub members: Vec<GossipDigest>,
}

/// Body of `PUT /v1/indexes/{index}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateIndexRequest {
    pub storage_uri: String,
    #[serde(default)]
    pub lock_uri: String,
    #[serde(default)]
    pub mapping: IndexMapping,
    #[serde(default)]
    pub num_shards: usize,
    #[serde(default)]
    pub default_search_field: Option<String>,
}

/// Forwarded add batch. `shard_name` is always set on the wire so the
/// receiving node never re-routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddDocumentsRequest {
    pub shard_name: Option<ShardName>,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteDocumentsRequest {
    pub shard_name: Option<ShardName>,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub index_name: IndexName,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenHandle {
    pub index_name: IndexName,
    pub shard_name: ShardName,
    pub version: i64,
}

/// Everything `GET /v1/cluster` reports about this node's view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub local_node: NodeName,
    pub ready: bool,
    pub members: Vec<Node>,
    pub indexers: BTreeMap<IndexName, BTreeMap<ShardName, NodeName>>,
    pub searchers: BTreeMap<IndexName, BTreeMap<ShardName, Vec<NodeName>>>,
    pub writers: Vec<OpenHandle>,
    pub readers: Vec<OpenHandle>,
    pub peers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Indexer".parse::<Role>().unwrap(), Role::Indexer);
        assert_eq!(" searcher ".parse::<Role>().unwrap(), Role::Searcher);
        assert!("router".parse::<Role>().is_err());
    }

    #[test]
    fn metadata_addresses() {
        let meta = NodeMetadata {
            advertise_addr: "10.0.0.5".into(),
            rpc_port: 2000,
            http_port: 8000,
            roles: [Role::Searcher].into_iter().collect(),
        };
        assert_eq!(meta.rpc_addr(), "10.0.0.5:2000");
        assert_eq!(meta.http_addr(), "10.0.0.5:8000");
        assert!(meta.has_role(Role::Searcher));
        assert!(!meta.has_role(Role::Indexer));
    }

    #[test]
    fn create_request_defaults() {
        let req: CreateIndexRequest =
            serde_json::from_str(r#"{"storage_uri": "mem://products"}"#).unwrap();
        assert_eq!(req.num_shards, 0);
        assert!(req.lock_uri.is_empty());
        assert!(req.default_search_field.is_none());
    }

    #[test]
    fn node_state_liveness() {
        assert!(NodeState::Alive.is_live());
        assert!(NodeState::Suspect.is_live());
        assert!(!NodeState::Dead.is_live());
        assert!(!NodeState::Left.is_live());
    }
}
