//! Shard → node placement as a pure function of membership and metadata.

use crate::types::{Node, NodeName, Role};
use griddle::metastore::IndexMetadata;
use griddle::ring::RendezvousRing;
use griddle::{IndexName, ShardName};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Who writes and who serves reads for every known shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentTable {
    pub indexers: BTreeMap<IndexName, BTreeMap<ShardName, NodeName>>,
    pub searchers: BTreeMap<IndexName, BTreeMap<ShardName, Vec<NodeName>>>,
}

impl AssignmentTable {
    pub fn indexer(&self, index: &str, shard: &str) -> Option<&str> {
        self.indexers
            .get(index)
            .and_then(|shards| shards.get(shard))
            .map(String::as_str)
    }

    pub fn searchers(&self, index: &str, shard: &str) -> &[NodeName] {
        self.searchers
            .get(index)
            .and_then(|shards| shards.get(shard))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// (index, shard) pairs `node` should hold a writer for.
    pub fn writers_for(&self, node: &str) -> Vec<(IndexName, ShardName)> {
        self.indexers
            .iter()
            .flat_map(|(index, shards)| {
                shards
                    .iter()
                    .filter(|(_, owner)| owner.as_str() == node)
                    .map(move |(shard, _)| (index.clone(), shard.clone()))
            })
            .collect()
    }

    /// (index, shard) pairs `node` should hold a reader for.
    pub fn readers_for(&self, node: &str) -> Vec<(IndexName, ShardName)> {
        self.searchers
            .iter()
            .flat_map(|(index, shards)| {
                shards
                    .iter()
                    .filter(|(_, replicas)| replicas.iter().any(|r| r == node))
                    .map(move |(shard, _)| (index.clone(), shard.clone()))
            })
            .collect()
    }
}

/// One ring per role over the live members holding that role.
pub fn role_ring(members: &[Node], role: Role) -> RendezvousRing {
    let mut ring = RendezvousRing::new();
    for node in members {
        if node.state.is_live() && node.metadata.has_role(role) {
            ring.add(node.name.clone(), 1.0);
        }
    }
    ring
}

/// Place every shard: one indexer from the indexer ring and the top
/// `replication_factor` searchers from the searcher ring. Shards with no
/// eligible node are left out of the respective table.
pub fn compute_assignments(
    members: &[Node],
    indexes: &BTreeMap<IndexName, Arc<IndexMetadata>>,
    replication_factor: usize,
) -> AssignmentTable {
    let indexer_ring = role_ring(members, Role::Indexer);
    let searcher_ring = role_ring(members, Role::Searcher);
    let mut table = AssignmentTable::default();

    for (index, meta) in indexes {
        for shard in meta.shards.keys() {
            if let Some(node) = indexer_ring.lookup(shard) {
                table
                    .indexers
                    .entry(index.clone())
                    .or_default()
                    .insert(shard.clone(), node);
            }
            let replicas = searcher_ring.lookup_top_n(shard, replication_factor);
            if !replicas.is_empty() {
                table
                    .searchers
                    .entry(index.clone())
                    .or_default()
                    .insert(shard.clone(), replicas);
            }
        }
    }
    table
}
