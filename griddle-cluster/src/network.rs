//! How a node reaches its peers: HTTP in production, an in-process switch
//! board for tests that run many nodes in one runtime.

use crate::membership::{GossipTransport, HttpGossipTransport, Membership};
use crate::orchestrator::Orchestrator;
use crate::peer::{HttpConnector, PeerConnector, ShardRpc};
use crate::types::GossipMessage;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use griddle::{Document, GriddleError, Result, SearchRequest, SearchResponse};
use std::sync::{Arc, Weak};

/// Gossip transport and RPC connector a node is built with.
#[derive(Clone)]
pub struct NodeNetwork {
    pub gossip: Arc<dyn GossipTransport>,
    pub peers: Arc<dyn PeerConnector>,
}

impl NodeNetwork {
    pub fn http() -> Self {
        NodeNetwork {
            gossip: HttpGossipTransport::new(),
            peers: Arc::new(HttpConnector),
        }
    }
}

#[derive(Default)]
struct Switchboard {
    memberships: DashMap<String, Weak<Membership>>,
    nodes: DashMap<String, Weak<Orchestrator>>,
    partitioned: DashSet<String>,
    /// Shard-pinned write RPCs delivered, by target address.
    forwarded_writes: DashMap<String, u64>,
}

impl Switchboard {
    fn reachable(&self, addr: &str) -> Result<()> {
        if self.partitioned.contains(addr) {
            return Err(GriddleError::Rpc(format!("{} is unreachable", addr)));
        }
        Ok(())
    }

    fn node(&self, addr: &str) -> Result<Arc<Orchestrator>> {
        self.reachable(addr)?;
        self.nodes
            .get(addr)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| GriddleError::Rpc(format!("connection refused: {}", addr)))
    }

    fn deliver_write(&self, addr: &str) -> Result<Arc<Orchestrator>> {
        let node = self.node(addr)?;
        *self.forwarded_writes.entry(addr.to_string()).or_default() += 1;
        Ok(node)
    }
}

/// Routes gossip and shard RPCs between nodes of the same process by their
/// `host:rpc_port`. Addresses can be partitioned to simulate crashes.
#[derive(Default)]
pub struct InMemoryNetwork {
    inner: Arc<Switchboard>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_membership(&self, membership: &Arc<Membership>) {
        let addr = membership.local_metadata().rpc_addr();
        self.inner
            .memberships
            .insert(addr, Arc::downgrade(membership));
    }

    /// Make a node reachable for both gossip and shard RPCs.
    pub fn register(&self, node: &Arc<Orchestrator>) {
        self.register_membership(node.membership());
        let addr = node.membership().local_metadata().rpc_addr();
        self.inner.nodes.insert(addr, Arc::downgrade(node));
    }

    /// Drop all traffic to and from `addr`.
    pub fn partition(&self, addr: &str) {
        self.inner.partitioned.insert(addr.to_string());
    }

    pub fn heal(&self, addr: &str) {
        self.inner.partitioned.remove(addr);
    }

    /// Number of forwarded write batches `addr` has received.
    pub fn forwarded_writes(&self, addr: &str) -> u64 {
        self.inner
            .forwarded_writes
            .get(addr)
            .map_or(0, |count| *count)
    }

    pub fn node_network(self: &Arc<Self>) -> NodeNetwork {
        NodeNetwork {
            gossip: Arc::clone(self) as Arc<dyn GossipTransport>,
            peers: Arc::clone(self) as Arc<dyn PeerConnector>,
        }
    }
}

#[async_trait]
impl GossipTransport for InMemoryNetwork {
    async fn exchange(&self, addr: &str, message: GossipMessage) -> Result<GossipMessage> {
        self.inner.reachable(addr)?;
        let sender = message
            .members
            .iter()
            .find(|digest| digest.name == message.from)
            .map(|digest| digest.metadata.rpc_addr());
        if let Some(sender) = sender {
            self.inner.reachable(&sender)?;
        }
        let target = self
            .inner
            .memberships
            .get(addr)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| GriddleError::Rpc(format!("connection refused: {}", addr)))?;
        Ok(target.handle_gossip(message))
    }
}

impl PeerConnector for InMemoryNetwork {
    fn connect(&self, addr: &str) -> Arc<dyn ShardRpc> {
        Arc::new(LocalPeer {
            inner: Arc::clone(&self.inner),
            addr: addr.to_string(),
        })
    }
}

struct LocalPeer {
    inner: Arc<Switchboard>,
    addr: String,
}

#[async_trait]
impl ShardRpc for LocalPeer {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn add_documents(
        &self,
        index: &str,
        shard: &str,
        documents: Vec<Document>,
    ) -> Result<usize> {
        let node = self.inner.deliver_write(&self.addr)?;
        node.add_documents(index, Some(shard), documents).await
    }

    async fn delete_documents(&self, index: &str, shard: &str, ids: Vec<String>) -> Result<usize> {
        let node = self.inner.deliver_write(&self.addr)?;
        node.delete_documents(index, Some(shard), ids).await
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let node = self.inner.node(&self.addr)?;
        node.search(request.clone()).await
    }
}
