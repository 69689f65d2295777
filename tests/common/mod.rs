//! In-process cluster harness: several orchestrators joined through an
//! in-memory network, sharing one metastore storage and one shard
//! directory factory.

#![allow(dead_code)]

use griddle::directory::DirectoryFactory;
use griddle::mapping::{FieldType, IndexMapping};
use griddle::metastore::{MemStorage, Metastore};
use griddle::{Document, SearchRequest, SearchResponse};
use griddle_cluster::{
    CreateIndexRequest, InMemoryNetwork, NodeConfig, Orchestrator, Role,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const SEED: &str = "127.0.0.1:2000";
const POLL: Duration = Duration::from_millis(25);
const PATIENCE: Duration = Duration::from_secs(15);

pub const BOTH: &[Role] = &[Role::Indexer, Role::Searcher];

pub struct TestCluster {
    pub network: Arc<InMemoryNetwork>,
    pub storage: Arc<MemStorage>,
    pub factory: Arc<DirectoryFactory>,
    pub replication_factor: usize,
    pub nodes: Vec<Arc<Orchestrator>>,
}

impl TestCluster {
    /// `n` nodes holding both roles, converged on membership.
    pub async fn start(n: usize, replication_factor: usize) -> Self {
        let roles = vec![BOTH; n];
        Self::start_with_roles(&roles, replication_factor).await
    }

    pub async fn start_with_roles(roles: &[&[Role]], replication_factor: usize) -> Self {
        let mut cluster = TestCluster {
            network: InMemoryNetwork::new(),
            storage: MemStorage::shared("cluster"),
            factory: DirectoryFactory::new(),
            replication_factor,
            nodes: Vec::new(),
        };
        for node_roles in roles {
            cluster.add_node(node_roles).await;
        }
        cluster.wait_for_members(roles.len()).await;
        cluster
    }

    pub async fn add_node(&mut self, roles: &[Role]) -> Arc<Orchestrator> {
        let i = self.nodes.len() as u16;
        let config = NodeConfig {
            node_name: format!("node-{}", i),
            advertise_addr: "127.0.0.1".into(),
            rpc_port: 2000 + i,
            http_port: 8000 + i,
            roles: roles.iter().copied().collect(),
            seeds: if i == 0 { Vec::new() } else { vec![SEED.to_string()] },
            replication_factor: self.replication_factor,
            gossip_interval_ms: 20,
            suspect_timeout_ms: 300,
            dead_timeout_ms: 600,
            fanout_timeout_ms: 3_000,
            ..NodeConfig::default()
        };
        let metastore = Metastore::with_storage(self.storage.clone()).await.unwrap();
        let node = Orchestrator::new(
            config,
            metastore,
            Arc::clone(&self.factory),
            self.network.node_network(),
        )
        .unwrap();
        self.network.register(&node);
        node.start().await;
        eventually("node ready", || {
            let node = Arc::clone(&node);
            async move { node.is_ready() }
        })
        .await;
        self.nodes.push(Arc::clone(&node));
        node
    }

    pub fn node(&self, name: &str) -> Arc<Orchestrator> {
        self.nodes
            .iter()
            .find(|n| n.local_name() == name)
            .cloned()
            .unwrap_or_else(|| panic!("no node named {}", name))
    }

    pub fn addr(&self, name: &str) -> String {
        self.node(name).membership().local_metadata().rpc_addr()
    }

    /// Every running node sees exactly `n` live members.
    pub async fn wait_for_members(&self, n: usize) {
        let nodes = self.nodes.clone();
        eventually("membership convergence", || {
            let nodes = nodes.clone();
            async move {
                nodes
                    .iter()
                    .filter(|node| node.is_ready())
                    .all(|node| node.membership().members().len() == n)
            }
        })
        .await;
    }

    /// Crash a node: no leave announcement, no more traffic either way.
    pub async fn kill(&self, name: &str) {
        let node = self.node(name);
        node.halt().await;
        self.network.partition(&self.addr(name));
    }

    pub fn running(&self) -> Vec<Arc<Orchestrator>> {
        self.nodes.iter().filter(|n| n.is_ready()).cloned().collect()
    }

    /// Total open writers and readers for `index` across running nodes.
    pub async fn handle_counts(&self, index: &str) -> (usize, usize) {
        let mut writers = 0;
        let mut readers = 0;
        for node in self.running() {
            writers += node
                .writers()
                .list()
                .await
                .iter()
                .filter(|(i, _, _)| i == index)
                .count();
            readers += node
                .readers()
                .list()
                .await
                .iter()
                .filter(|(i, _, _)| i == index)
                .count();
        }
        (writers, readers)
    }

    /// Wait until every running node holds exactly the handles its own
    /// assignment table gives it for `index`, with every shard placed.
    pub async fn wait_for_placement(&self, index: &str, shards: usize) {
        let nodes = self.running();
        eventually("shard placement", || {
            let nodes = nodes.clone();
            let index = index.to_string();
            async move {
                for node in &nodes {
                    let table = node.assignments().await;
                    let name = node.local_name().to_string();
                    let placed = table.searchers.get(&index).map_or(0, |s| s.len());
                    if placed != shards {
                        return false;
                    }
                    let want_writers = table.writers_for(&name).len();
                    let want_readers = table.readers_for(&name).len();
                    let have_writers = node.writers().list().await.iter().filter(|(i, _, _)| *i == index).count();
                    let have_readers = node.readers().list().await.iter().filter(|(i, _, _)| *i == index).count();
                    if want_writers != have_writers || want_readers != have_readers {
                        return false;
                    }
                }
                true
            }
        })
        .await;
    }
}

/// Poll `check` until it holds, panicking after a generous deadline.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Search through `node` until the response reports `hits` matches.
pub async fn search_until(
    node: &Arc<Orchestrator>,
    request: SearchRequest,
    hits: u64,
) -> SearchResponse {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    let mut last = None;
    while tokio::time::Instant::now() < deadline {
        match node.search(request.clone()).await {
            Ok(resp) if resp.hits == hits => return resp,
            other => last = Some(other),
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("search never reached {} hits; last: {:?}", hits, last);
}

pub fn product_index(num_shards: usize) -> CreateIndexRequest {
    CreateIndexRequest {
        storage_uri: "mem://products".into(),
        mapping: IndexMapping::default()
            .with_field("title", FieldType::Text)
            .with_field("brand", FieldType::Keyword)
            .with_field("price", FieldType::Numeric),
        num_shards,
        ..Default::default()
    }
}

/// `n` products; even ids are "acme", odd ids "zed"; price equals the number.
pub fn products(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| {
            Document::new(
                format!("p{:03}", i),
                json!({
                    "title": format!("product number {}", i),
                    "brand": if i % 2 == 0 { "acme" } else { "zed" },
                    "price": i as f64,
                }),
            )
        })
        .collect()
}
