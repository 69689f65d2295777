use dashmap::DashMap;
use griddle_cluster::Orchestrator;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub mod cluster;
pub mod documents;
pub mod health;
pub mod indexes;
pub mod internal;
pub mod metrics;
pub mod search;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub usage: Arc<DashMap<String, IndexUsage>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Arc<Self> {
        Arc::new(AppState {
            orchestrator,
            usage: Arc::new(DashMap::new()),
            start_time: std::time::Instant::now(),
        })
    }

    /// Per-index counters, created on first use.
    pub fn usage_for(&self, index: &str) -> dashmap::mapref::one::Ref<'_, String, IndexUsage> {
        self.usage
            .entry(index.to_string())
            .or_default()
            .downgrade()
    }
}

/// Request counters reported on `/metrics`. Only public requests count;
/// forwarded shard-pinned calls would double count.
#[derive(Debug, Default)]
pub struct IndexUsage {
    pub search_count: AtomicU64,
    pub documents_indexed: AtomicU64,
    pub documents_deleted: AtomicU64,
}

pub use cluster::cluster;
pub use documents::{add_documents, delete_documents};
pub use health::{livez, readyz};
pub use indexes::{create_index, delete_index};
pub use metrics::metrics_handler;
pub use search::search;

#[cfg(test)]
pub(crate) mod test_support {
    use super::AppState;
    use griddle::directory::DirectoryFactory;
    use griddle::metastore::Metastore;
    use griddle_cluster::{InMemoryNetwork, NodeConfig, Orchestrator};
    use std::sync::Arc;
    use std::time::Duration;

    /// A started single-node cluster behind an [`AppState`].
    pub async fn ready_state(name: &str) -> Arc<AppState> {
        let network = InMemoryNetwork::new();
        let metastore = Metastore::open(&format!("mem://{}", name)).await.unwrap();
        let config = NodeConfig {
            node_name: name.to_string(),
            gossip_interval_ms: 20,
            ..NodeConfig::default()
        };
        let node = Orchestrator::new(config, metastore, DirectoryFactory::new(), network.node_network())
            .unwrap();
        network.register(&node);
        node.start().await;
        for _ in 0..250 {
            if node.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        AppState::new(node)
    }

    pub async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }
}
