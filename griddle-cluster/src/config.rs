use crate::types::{NodeMetadata, Role};
use griddle::{GriddleError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_RPC_PORT: u16 = 2000;
pub const DEFAULT_HTTP_PORT: u16 = 8000;
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_name: String,
    pub bind_addr: String,
    pub advertise_addr: String,
    pub rpc_port: u16,
    pub http_port: u16,
    pub roles: BTreeSet<Role>,
    /// `host:rpc_port` of nodes to contact on join.
    pub seeds: Vec<String>,
    pub metastore_uri: String,
    pub replication_factor: usize,
    pub gossip_interval_ms: u64,
    pub suspect_timeout_ms: u64,
    pub dead_timeout_ms: u64,
    pub fanout_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_name: local_hostname(),
            bind_addr: "0.0.0.0".to_string(),
            advertise_addr: "127.0.0.1".to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            http_port: DEFAULT_HTTP_PORT,
            roles: [Role::Indexer, Role::Searcher].into_iter().collect(),
            seeds: Vec::new(),
            metastore_uri: String::new(),
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            gossip_interval_ms: 500,
            suspect_timeout_ms: 5_000,
            dead_timeout_ms: 15_000,
            fanout_timeout_ms: 3_000,
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

impl NodeConfig {
    /// Load node configuration from `{data_dir}/node.json`, falling back to
    /// `GRIDDLE_*` environment variables over the defaults.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let node_json = data_dir.join("node.json");

        if node_json.exists() {
            match std::fs::read_to_string(&node_json) {
                Ok(content) => match serde_json::from_str::<NodeConfig>(&content) {
                    Ok(mut config) => {
                        config.fill_metastore_default(data_dir);
                        tracing::info!(
                            "Loaded node config: node_name={}, roles={:?}, seeds={}",
                            config.node_name,
                            config.roles,
                            config.seeds.len()
                        );
                        return config;
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse node.json: {}, using environment", e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read node.json: {}, using environment", e);
                }
            }
        }

        let config = Self::from_env(data_dir);
        tracing::info!(
            "No usable node.json, configured from environment: node_name={}, seeds={}",
            config.node_name,
            config.seeds.len()
        );
        config
    }

    pub fn from_env(data_dir: &Path) -> Self {
        let mut config = NodeConfig::default();

        if let Ok(name) = std::env::var("GRIDDLE_NODE_NAME") {
            if !name.trim().is_empty() {
                config.node_name = name.trim().to_string();
            }
        }
        if let Ok(addr) = std::env::var("GRIDDLE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(addr) = std::env::var("GRIDDLE_ADVERTISE_ADDR") {
            config.advertise_addr = addr;
        }
        if let Some(port) = env_parse("GRIDDLE_RPC_PORT") {
            config.rpc_port = port;
        }
        if let Some(port) = env_parse("GRIDDLE_HTTP_PORT") {
            config.http_port = port;
        }
        if let Ok(roles) = std::env::var("GRIDDLE_ROLES") {
            let parsed: BTreeSet<Role> = split_list(&roles)
                .filter_map(|r| match r.parse() {
                    Ok(role) => Some(role),
                    Err(e) => {
                        tracing::warn!("GRIDDLE_ROLES: {}", e);
                        None
                    }
                })
                .collect();
            if !parsed.is_empty() {
                config.roles = parsed;
            }
        }
        if let Ok(seeds) = std::env::var("GRIDDLE_SEEDS") {
            config.seeds = split_list(&seeds).map(str::to_string).collect();
        }
        if let Ok(uri) = std::env::var("GRIDDLE_METASTORE_URI") {
            config.metastore_uri = uri;
        }
        if let Some(rf) = env_parse("GRIDDLE_REPLICATION_FACTOR") {
            config.replication_factor = rf;
        }

        config.fill_metastore_default(data_dir);
        config
    }

    fn fill_metastore_default(&mut self, data_dir: &Path) {
        if self.metastore_uri.trim().is_empty() {
            self.metastore_uri = format!("file://{}/metastore", data_dir.display());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(GriddleError::Config("node_name is empty".into()));
        }
        if self.roles.is_empty() {
            return Err(GriddleError::Config("node has no roles".into()));
        }
        if self.replication_factor == 0 {
            return Err(GriddleError::Config("replication_factor must be at least 1".into()));
        }
        if self.rpc_port == self.http_port && self.rpc_port != 0 {
            return Err(GriddleError::Config(format!(
                "rpc_port and http_port are both {}",
                self.rpc_port
            )));
        }
        Ok(())
    }

    pub fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            advertise_addr: self.advertise_addr.clone(),
            rpc_port: self.rpc_port,
            http_port: self.http_port,
            roles: self.roles.clone(),
        }
    }

    pub fn rpc_bind(&self) -> String {
        format!("{}:{}", self.bind_addr, self.rpc_port)
    }

    pub fn http_bind(&self) -> String {
        format!("{}:{}", self.bind_addr, self.http_port)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn suspect_timeout(&self) -> Duration {
        Duration::from_millis(self.suspect_timeout_ms)
    }

    pub fn dead_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_timeout_ms)
    }

    pub fn fanout_timeout(&self) -> Duration {
        Duration::from_millis(self.fanout_timeout_ms)
    }
}
