use crate::error::{GriddleError, Result};
use crate::mapping::{IndexMapping, ALL_FIELD};
use crate::types::{IndexName, ShardName};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const INDEX_RECORD: &str = "index.json";
pub const SHARD_PREFIX: &str = "shard-";
const SHARD_SUFFIX_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub name: ShardName,
    pub shard_uri: String,
    /// Empty when the storage backend needs no lock.
    #[serde(default)]
    pub lock_uri: String,
    /// Nanosecond stamp, bumped on every write batch.
    pub version: i64,
}

impl ShardMetadata {
    /// Clone with a version strictly greater than the current one.
    pub fn touched(&self) -> Self {
        ShardMetadata {
            version: crate::now_nanos().max(self.version.saturating_add(1)),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: IndexName,
    pub index_uri: String,
    #[serde(default)]
    pub lock_uri: String,
    #[serde(default)]
    pub mapping: IndexMapping,
    pub mapping_version: i64,
    #[serde(default = "default_search_field")]
    pub default_search_field: String,
    /// Persisted as separate records; see [`shard_path`].
    #[serde(skip)]
    pub shards: BTreeMap<ShardName, ShardMetadata>,
}

fn default_search_field() -> String {
    ALL_FIELD.to_string()
}

impl IndexMetadata {
    /// Build metadata for a new index with `num_shards` freshly named shards
    /// (at least one).
    pub fn new(
        name: impl Into<String>,
        index_uri: impl Into<String>,
        lock_uri: impl Into<String>,
        mapping: IndexMapping,
        num_shards: usize,
    ) -> Self {
        let version = crate::now_nanos();
        let mut meta = IndexMetadata {
            name: name.into(),
            index_uri: index_uri.into().trim_end_matches('/').to_string(),
            lock_uri: lock_uri.into().trim_end_matches('/').to_string(),
            mapping,
            mapping_version: version,
            default_search_field: default_search_field(),
            shards: BTreeMap::new(),
        };
        let mut rng = rand::thread_rng();
        while meta.shards.len() < num_shards.max(1) {
            let shard_name = random_shard_name(&mut rng);
            if meta.shards.contains_key(&shard_name) {
                continue;
            }
            let shard = meta.new_shard(shard_name, version);
            meta.shards.insert(shard.name.clone(), shard);
        }
        meta
    }

    pub fn with_default_search_field(mut self, field: impl Into<String>) -> Self {
        self.default_search_field = field.into();
        self
    }

    fn new_shard(&self, name: ShardName, version: i64) -> ShardMetadata {
        let lock_uri = if self.lock_uri.is_empty() {
            String::new()
        } else {
            format!("{}/{}", self.lock_uri, name)
        };
        ShardMetadata {
            shard_uri: format!("{}/{}", self.index_uri, name),
            lock_uri,
            name,
            version,
        }
    }

    pub fn shard(&self, shard_name: &str) -> Result<&ShardMetadata> {
        self.shards
            .get(shard_name)
            .ok_or_else(|| GriddleError::ShardNotFound {
                index: self.name.clone(),
                shard: shard_name.to_string(),
            })
    }

    pub fn shard_names(&self) -> Vec<ShardName> {
        self.shards.keys().cloned().collect()
    }
}

fn random_shard_name(rng: &mut impl Rng) -> ShardName {
    let suffix: String = (0..SHARD_SUFFIX_LEN)
        .map(|_| char::from(rng.sample(Alphanumeric)).to_ascii_lowercase())
        .collect();
    format!("{}{}", SHARD_PREFIX, suffix)
}

/// Index names become a path segment in the metastore and in shard URIs.
pub fn validate_index_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(GriddleError::InvalidIndexName(
            "index names must be 1-255 characters".to_string(),
        ));
    }
    if name.starts_with('.') || name.starts_with('_') {
        return Err(GriddleError::InvalidIndexName(format!(
            "'{}' must not start with '.' or '_'",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(GriddleError::InvalidIndexName(format!(
            "'{}' may only contain ASCII letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetastoreEventKind {
    PutIndex,
    DeleteIndex,
    PutShard,
    DeleteShard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetastoreEvent {
    pub kind: MetastoreEventKind,
    pub index_name: IndexName,
    /// Empty for index-level events.
    pub shard_name: ShardName,
}

impl MetastoreEvent {
    pub fn index(kind: MetastoreEventKind, index_name: &str) -> Self {
        MetastoreEvent {
            kind,
            index_name: index_name.to_string(),
            shard_name: String::new(),
        }
    }

    pub fn shard(kind: MetastoreEventKind, index_name: &str, shard_name: &str) -> Self {
        MetastoreEvent {
            kind,
            index_name: index_name.to_string(),
            shard_name: shard_name.to_string(),
        }
    }
}

/// What a metastore storage path refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPath {
    Index(IndexName),
    Shard(IndexName, ShardName),
}

pub fn index_path(index_name: &str) -> String {
    format!("{}/{}", index_name, INDEX_RECORD)
}

pub fn shard_path(index_name: &str, shard_name: &str) -> String {
    format!("{}/{}.json", index_name, shard_name)
}

/// Parse `<index>/index.json` or `<index>/shard-<id>.json`. Anything else is
/// not a metastore record.
pub fn parse_path(path: &str) -> Option<RecordPath> {
    let (index, file) = path.trim_start_matches('/').split_once('/')?;
    if index.is_empty() || file.contains('/') {
        return None;
    }
    if file == INDEX_RECORD {
        return Some(RecordPath::Index(index.to_string()));
    }
    let shard = file.strip_suffix(".json")?;
    if shard.len() > SHARD_PREFIX.len() && shard.starts_with(SHARD_PREFIX) {
        return Some(RecordPath::Shard(index.to_string(), shard.to_string()));
    }
    None
}
