//! Key/value storage under the metastore.

use crate::error::{GriddleError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const STORAGE_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    Put { path: String, data: Vec<u8> },
    Delete { path: String },
}

impl StorageEvent {
    pub fn path(&self) -> &str {
        match self {
            StorageEvent::Put { path, .. } | StorageEvent::Delete { path } => path,
        }
    }
}

/// Watchable key/value store. Paths are `/`-separated and relative.
///
/// Implementations publish a [`StorageEvent`] for every put/delete they
/// observe, including changes made by other processes when the backend can
/// see them.
#[async_trait]
pub trait MetastoreStorage: Send + Sync {
    /// `Ok(None)` when the path does not exist.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Every stored path starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn put(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Deleting a missing path is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

/// Open the storage named by `uri`: `file:///path` or `mem://name`.
///
/// Every `mem://` open returns a fresh store; share an `Arc<MemStorage>`
/// directly when several metastores must see the same records.
///
/// # Errors
///
/// [`GriddleError::InvalidUri`] when the URI does not parse,
/// [`GriddleError::UnsupportedBackend`] for any other scheme.
pub async fn open_storage(uri: &str) -> Result<Arc<dyn MetastoreStorage>> {
    let parsed = url::Url::parse(uri)
        .map_err(|e| GriddleError::InvalidUri(format!("{}: {}", uri, e)))?;
    match parsed.scheme() {
        "file" => {
            let path = parsed
                .to_file_path()
                .map_err(|_| GriddleError::InvalidUri(format!("{}: not a local path", uri)))?;
            let storage = super::storage_fs::FsStorage::open(path).await?;
            Ok(Arc::new(storage))
        }
        "mem" => Ok(super::storage_mem::MemStorage::shared(uri)),
        other => Err(GriddleError::UnsupportedBackend(format!(
            "metastore scheme '{}' in {}",
            other, uri
        ))),
    }
}
