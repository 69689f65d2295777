use super::{ShardHandle, ShardReader, ShardWriter};
use crate::directory::DirectoryFactory;
use crate::error::{GriddleError, Result};
use crate::metastore::{IndexMetadata, ShardMetadata};
use crate::types::{IndexName, ShardName};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub type WriterPool = HandlePool<ShardWriter>;
pub type ReaderPool = HandlePool<ShardReader>;

type Handles<H> = BTreeMap<IndexName, BTreeMap<ShardName, Arc<H>>>;

/// Per-node cache of open shard handles keyed by (index, shard).
///
/// Dispatch paths take the read side to fetch a handle; only open/close
/// take the write side, and never while a handle is being built.
pub struct HandlePool<H: ShardHandle> {
    factory: Arc<DirectoryFactory>,
    handles: RwLock<Handles<H>>,
}

impl<H: ShardHandle> HandlePool<H> {
    pub fn new(factory: Arc<DirectoryFactory>) -> Self {
        HandlePool {
            factory,
            handles: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn factory(&self) -> &Arc<DirectoryFactory> {
        &self.factory
    }

    /// Open and register a handle. Opening an already-open shard is a no-op.
    pub async fn open(
        &self,
        index: &str,
        shard: &str,
        index_meta: &IndexMetadata,
        shard_meta: &ShardMetadata,
    ) -> Result<()> {
        if self.contains(index, shard).await {
            return Ok(());
        }
        let handle = Arc::new(H::open(&self.factory, index_meta, shard_meta).await?);

        let mut handles = self.handles.write().await;
        let shards = handles.entry(index.to_string()).or_default();
        if shards.contains_key(shard) {
            drop(handles);
            // raced with another open; keep the registered one
            handle.close().await?;
            return Ok(());
        }
        shards.insert(shard.to_string(), handle);
        info!(index, shard, kind = H::KIND, version = shard_meta.version, "opened shard handle");
        Ok(())
    }

    /// Unregister and close a handle. Fails with `HandleNotOpen` when absent.
    pub async fn close(&self, index: &str, shard: &str) -> Result<()> {
        let handle = {
            let mut handles = self.handles.write().await;
            let removed = handles.get_mut(index).and_then(|shards| shards.remove(shard));
            if handles.get(index).is_some_and(|shards| shards.is_empty()) {
                handles.remove(index);
            }
            removed
        };
        match handle {
            Some(handle) => {
                handle.close().await?;
                info!(index, shard, kind = H::KIND, "closed shard handle");
                Ok(())
            }
            None => Err(GriddleError::HandleNotOpen {
                index: index.to_string(),
                shard: shard.to_string(),
            }),
        }
    }

    /// Close (if open) then open again at `shard_meta`'s version.
    pub async fn reopen(
        &self,
        index: &str,
        shard: &str,
        index_meta: &IndexMetadata,
        shard_meta: &ShardMetadata,
    ) -> Result<()> {
        match self.close(index, shard).await {
            Ok(()) | Err(GriddleError::HandleNotOpen { .. }) => {}
            Err(e) => return Err(e),
        }
        self.open(index, shard, index_meta, shard_meta).await
    }

    pub async fn contains(&self, index: &str, shard: &str) -> bool {
        self.handles
            .read()
            .await
            .get(index)
            .is_some_and(|shards| shards.contains_key(shard))
    }

    pub async fn version(&self, index: &str, shard: &str) -> Option<i64> {
        self.handles
            .read()
            .await
            .get(index)
            .and_then(|shards| shards.get(shard))
            .map(|h| h.version())
    }

    pub async fn get(&self, index: &str, shard: &str) -> Result<Arc<H>> {
        self.handles
            .read()
            .await
            .get(index)
            .and_then(|shards| shards.get(shard))
            .cloned()
            .ok_or_else(|| GriddleError::HandleNotOpen {
                index: index.to_string(),
                shard: shard.to_string(),
            })
    }

    /// Every open (index, shard) with the version it was opened at.
    pub async fn list(&self) -> Vec<(IndexName, ShardName, i64)> {
        let handles = self.handles.read().await;
        handles
            .iter()
            .flat_map(|(index, shards)| {
                shards
                    .iter()
                    .map(move |(shard, h)| (index.clone(), shard.clone(), h.version()))
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.values().map(|s| s.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close everything. Every handle is attempted; the first error is
    /// returned after all have been tried.
    pub async fn close_all(&self) -> Result<()> {
        let drained: Handles<H> = std::mem::take(&mut *self.handles.write().await);
        let mut first_err = None;
        for (index, shards) in drained {
            for (shard, handle) in shards {
                if let Err(e) = handle.close().await {
                    warn!(index = %index, shard = %shard, kind = H::KIND, "close failed: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
