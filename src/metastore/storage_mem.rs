//! In-memory metastore storage.

use super::storage::{MetastoreStorage, StorageEvent, STORAGE_EVENT_CAPACITY};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// `BTreeMap` behind a `RwLock`. Events are published synchronously from
/// `put`/`delete`, after the map is updated.
///
/// Share one instance (via `Arc`) between several metastores to simulate a
/// common coordination store in a single process.
pub struct MemStorage {
    name: String,
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    events: broadcast::Sender<StorageEvent>,
}

impl MemStorage {
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(STORAGE_EVENT_CAPACITY);
        MemStorage {
            name: name.into(),
            entries: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    pub fn shared(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl MetastoreStorage for MemStorage {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(path).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(path.to_string(), data.to_vec());
        debug!(storage = %self.name, path, size = data.len(), "mem storage put");
        let _ = self.events.send(StorageEvent::Put {
            path: path.to_string(),
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let removed = self.entries.write().await.remove(path).is_some();
        if removed {
            let _ = self.events.send(StorageEvent::Delete {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(path))
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let s = MemStorage::new("t");
        assert_eq!(s.get("a/index.json").await.unwrap(), None);
        s.put("a/index.json", b"1").await.unwrap();
        assert_eq!(s.get("a/index.json").await.unwrap(), Some(b"1".to_vec()));
        assert!(s.exists("a/index.json").await.unwrap());
        s.delete("a/index.json").await.unwrap();
        assert!(!s.exists("a/index.json").await.unwrap());
        s.delete("a/index.json").await.unwrap();
    }

    #[tokio::test]
    async fn list_by_prefix() {
        let s = MemStorage::new("t");
        s.put("a/index.json", b"").await.unwrap();
        s.put("a/shard-1.json", b"").await.unwrap();
        s.put("ab/index.json", b"").await.unwrap();
        s.put("b/index.json", b"").await.unwrap();
        assert_eq!(
            s.list("a/").await.unwrap(),
            vec!["a/index.json".to_string(), "a/shard-1.json".to_string()]
        );
        assert_eq!(s.list("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn events_follow_mutations() {
        let s = MemStorage::new("t");
        let mut rx = s.subscribe();
        s.put("a/index.json", b"x").await.unwrap();
        s.delete("a/index.json").await.unwrap();
        s.delete("never/existed.json").await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            StorageEvent::Put {
                path: "a/index.json".into(),
                data: b"x".to_vec()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StorageEvent::Delete {
                path: "a/index.json".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
