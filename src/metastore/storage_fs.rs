//! Filesystem metastore storage with a polling change watcher.
//!
//! Records live at `{root}/{path}`. Writes are atomic (temp file + rename).
//! A background task rescans the tree every [`POLL_INTERVAL`] and publishes
//! events for changes made by other processes sharing the directory.

use super::storage::{MetastoreStorage, StorageEvent, STORAGE_EVENT_CAPACITY};
use crate::error::{GriddleError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

struct Inner {
    root: PathBuf,
    /// Last observed contents. Held across every write and every scan so the
    /// watcher never diffs against a half-applied local write.
    snapshot: Mutex<BTreeMap<String, Vec<u8>>>,
    events: broadcast::Sender<StorageEvent>,
}

pub struct FsStorage {
    inner: Arc<Inner>,
}

impl FsStorage {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let initial = scan_blocking(root.clone()).await?;
        let (events, _) = broadcast::channel(STORAGE_EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            root,
            snapshot: Mutex::new(initial),
            events,
        });
        spawn_watcher(Arc::downgrade(&inner));
        Ok(FsStorage { inner })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let rel = path.trim_start_matches('/');
        if rel.is_empty() || rel.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
            return Err(GriddleError::InvalidUri(format!(
                "invalid metastore path '{}'",
                path
            )));
        }
        Ok(self.inner.root.join(rel))
    }
}

#[async_trait]
impl MetastoreStorage for FsStorage {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let full = self.full_path(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let all = scan_blocking(self.inner.root.clone()).await?;
        Ok(all
            .into_keys()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.full_path(path)?;
        let mut snapshot = self.inner.snapshot.lock().await;

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = full.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &full).await?;

        snapshot.insert(path.to_string(), data.to_vec());
        drop(snapshot);
        debug!(path, size = data.len(), "[METASTORE] fs put");
        let _ = self.inner.events.send(StorageEvent::Put {
            path: path.to_string(),
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        let mut snapshot = self.inner.snapshot.lock().await;
        let existed = match tokio::fs::remove_file(&full).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        snapshot.remove(path);
        drop(snapshot);

        if let Some(parent) = full.parent() {
            if parent != self.inner.root {
                // fails while other records remain; that is fine
                let _ = tokio::fs::remove_dir(parent).await;
            }
        }
        if existed {
            let _ = self.inner.events.send(StorageEvent::Delete {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.full_path(path)?;
        Ok(tokio::fs::try_exists(&full).await?)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.events.subscribe()
    }
}

fn spawn_watcher(inner: Weak<Inner>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if let Err(e) = poll_once(&inner).await {
                warn!(root = %inner.root.display(), "[METASTORE] watcher scan failed: {}", e);
            }
        }
    });
}

async fn poll_once(inner: &Inner) -> Result<()> {
    let mut snapshot = inner.snapshot.lock().await;
    let current = scan_blocking(inner.root.clone()).await?;

    for (path, data) in &current {
        if snapshot.get(path) != Some(data) {
            let _ = inner.events.send(StorageEvent::Put {
                path: path.clone(),
                data: data.clone(),
            });
        }
    }
    for path in snapshot.keys() {
        if !current.contains_key(path) {
            let _ = inner.events.send(StorageEvent::Delete { path: path.clone() });
        }
    }
    *snapshot = current;
    Ok(())
}

async fn scan_blocking(root: PathBuf) -> Result<BTreeMap<String, Vec<u8>>> {
    tokio::task::spawn_blocking(move || scan(&root))
        .await
        .map_err(|e| GriddleError::Io(format!("scan task failed: {}", e)))?
        .map_err(Into::into)
}

fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || name.ends_with(".lock") || name.ends_with(".tmp")
}

fn scan(root: &Path) -> std::io::Result<BTreeMap<String, Vec<u8>>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![(root.to_path_buf(), String::new())];
    while let Some((dir, rel)) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_ignored(&name) {
                continue;
            }
            let rel_path = if rel.is_empty() {
                name
            } else {
                format!("{}/{}", rel, name)
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push((entry.path(), rel_path));
            } else if file_type.is_file() {
                match std::fs::read(entry.path()) {
                    Ok(data) => {
                        out.insert(rel_path, data);
                    }
                    // removed between read_dir and read
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(out)
}
