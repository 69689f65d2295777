//! Durable, watchable store of index and shard metadata.
//!
//! The [`Metastore`] keeps an in-memory copy of every [`IndexMetadata`] plus
//! one shard ring per index, hydrated from storage before it is handed out.
//! Mutations are serialized, persisted, applied to the in-memory state and
//! only then announced as [`MetastoreEvent`]s, so a subscriber that reads the
//! metastore after receiving an event sees at least that change.
//!
//! Changes written by other processes reach this node through the storage
//! event stream; each one triggers a reload of the affected index from
//! storage and a diff against the in-memory copy. Echoes of our own writes
//! diff as equal and produce no events.

pub mod metadata;
pub mod storage;
pub mod storage_fs;
pub mod storage_mem;

pub use metadata::{
    index_path, parse_path, shard_path, validate_index_name, IndexMetadata, MetastoreEvent,
    MetastoreEventKind, RecordPath, ShardMetadata,
};
pub use storage::{open_storage, MetastoreStorage, StorageEvent};
pub use storage_fs::FsStorage;
pub use storage_mem::MemStorage;

use crate::error::{GriddleError, Result};
use crate::ring::RendezvousRing;
use crate::types::ShardName;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

pub const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    indexes: BTreeMap<String, Arc<IndexMetadata>>,
    rings: HashMap<String, RendezvousRing>,
}

impl State {
    fn insert(&mut self, meta: IndexMetadata) {
        let ring = RendezvousRing::with_members(meta.shards.keys().cloned());
        self.rings.insert(meta.name.clone(), ring);
        self.indexes.insert(meta.name.clone(), Arc::new(meta));
    }

    fn remove(&mut self, name: &str) -> Option<Arc<IndexMetadata>> {
        self.rings.remove(name);
        self.indexes.remove(name)
    }
}

pub struct Metastore {
    storage: Arc<dyn MetastoreStorage>,
    state: RwLock<State>,
    /// Serializes every mutation, local or replayed from storage.
    write_lock: Mutex<()>,
    events: broadcast::Sender<MetastoreEvent>,
}

impl Metastore {
    /// Open the storage named by `uri` and hydrate from it.
    pub async fn open(uri: &str) -> Result<Arc<Self>> {
        let storage = open_storage(uri).await?;
        Self::with_storage(storage).await
    }

    /// Hydrate from `storage` and start following its change stream.
    ///
    /// Returns only once every index and shard record has been loaded.
    pub async fn with_storage(storage: Arc<dyn MetastoreStorage>) -> Result<Arc<Self>> {
        // subscribe before listing so no change slips between the two
        let storage_events = storage.subscribe();
        let loaded = load_records(storage.as_ref(), "").await?;

        let mut state = State::default();
        let shard_count: usize = loaded.values().map(|m| m.shards.len()).sum();
        for (_, meta) in loaded {
            state.insert(meta);
        }
        info!(
            indexes = state.indexes.len(),
            shards = shard_count,
            "[METASTORE] hydrated"
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let metastore = Arc::new(Metastore {
            storage,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
            events,
        });
        spawn_storage_follower(Arc::downgrade(&metastore), storage_events);
        Ok(metastore)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: MetastoreEvent) {
        debug!(kind = ?event.kind, index = %event.index_name, shard = %event.shard_name, "[METASTORE] event");
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetastoreEvent> {
        self.events.subscribe()
    }

    pub fn get_index_metadata(&self, name: &str) -> Result<Arc<IndexMetadata>> {
        self.read_state()
            .indexes
            .get(name)
            .cloned()
            .ok_or_else(|| GriddleError::IndexNotFound(name.to_string()))
    }

    pub fn get_shard_metadata(&self, index: &str, shard: &str) -> Result<ShardMetadata> {
        self.get_index_metadata(index)?.shard(shard).cloned()
    }

    pub fn contains_index(&self, name: &str) -> bool {
        self.read_state().indexes.contains_key(name)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.read_state().indexes.keys().cloned().collect()
    }

    /// Every index, keyed by name. Cheap: the records are shared.
    pub fn snapshot(&self) -> BTreeMap<String, Arc<IndexMetadata>> {
        self.read_state().indexes.clone()
    }

    /// Owning shard of `document_id`, from the index's shard ring.
    pub fn get_responsible_shard(&self, index: &str, document_id: &str) -> Result<ShardName> {
        let state = self.read_state();
        let ring = state
            .rings
            .get(index)
            .ok_or_else(|| GriddleError::IndexNotFound(index.to_string()))?;
        ring.lookup(document_id)
            .ok_or_else(|| GriddleError::ShardNotFound {
                index: index.to_string(),
                shard: String::new(),
            })
    }

    /// Persist `meta` and every shard it holds, replacing any previous
    /// record for `name`. Shards present before but absent from `meta` are
    /// removed.
    ///
    /// Emits `PutIndex`, then one `PutShard` per shard (after any
    /// `DeleteShard` for removed shards).
    pub async fn set_index_metadata(&self, name: &str, mut meta: IndexMetadata) -> Result<()> {
        validate_index_name(name)?;
        meta.name = name.to_string();
        for (shard_name, shard) in meta.shards.iter_mut() {
            shard.name = shard_name.clone();
        }

        let _guard = self.write_lock.lock().await;
        let previous = self.read_state().indexes.get(name).cloned();

        self.storage
            .put(&index_path(name), &serde_json::to_vec_pretty(&meta)?)
            .await?;
        for shard in meta.shards.values() {
            self.storage
                .put(&shard_path(name, &shard.name), &serde_json::to_vec_pretty(shard)?)
                .await?;
        }
        let removed: Vec<ShardName> = previous
            .as_ref()
            .map(|prev| {
                prev.shards
                    .keys()
                    .filter(|s| !meta.shards.contains_key(*s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for shard in &removed {
            self.storage.delete(&shard_path(name, shard)).await?;
        }

        let shard_names = meta.shard_names();
        self.write_state().insert(meta);
        info!(index = name, shards = shard_names.len(), "[METASTORE] index metadata stored");

        for shard in &removed {
            self.emit(MetastoreEvent::shard(MetastoreEventKind::DeleteShard, name, shard));
        }
        self.emit(MetastoreEvent::index(MetastoreEventKind::PutIndex, name));
        for shard in &shard_names {
            self.emit(MetastoreEvent::shard(MetastoreEventKind::PutShard, name, shard));
        }
        Ok(())
    }

    /// Remove the index and all its shard records.
    ///
    /// Emits one `DeleteShard` per shard, then `DeleteIndex`.
    pub async fn delete_index_metadata(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let meta = self.get_index_metadata(name)?;

        for shard in meta.shards.keys() {
            self.storage.delete(&shard_path(name, shard)).await?;
        }
        self.storage.delete(&index_path(name)).await?;

        self.write_state().remove(name);
        info!(index = name, "[METASTORE] index metadata deleted");

        for shard in meta.shards.keys() {
            self.emit(MetastoreEvent::shard(MetastoreEventKind::DeleteShard, name, shard));
        }
        self.emit(MetastoreEvent::index(MetastoreEventKind::DeleteIndex, name));
        Ok(())
    }

    /// Give the shard a fresh, strictly greater version and persist it.
    /// Emits `PutShard`. Returns the new version.
    pub async fn touch_shard_metadata(&self, index: &str, shard: &str) -> Result<i64> {
        let _guard = self.write_lock.lock().await;
        let meta = self.get_index_metadata(index)?;
        let touched = meta.shard(shard)?.touched();

        self.storage
            .put(&shard_path(index, shard), &serde_json::to_vec_pretty(&touched)?)
            .await?;

        let version = touched.version;
        let mut updated = IndexMetadata::clone(&meta);
        updated.shards.insert(shard.to_string(), touched);
        self.write_state().insert(updated);

        self.emit(MetastoreEvent::shard(MetastoreEventKind::PutShard, index, shard));
        Ok(version)
    }

    /// Reload the indexes named in `names` (all indexes when `None`) from
    /// storage and announce whatever differs from memory.
    async fn resync(&self, names: Option<BTreeSet<String>>) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut loaded = BTreeMap::new();
        let names = match names {
            Some(names) => {
                for name in &names {
                    loaded.extend(load_records(self.storage.as_ref(), &format!("{}/", name)).await?);
                }
                names
            }
            None => {
                loaded = load_records(self.storage.as_ref(), "").await?;
                let mut all: BTreeSet<String> = loaded.keys().cloned().collect();
                all.extend(self.read_state().indexes.keys().cloned());
                all
            }
        };

        let mut events = Vec::new();
        {
            let mut state = self.write_state();
            for name in names {
                let old = state.indexes.get(&name).cloned();
                let new = loaded.remove(&name);
                events.extend(diff_index(&name, old.as_deref(), new.as_ref()));
                match new {
                    Some(meta) => {
                        if old.as_deref() != Some(&meta) {
                            state.insert(meta);
                        }
                    }
                    None => {
                        state.remove(&name);
                    }
                }
            }
        }

        if !events.is_empty() {
            debug!(count = events.len(), "[METASTORE] applying external changes");
        }
        for event in events {
            self.emit(event);
        }
        Ok(())
    }
}

fn spawn_storage_follower(
    metastore: Weak<Metastore>,
    mut storage_events: broadcast::Receiver<StorageEvent>,
) {
    tokio::spawn(async move {
        loop {
            let names = match storage_events.recv().await {
                Ok(event) => match parse_path(event.path()) {
                    Some(RecordPath::Index(index)) | Some(RecordPath::Shard(index, _)) => {
                        Some(BTreeSet::from([index]))
                    }
                    None => continue,
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "[METASTORE] storage events lagged, full resync");
                    None
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(metastore) = metastore.upgrade() else {
                break;
            };
            if let Err(e) = metastore.resync(names).await {
                warn!("[METASTORE] resync after storage event failed: {}", e);
            }
        }
    });
}

/// Decode every index under `prefix` with its shards. Undecodable records
/// and shards without an index record are skipped.
async fn load_records(
    storage: &dyn MetastoreStorage,
    prefix: &str,
) -> Result<BTreeMap<String, IndexMetadata>> {
    let mut indexes: BTreeMap<String, IndexMetadata> = BTreeMap::new();
    let mut shards: Vec<(String, ShardMetadata)> = Vec::new();

    for path in storage.list(prefix).await? {
        let Some(record) = parse_path(&path) else {
            continue;
        };
        let Some(data) = storage.get(&path).await? else {
            continue;
        };
        match record {
            RecordPath::Index(name) => match serde_json::from_slice::<IndexMetadata>(&data) {
                Ok(mut meta) => {
                    meta.name = name.clone();
                    indexes.insert(name, meta);
                }
                Err(e) => warn!(path = %path, "[METASTORE] skipping bad index record: {}", e),
            },
            RecordPath::Shard(index, shard_name) => {
                match serde_json::from_slice::<ShardMetadata>(&data) {
                    Ok(mut shard) => {
                        shard.name = shard_name;
                        shards.push((index, shard));
                    }
                    Err(e) => warn!(path = %path, "[METASTORE] skipping bad shard record: {}", e),
                }
            }
        }
    }

    for (index, shard) in shards {
        match indexes.get_mut(&index) {
            Some(meta) => {
                meta.shards.insert(shard.name.clone(), shard);
            }
            None => debug!(index = %index, shard = %shard.name, "[METASTORE] shard without index record"),
        }
    }
    Ok(indexes)
}

fn same_index_record(a: &IndexMetadata, b: &IndexMetadata) -> bool {
    a.index_uri == b.index_uri
        && a.lock_uri == b.lock_uri
        && a.mapping == b.mapping
        && a.mapping_version == b.mapping_version
        && a.default_search_field == b.default_search_field
}

/// Semantic events turning `old` into `new`.
fn diff_index(
    name: &str,
    old: Option<&IndexMetadata>,
    new: Option<&IndexMetadata>,
) -> Vec<MetastoreEvent> {
    use MetastoreEventKind::*;
    let mut events = Vec::new();
    match (old, new) {
        (None, None) => {}
        (Some(old), None) => {
            for shard in old.shards.keys() {
                events.push(MetastoreEvent::shard(DeleteShard, name, shard));
            }
            events.push(MetastoreEvent::index(DeleteIndex, name));
        }
        (None, Some(new)) => {
            events.push(MetastoreEvent::index(PutIndex, name));
            for shard in new.shards.keys() {
                events.push(MetastoreEvent::shard(PutShard, name, shard));
            }
        }
        (Some(old), Some(new)) => {
            for shard in old.shards.keys() {
                if !new.shards.contains_key(shard) {
                    events.push(MetastoreEvent::shard(DeleteShard, name, shard));
                }
            }
            if !same_index_record(old, new) {
                events.push(MetastoreEvent::index(PutIndex, name));
            }
            for (shard, meta) in &new.shards {
                if old.shards.get(shard) != Some(meta) {
                    events.push(MetastoreEvent::shard(PutShard, name, shard));
                }
            }
        }
    }
    events
}
