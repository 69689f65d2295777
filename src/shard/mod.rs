//! Open shard handles and the per-node pools that own them.
//!
//! A [`ShardWriter`] holds the single tantivy `IndexWriter` for a shard plus
//! the storage lock guarding it. A [`ShardReader`] holds a manually reloaded
//! `IndexReader` stamped with the shard version it was opened at.

pub mod pool;
pub mod search;

pub use pool::{HandlePool, ReaderPool, WriterPool};
pub use search::{search_local, validate_request};

use crate::directory::DirectoryFactory;
use crate::error::{GriddleError, Result};
use crate::lock::{open_lock_manager, LockManager};
use crate::mapping::DocumentConverter;
use crate::metastore::{IndexMetadata, ShardMetadata};
use crate::types::{Document, DocumentId};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, info, warn};

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Something a [`HandlePool`] can open and close.
#[async_trait]
pub trait ShardHandle: Send + Sync + Sized + 'static {
    const KIND: &'static str;

    async fn open(
        factory: &DirectoryFactory,
        index: &IndexMetadata,
        shard: &ShardMetadata,
    ) -> Result<Self>;

    async fn close(&self) -> Result<()>;

    /// Shard version this handle was opened at.
    fn version(&self) -> i64;
}

async fn open_index(
    factory: &DirectoryFactory,
    index: &IndexMetadata,
    shard: &ShardMetadata,
) -> Result<Index> {
    let directory = factory.open(&shard.shard_uri).await?;
    let schema = index.mapping.to_tantivy();
    tokio::task::spawn_blocking(move || Index::open_or_create(directory, schema))
        .await
        .map_err(|e| GriddleError::Io(format!("open index task failed: {}", e)))?
        .map_err(Into::into)
}

pub struct ShardWriter {
    index_name: String,
    shard_name: String,
    version: i64,
    converter: DocumentConverter,
    writer: Arc<Mutex<Option<IndexWriter>>>,
    lock: Box<dyn LockManager>,
}

impl std::fmt::Debug for ShardWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardWriter")
            .field("index", &self.index_name)
            .field("shard", &self.shard_name)
            .field("version", &self.version)
            .finish()
    }
}

enum WriteBatch {
    Upsert(Vec<(DocumentId, TantivyDocument)>),
    Delete(Vec<DocumentId>),
}

impl ShardWriter {
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn shard_name(&self) -> &str {
        &self.shard_name
    }

    /// Insert or replace `docs` and commit. The batch is converted up front,
    /// so one malformed document rejects the whole batch before any write.
    pub async fn add_documents(&self, docs: &[Document]) -> Result<usize> {
        let timestamp = crate::now_nanos();
        let prepared = docs
            .iter()
            .map(|doc| Ok((doc.id.clone(), self.converter.to_tantivy(doc, timestamp)?)))
            .collect::<Result<Vec<_>>>()?;
        self.apply(WriteBatch::Upsert(prepared)).await
    }

    /// Delete by id and commit. Unknown ids are a no-op.
    pub async fn delete_documents(&self, ids: &[DocumentId]) -> Result<usize> {
        self.apply(WriteBatch::Delete(ids.to_vec())).await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<usize> {
        let writer = Arc::clone(&self.writer);
        let id_field = self.converter.id_field();
        let index = self.index_name.clone();
        let shard = self.shard_name.clone();

        let count = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut guard = writer
                .lock()
                .map_err(|_| GriddleError::Io(format!("writer for {}/{} poisoned", index, shard)))?;
            let writer = guard
                .as_mut()
                .ok_or_else(|| GriddleError::HandleNotOpen {
                    index: index.clone(),
                    shard: shard.clone(),
                })?;

            let count = match batch {
                WriteBatch::Upsert(docs) => {
                    let n = docs.len();
                    for (id, doc) in docs {
                        writer.delete_term(Term::from_field_text(id_field, &id));
                        writer.add_document(doc)?;
                    }
                    n
                }
                WriteBatch::Delete(ids) => {
                    for id in &ids {
                        writer.delete_term(Term::from_field_text(id_field, id));
                    }
                    ids.len()
                }
            };
            if let Err(e) = writer.commit() {
                warn!("[WRITE {}/{}] commit failed, rolling back: {}", index, shard, e);
                if let Err(rollback_err) = writer.rollback() {
                    warn!("[WRITE {}/{}] rollback failed: {}", index, shard, rollback_err);
                }
                return Err(e.into());
            }
            Ok(count)
        })
        .await
        .map_err(|e| GriddleError::Io(format!("write task failed: {}", e)))??;

        debug!("[WRITE {}/{}] committed {} ops", self.index_name, self.shard_name, count);
        Ok(count)
    }
}

#[async_trait]
impl ShardHandle for ShardWriter {
    const KIND: &'static str = "writer";

    async fn open(
        factory: &DirectoryFactory,
        index: &IndexMetadata,
        shard: &ShardMetadata,
    ) -> Result<Self> {
        let lock = open_lock_manager(&shard.lock_uri)?;
        lock.lock().await?;

        let opened = async {
            let tantivy_index = open_index(factory, index, shard).await?;
            let converter = DocumentConverter::new(&index.mapping, &tantivy_index.schema())?;
            let mut writer: IndexWriter =
                tantivy_index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?;
            let mut merge_policy = tantivy::merge_policy::LogMergePolicy::default();
            merge_policy.set_del_docs_ratio_before_merge(0.3);
            writer.set_merge_policy(Box::new(merge_policy));
            Ok::<_, GriddleError>((converter, writer))
        }
        .await;

        match opened {
            Ok((converter, writer)) => {
                info!("[WRITE {}/{}] writer opened", index.name, shard.name);
                Ok(ShardWriter {
                    index_name: index.name.clone(),
                    shard_name: shard.name.clone(),
                    version: shard.version,
                    converter,
                    writer: Arc::new(Mutex::new(Some(writer))),
                    lock,
                })
            }
            Err(e) => {
                if let Err(unlock_err) = lock.unlock().await {
                    warn!(
                        "[WRITE {}/{}] unlock after failed open: {}",
                        index.name, shard.name, unlock_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        // the mutex is held for the length of a commit
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let taken = writer
                .lock()
                .map_err(|_| GriddleError::Io("writer mutex poisoned".to_string()))?
                .take();
            if let Some(writer) = taken {
                writer.wait_merging_threads()?;
            }
            Ok(())
        })
        .await
        .map_err(|e| GriddleError::Io(format!("close task failed: {}", e)))??;
        self.lock.unlock().await?;
        info!("[WRITE {}/{}] writer closed", self.index_name, self.shard_name);
        Ok(())
    }

    fn version(&self) -> i64 {
        self.version
    }
}

pub struct ShardReader {
    index_name: String,
    shard_name: String,
    version: i64,
    default_search_field: String,
    index: Index,
    reader: IndexReader,
    converter: DocumentConverter,
}

impl std::fmt::Debug for ShardReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardReader")
            .field("index", &self.index_name)
            .field("shard", &self.shard_name)
            .field("version", &self.version)
            .finish()
    }
}

impl ShardReader {
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn shard_name(&self) -> &str {
        &self.shard_name
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    pub(crate) fn index(&self) -> &Index {
        &self.index
    }

    pub(crate) fn reader(&self) -> &IndexReader {
        &self.reader
    }

    pub(crate) fn converter(&self) -> &DocumentConverter {
        &self.converter
    }

    pub(crate) fn default_search_field(&self) -> &str {
        &self.default_search_field
    }
}

#[async_trait]
impl ShardHandle for ShardReader {
    const KIND: &'static str = "reader";

    async fn open(
        factory: &DirectoryFactory,
        index: &IndexMetadata,
        shard: &ShardMetadata,
    ) -> Result<Self> {
        let tantivy_index = open_index(factory, index, shard).await?;
        let converter = DocumentConverter::new(&index.mapping, &tantivy_index.schema())?;
        let reader: IndexReader = tantivy_index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        debug!(
            "[SEARCH {}/{}] reader opened at version {}",
            index.name, shard.name, shard.version
        );
        Ok(ShardReader {
            index_name: index.name.clone(),
            shard_name: shard.name.clone(),
            version: shard.version,
            default_search_field: index.default_search_field.clone(),
            index: tantivy_index,
            reader,
            converter,
        })
    }

    async fn close(&self) -> Result<()> {
        debug!("[SEARCH {}/{}] reader closed", self.index_name, self.shard_name);
        Ok(())
    }

    fn version(&self) -> i64 {
        self.version
    }
}
