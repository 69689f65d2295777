//! Turns membership and metastore state into open shard handles, and runs
//! writes and searches as scatter-gather across the cluster.

use crate::assignment::{compute_assignments, AssignmentTable};
use crate::config::NodeConfig;
use crate::membership::{Membership, MembershipConfig};
use crate::network::NodeNetwork;
use crate::peer::{PeerConnector, ShardRpc};
use crate::types::{ClusterSnapshot, CreateIndexRequest, NodeName, OpenHandle};
use griddle::directory::{DirectoryFactory, StorageLocation};
use griddle::lock::open_lock_manager;
use griddle::mapping::ALL_FIELD;
use griddle::merge::{finalize, merge_responses};
use griddle::metastore::{
    validate_index_name, IndexMetadata, Metastore, MetastoreEvent, MetastoreEventKind,
};
use griddle::shard::{validate_request, ReaderPool, WriterPool};
use griddle::types::DocumentId;
use griddle::{Document, GriddleError, Result, SearchRequest, SearchResponse, ShardName};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Delay before retrying a reconciliation pass that left failures behind.
const RECONCILE_RETRY: Duration = Duration::from_millis(500);

enum WriteBatch {
    Add(Vec<Document>),
    Delete(Vec<DocumentId>),
}

impl WriteBatch {
    fn len(&self) -> usize {
        match self {
            WriteBatch::Add(docs) => docs.len(),
            WriteBatch::Delete(ids) => ids.len(),
        }
    }
}

pub struct Orchestrator {
    config: NodeConfig,
    membership: Arc<Membership>,
    metastore: Arc<Metastore>,
    factory: Arc<DirectoryFactory>,
    connector: Arc<dyn PeerConnector>,
    writers: WriterPool,
    readers: ReaderPool,
    assignments: RwLock<Arc<AssignmentTable>>,
    peers: RwLock<BTreeMap<String, Arc<dyn ShardRpc>>>,
    reconcile_lock: Mutex<()>,
    create_lock: Mutex<()>,
    ready: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        config: NodeConfig,
        metastore: Arc<Metastore>,
        factory: Arc<DirectoryFactory>,
        network: NodeNetwork,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let membership = Membership::new(
            config.node_name.clone(),
            config.metadata(),
            MembershipConfig::from_node_config(&config),
            network.gossip,
        );
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Orchestrator {
            writers: WriterPool::new(Arc::clone(&factory)),
            readers: ReaderPool::new(Arc::clone(&factory)),
            config,
            membership,
            metastore,
            factory,
            connector: network.peers,
            assignments: RwLock::new(Arc::new(AssignmentTable::default())),
            peers: RwLock::new(BTreeMap::new()),
            reconcile_lock: Mutex::new(()),
            create_lock: Mutex::new(()),
            ready: AtomicBool::new(false),
            shutdown,
        }))
    }

    pub fn local_name(&self) -> &str {
        self.membership.local_name()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn metastore(&self) -> &Arc<Metastore> {
        &self.metastore
    }

    pub fn writers(&self) -> &WriterPool {
        &self.writers
    }

    pub fn readers(&self) -> &ReaderPool {
        &self.readers
    }

    /// True once the first reconciliation pass has completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub async fn assignments(&self) -> Arc<AssignmentTable> {
        Arc::clone(&*self.assignments.read().await)
    }

    /// Start the reconcile loop and gossip, then contact the configured
    /// seeds. An unreachable seed list is logged; gossip keeps retrying it.
    pub async fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let handle = self.spawn_reconcile_loop();
        self.membership.start();
        if !self.config.seeds.is_empty() {
            if let Err(e) = self.membership.join(&self.config.seeds).await {
                warn!("[GOSSIP] initial join failed, will keep retrying: {}", e);
            }
        }
        handle
    }

    fn spawn_reconcile_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let mut cluster_events = self.membership.subscribe();
        let mut metastore_events = self.metastore.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut retry_at: Option<Instant> = None;
            match weak.upgrade() {
                Some(this) => {
                    if this.reconcile().await > 0 {
                        retry_at = Some(Instant::now() + RECONCILE_RETRY);
                    }
                    this.ready.store(true, Ordering::SeqCst);
                    info!("[RECONCILE] {} ready", this.local_name());
                }
                None => return,
            }

            loop {
                let retry = async {
                    match retry_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                let triggered = tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = retry => true,
                    event = cluster_events.recv() => match event {
                        Ok(event) => {
                            debug!("[RECONCILE] cluster {:?} {}", event.kind, event.node_name);
                            true
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!("[RECONCILE] missed {} cluster events, reconciling from scratch", n);
                            true
                        }
                        Err(RecvError::Closed) => break,
                    },
                    event = metastore_events.recv() => match event {
                        Ok(event) => triggers_reconcile(&event),
                        Err(RecvError::Lagged(n)) => {
                            warn!("[RECONCILE] missed {} metastore events, reconciling from scratch", n);
                            true
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if !triggered {
                    continue;
                }
                drain(&mut cluster_events);
                drain(&mut metastore_events);

                let Some(this) = weak.upgrade() else { break };
                retry_at = (this.reconcile().await > 0).then(|| Instant::now() + RECONCILE_RETRY);
            }
            debug!("[RECONCILE] loop stopped");
        })
    }

    /// Recompute assignments and converge local handles and peer clients to
    /// them. Individual failures are logged and counted, never propagated.
    pub async fn reconcile(&self) -> usize {
        let _serialized = self.reconcile_lock.lock().await;
        let members = self.membership.members();
        let indexes = self.metastore.snapshot();
        let table = Arc::new(compute_assignments(
            &members,
            &indexes,
            self.config.replication_factor,
        ));
        *self.assignments.write().await = Arc::clone(&table);

        let local = self.local_name().to_string();
        let mut failures = 0;

        let wanted: BTreeSet<(String, String)> = table.writers_for(&local).into_iter().collect();
        for (index, shard, _) in self.writers.list().await {
            if wanted.contains(&(index.clone(), shard.clone())) {
                continue;
            }
            if let Err(e) = self.writers.close(&index, &shard).await {
                warn!("[RECONCILE] closing writer {}/{} failed: {}", index, shard, e);
                failures += 1;
            }
        }
        for (index, shard) in &wanted {
            if self.writers.contains(index, shard).await {
                continue;
            }
            let Some(meta) = indexes.get(index) else { continue };
            let Ok(shard_meta) = meta.shard(shard) else { continue };
            if let Err(e) = self.writers.open(index, shard, meta, shard_meta).await {
                warn!("[RECONCILE] opening writer {}/{} failed: {}", index, shard, e);
                failures += 1;
            }
        }

        let wanted: BTreeSet<(String, String)> = table.readers_for(&local).into_iter().collect();
        for (index, shard, _) in self.readers.list().await {
            if wanted.contains(&(index.clone(), shard.clone())) {
                continue;
            }
            if let Err(e) = self.readers.close(&index, &shard).await {
                warn!("[RECONCILE] closing reader {}/{} failed: {}", index, shard, e);
                failures += 1;
            }
        }
        for (index, shard) in &wanted {
            let Some(meta) = indexes.get(index) else { continue };
            let Ok(shard_meta) = meta.shard(shard) else { continue };
            let result = match self.readers.version(index, shard).await {
                None => self.readers.open(index, shard, meta, shard_meta).await,
                Some(version) if version != shard_meta.version => {
                    debug!(
                        "[RECONCILE] reader {}/{} stale ({} < {}), reopening",
                        index, shard, version, shard_meta.version
                    );
                    self.readers.reopen(index, shard, meta, shard_meta).await
                }
                Some(_) => Ok(()),
            };
            if let Err(e) = result {
                warn!("[RECONCILE] opening reader {}/{} failed: {}", index, shard, e);
                failures += 1;
            }
        }

        let wanted: BTreeSet<String> = members
            .iter()
            .filter(|node| node.name != local)
            .map(|node| node.metadata.rpc_addr())
            .collect();
        {
            let mut peers = self.peers.write().await;
            peers.retain(|addr, _| {
                let keep = wanted.contains(addr);
                if !keep {
                    debug!("[RECONCILE] dropping peer client {}", addr);
                }
                keep
            });
            for addr in wanted {
                if !peers.contains_key(&addr) {
                    debug!("[RECONCILE] connecting peer client {}", addr);
                    let client = self.connector.connect(&addr);
                    peers.insert(addr, client);
                }
            }
        }

        debug!(
            "[RECONCILE] {}: {} member(s), {} index(es), {} writer(s), {} reader(s), {} failure(s)",
            local,
            members.len(),
            indexes.len(),
            self.writers.len().await,
            self.readers.len().await,
            failures
        );
        failures
    }

    async fn peer(&self, node: &str) -> Result<Arc<dyn ShardRpc>> {
        let addr = self.membership.metadata(node)?.rpc_addr();
        if let Some(client) = self.peers.read().await.get(&addr) {
            return Ok(Arc::clone(client));
        }
        let mut peers = self.peers.write().await;
        let client = peers
            .entry(addr.clone())
            .or_insert_with(|| self.connector.connect(&addr));
        Ok(Arc::clone(client))
    }

    // ── index lifecycle ─────────────────────────────────────────────────

    /// Record a new index in the metastore. Shards get placed and opened by
    /// reconciliation on every node.
    pub async fn create_index(
        &self,
        name: &str,
        request: CreateIndexRequest,
    ) -> Result<Arc<IndexMetadata>> {
        validate_index_name(name)?;
        request.mapping.validate()?;
        let search_field = request
            .default_search_field
            .clone()
            .unwrap_or_else(|| ALL_FIELD.to_string());
        request.mapping.validate_search_field(&search_field)?;
        StorageLocation::parse_supported(&request.storage_uri)?;
        open_lock_manager(&request.lock_uri)?;

        let _creating = self.create_lock.lock().await;
        if self.metastore.contains_index(name) {
            return Err(GriddleError::IndexAlreadyExists(name.to_string()));
        }
        let meta = IndexMetadata::new(
            name,
            request.storage_uri,
            request.lock_uri,
            request.mapping,
            request.num_shards,
        )
        .with_default_search_field(search_field);
        let shards = meta.shards.len();
        self.metastore.set_index_metadata(name, meta).await?;
        info!("[METASTORE] created index {} with {} shard(s)", name, shards);
        self.metastore.get_index_metadata(name)
    }

    /// Remove the index metadata, close local handles, then drop shard
    /// storage. Storage removal is best effort.
    pub async fn delete_index(&self, name: &str) -> Result<()> {
        let meta = self.metastore.get_index_metadata(name)?;
        self.metastore.delete_index_metadata(name).await?;
        self.reconcile().await;
        for shard in meta.shards.values() {
            if let Err(e) = self.factory.remove(&shard.shard_uri).await {
                warn!("[METASTORE] removing storage of {}/{} failed: {}", name, shard.name, e);
            }
        }
        info!("[METASTORE] deleted index {}", name);
        Ok(())
    }

    // ── writes ──────────────────────────────────────────────────────────

    /// Add or replace documents. A root call (`shard == None`) routes every
    /// document to its owning shard; a pinned call writes locally.
    pub async fn add_documents(
        self: &Arc<Self>,
        index: &str,
        shard: Option<&str>,
        documents: Vec<Document>,
    ) -> Result<usize> {
        let meta = self.metastore.get_index_metadata(index)?;
        if let Some(shard) = shard {
            meta.shard(shard)?;
            return self.write_local(index, shard, WriteBatch::Add(documents)).await;
        }
        if documents.is_empty() {
            return Ok(0);
        }

        let mut batches: BTreeMap<ShardName, Vec<Document>> = BTreeMap::new();
        for doc in documents {
            let shard = self.metastore.get_responsible_shard(index, &doc.id)?;
            batches.entry(shard).or_default().push(doc);
        }
        let batches = batches
            .into_iter()
            .map(|(shard, docs)| (shard, WriteBatch::Add(docs)))
            .collect();
        self.fanout_write(index, batches).await
    }

    /// Delete by id. A root call sends the id list to every shard's indexer.
    pub async fn delete_documents(
        self: &Arc<Self>,
        index: &str,
        shard: Option<&str>,
        ids: Vec<DocumentId>,
    ) -> Result<usize> {
        let meta = self.metastore.get_index_metadata(index)?;
        if let Some(shard) = shard {
            meta.shard(shard)?;
            return self.write_local(index, shard, WriteBatch::Delete(ids)).await;
        }
        if ids.is_empty() {
            return Ok(0);
        }

        let requested = ids.len();
        let batches = meta
            .shard_names()
            .into_iter()
            .map(|shard| (shard, WriteBatch::Delete(ids.clone())))
            .collect();
        self.fanout_write(index, batches).await?;
        Ok(requested)
    }

    /// Dispatch every batch concurrently under one deadline. The first
    /// failure aborts the outstanding dispatches and is returned.
    async fn fanout_write(
        self: &Arc<Self>,
        index: &str,
        batches: Vec<(ShardName, WriteBatch)>,
    ) -> Result<usize> {
        let table = self.assignments().await;
        let mut targeted = Vec::with_capacity(batches.len());
        for (shard, batch) in batches {
            let node = table
                .indexer(index, &shard)
                .ok_or_else(|| GriddleError::NoNodeAvailable {
                    index: index.to_string(),
                    shard: shard.clone(),
                })?
                .to_string();
            targeted.push((node, shard, batch));
        }

        let mut set = JoinSet::new();
        for (node, shard, batch) in targeted {
            let this = Arc::clone(self);
            let index = index.to_string();
            set.spawn(async move { this.dispatch_write(&index, &shard, &node, batch).await });
        }

        let deadline = self.config.fanout_timeout();
        let outcome = tokio::time::timeout(deadline, async {
            let mut total = 0;
            while let Some(joined) = set.join_next().await {
                total += joined
                    .map_err(|e| GriddleError::Io(format!("write task failed: {}", e)))??;
            }
            Ok::<_, GriddleError>(total)
        })
        .await;

        match outcome {
            Ok(Ok(total)) => Ok(total),
            Ok(Err(e)) => {
                warn!("[WRITE {}] fanout failed, aborting remaining dispatches: {}", index, e);
                Err(e)
            }
            Err(_) => {
                warn!("[WRITE {}] fanout exceeded {:?}", index, deadline);
                Err(GriddleError::Timeout(format!(
                    "write fanout on {} exceeded {:?}",
                    index, deadline
                )))
            }
        }
    }

    async fn dispatch_write(
        self: &Arc<Self>,
        index: &str,
        shard: &str,
        node: &str,
        batch: WriteBatch,
    ) -> Result<usize> {
        if node == self.local_name() {
            return self.write_local(index, shard, batch).await;
        }
        debug!(
            "[WRITE {}/{}] forwarding {} op(s) to {}",
            index,
            shard,
            batch.len(),
            node
        );
        let peer = self.peer(node).await?;
        match batch {
            WriteBatch::Add(docs) => peer.add_documents(index, shard, docs).await,
            WriteBatch::Delete(ids) => peer.delete_documents(index, shard, ids).await,
        }
    }

    /// Apply a batch to the local writer and bump the shard version so
    /// readers everywhere reopen. Runs as its own task: once started, the
    /// commit and the version bump complete even if the caller is dropped.
    async fn write_local(
        self: &Arc<Self>,
        index: &str,
        shard: &str,
        batch: WriteBatch,
    ) -> Result<usize> {
        let this = Arc::clone(self);
        let (index, shard) = (index.to_string(), shard.to_string());
        tokio::spawn(async move { this.commit_batch(&index, &shard, batch).await })
            .await
            .map_err(|e| GriddleError::Io(format!("write task failed: {}", e)))?
    }

    async fn commit_batch(&self, index: &str, shard: &str, batch: WriteBatch) -> Result<usize> {
        let writer = self.writers.get(index, shard).await?;
        let count = match batch {
            WriteBatch::Add(docs) => writer.add_documents(&docs).await?,
            WriteBatch::Delete(ids) => writer.delete_documents(&ids).await?,
        };
        let version = self.metastore.touch_shard_metadata(index, shard).await?;
        debug!("[WRITE {}/{}] {} op(s), version {}", index, shard, count, version);
        Ok(count)
    }

    // ── search ──────────────────────────────────────────────────────────

    /// Root requests fan out to one random replica per shard, then merge and
    /// paginate. Shard-pinned requests run locally and return the raw
    /// partial. Unreachable groups are logged and left out of the result.
    pub async fn search(self: &Arc<Self>, request: SearchRequest) -> Result<SearchResponse> {
        let meta = self.metastore.get_index_metadata(&request.index_name)?;
        validate_request(&meta, &request)?;
        let index = request.index_name.clone();

        if !request.is_root() {
            for shard in &request.shard_names {
                meta.shard(shard)?;
            }
            return self.search_local(request).await;
        }

        let table = self.assignments().await;
        let mut groups: BTreeMap<NodeName, Vec<ShardName>> = BTreeMap::new();
        {
            let mut rng = rand::thread_rng();
            for shard in meta.shard_names() {
                match table.searchers(&index, &shard).choose(&mut rng) {
                    Some(node) => groups.entry(node.clone()).or_default().push(shard),
                    None => warn!("[SEARCH {}] no searcher for shard {}, skipping", index, shard),
                }
            }
        }
        if groups.is_empty() {
            return Err(GriddleError::NoNodeAvailable {
                index,
                shard: meta.shard_names().into_iter().next().unwrap_or_default(),
            });
        }

        let mut set = JoinSet::new();
        for (node, shards) in groups {
            let this = Arc::clone(self);
            let derived = request.for_shards(shards);
            set.spawn(async move {
                let result = this.dispatch_search(&node, derived).await;
                (node, result)
            });
        }

        let mut partials = Vec::new();
        let mut last_error = None;
        let deadline = self.config.fanout_timeout();
        let finished = tokio::time::timeout(deadline, async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, Ok(partial))) => partials.push(partial),
                    Ok((node, Err(e))) => {
                        warn!("[SEARCH {}] {} failed, merging without it: {}", index, node, e);
                        last_error = Some(e);
                    }
                    Err(e) => warn!("[SEARCH {}] search task failed: {}", index, e),
                }
            }
        })
        .await;
        if finished.is_err() {
            warn!(
                "[SEARCH {}] deadline {:?} exceeded, merging {} partial(s)",
                index,
                deadline,
                partials.len()
            );
            last_error.get_or_insert(GriddleError::Timeout(format!("search on {}", index)));
        }

        if partials.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        let merged = merge_responses(&request, partials);
        Ok(finalize(&request, merged))
    }

    async fn dispatch_search(&self, node: &str, request: SearchRequest) -> Result<SearchResponse> {
        if node == self.local_name() {
            return self.search_local(request).await;
        }
        debug!(
            "[SEARCH {}] forwarding {} shard(s) to {}",
            request.index_name,
            request.shard_names.len(),
            node
        );
        self.peer(node).await?.search(&request).await
    }

    async fn search_local(&self, request: SearchRequest) -> Result<SearchResponse> {
        let mut readers = Vec::with_capacity(request.shard_names.len());
        for shard in &request.shard_names {
            readers.push(self.readers.get(&request.index_name, shard).await?);
        }
        griddle::shard::search_local(readers, request).await
    }

    // ── observability and shutdown ──────────────────────────────────────

    pub async fn cluster(&self) -> ClusterSnapshot {
        let table = self.assignments().await;
        let handles = |list: Vec<(String, String, i64)>| {
            list.into_iter()
                .map(|(index_name, shard_name, version)| OpenHandle {
                    index_name,
                    shard_name,
                    version,
                })
                .collect()
        };
        ClusterSnapshot {
            local_node: self.local_name().to_string(),
            ready: self.is_ready(),
            members: self.membership.members(),
            indexers: table.indexers.clone(),
            searchers: table.searchers.clone(),
            writers: handles(self.writers.list().await),
            readers: handles(self.readers.list().await),
            peers: self.peers.read().await.keys().cloned().collect(),
        }
    }

    /// Stop reconciling and gossiping and release every handle, without
    /// announcing a leave.
    pub async fn halt(&self) {
        let _ = self.shutdown.send(true);
        self.membership.stop();
        self.close_handles().await;
    }

    /// Announce the leave, stop, and release every handle.
    pub async fn shutdown(&self, leave_timeout: Duration) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.membership.leave(leave_timeout).await {
            warn!("[GOSSIP] leave failed: {}", e);
        }
        self.close_handles().await;
    }

    async fn close_handles(&self) {
        if let Err(e) = self.writers.close_all().await {
            warn!("[RECONCILE] closing writers on shutdown: {}", e);
        }
        if let Err(e) = self.readers.close_all().await {
            warn!("[RECONCILE] closing readers on shutdown: {}", e);
        }
        self.ready.store(false, Ordering::SeqCst);
    }
}

fn triggers_reconcile(event: &MetastoreEvent) -> bool {
    matches!(
        event.kind,
        MetastoreEventKind::PutShard | MetastoreEventKind::DeleteShard
    )
}

fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) {
    loop {
        match rx.try_recv() {
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InMemoryNetwork;
    use crate::types::Role;
    use griddle::mapping::{FieldType, IndexMapping};
    use serde_json::json;

    async fn single_node(name: &str) -> Arc<Orchestrator> {
        node_with_roles(name, &[Role::Indexer, Role::Searcher]).await
    }

    async fn node_with_roles(name: &str, roles: &[Role]) -> Arc<Orchestrator> {
        let network = InMemoryNetwork::new();
        let metastore = Metastore::open(&format!("mem://{}", name)).await.unwrap();
        let mut config = NodeConfig::default();
        config.node_name = name.to_string();
        config.gossip_interval_ms = 20;
        config.roles = roles.iter().copied().collect();
        let node = Orchestrator::new(config, metastore, DirectoryFactory::new(), network.node_network())
            .unwrap();
        network.register(&node);
        node.start().await;
        wait_until(|| node.is_ready()).await;
        node
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..250 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    async fn wait_for_hits(node: &Arc<Orchestrator>, request: SearchRequest, hits: u64) -> SearchResponse {
        for _ in 0..250 {
            if let Ok(resp) = node.search(request.clone()).await {
                if resp.hits == hits {
                    return resp;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("search never reached {} hits", hits);
    }

    fn products(shards: usize) -> CreateIndexRequest {
        CreateIndexRequest {
            storage_uri: "mem://products".into(),
            mapping: IndexMapping::default()
                .with_field("title", FieldType::Text)
                .with_field("price", FieldType::Numeric),
            num_shards: shards,
            ..Default::default()
        }
    }

    async fn wait_for_writers(node: &Arc<Orchestrator>, n: usize) {
        for _ in 0..250 {
            if node.writers().len().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("writers never reached {}", n);
    }

    #[tokio::test]
    async fn create_opens_handles_and_rejects_duplicates() {
        let node = single_node("orch-create").await;
        let meta = node.create_index("products", products(3)).await.unwrap();
        assert_eq!(meta.shards.len(), 3);

        wait_for_writers(&node, 3).await;
        assert_eq!(node.readers().len().await, 3);

        let err = node.create_index("products", products(1)).await.unwrap_err();
        assert!(matches!(err, GriddleError::IndexAlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_validates_input() {
        let node = single_node("orch-validate").await;
        assert!(matches!(
            node.create_index("_bad", products(1)).await,
            Err(GriddleError::InvalidIndexName(_))
        ));
        let mut req = products(1);
        req.storage_uri = "s3://bucket/products".into();
        assert!(matches!(
            node.create_index("products", req).await,
            Err(GriddleError::UnsupportedBackend(_))
        ));
        let mut req = products(1);
        req.default_search_field = Some("price".into());
        assert!(node.create_index("products", req).await.is_err());
    }

    #[tokio::test]
    async fn add_search_delete_roundtrip() {
        let node = single_node("orch-roundtrip").await;
        node.create_index("products", products(4)).await.unwrap();
        wait_for_writers(&node, 4).await;

        let docs: Vec<Document> = (0..20)
            .map(|i| Document::new(format!("doc-{}", i), json!({"title": "red laptop", "price": i as f64})))
            .collect();
        assert_eq!(node.add_documents("products", None, docs).await.unwrap(), 20);

        let resp = wait_for_hits(&node, SearchRequest::new("products", "laptop"), 20).await;
        assert_eq!(resp.documents.len(), 10);

        let mut by_price = SearchRequest::new("products", "");
        by_price.sort_by = "-price".into();
        by_price.start = 2;
        by_price.num = 3;
        let resp = wait_for_hits(&node, by_price, 20).await;
        let ids: Vec<&str> = resp.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["doc-17", "doc-16", "doc-15"]);

        let deleted = node
            .delete_documents("products", None, vec!["doc-0".into(), "doc-1".into()])
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        wait_for_hits(&node, SearchRequest::new("products", ""), 18).await;
    }

    #[tokio::test]
    async fn writes_bump_shard_versions() {
        let node = single_node("orch-versions").await;
        let meta = node.create_index("products", products(2)).await.unwrap();
        wait_for_writers(&node, 2).await;

        let doc = Document::new("a", json!({"title": "x"}));
        let shard = node.metastore().get_responsible_shard("products", "a").unwrap();
        let before = meta.shard(&shard).unwrap().version;
        node.add_documents("products", None, vec![doc]).await.unwrap();
        let after = node.metastore().get_shard_metadata("products", &shard).unwrap().version;
        assert!(after > before);
    }

    #[tokio::test]
    async fn errors_surface_to_caller() {
        let node = single_node("orch-errors").await;
        assert!(matches!(
            node.search(SearchRequest::new("missing", "")).await,
            Err(GriddleError::IndexNotFound(_))
        ));

        node.create_index("products", products(1)).await.unwrap();
        wait_for_writers(&node, 1).await;
        assert!(matches!(
            node.search(SearchRequest::new("products", "title:(")).await,
            Err(GriddleError::InvalidQuery(_))
        ));

        let bad = Document::new("a", json!({"price": "free"}));
        assert!(matches!(
            node.add_documents("products", None, vec![bad]).await,
            Err(GriddleError::InvalidDocument(_))
        ));

        assert!(matches!(
            node.add_documents("products", Some("shard-nope"), vec![]).await,
            Err(GriddleError::ShardNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn search_without_searchers_is_unavailable() {
        let node = node_with_roles("orch-no-searchers", &[Role::Indexer]).await;
        node.create_index("products", products(2)).await.unwrap();
        wait_for_writers(&node, 2).await;
        assert!(node.readers().is_empty().await);
        assert!(matches!(
            node.search(SearchRequest::new("products", "")).await,
            Err(GriddleError::NoNodeAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn delete_index_closes_handles() {
        let node = single_node("orch-delete").await;
        node.create_index("products", products(2)).await.unwrap();
        wait_for_writers(&node, 2).await;

        node.delete_index("products").await.unwrap();
        assert!(node.writers().is_empty().await);
        assert!(node.readers().is_empty().await);
        assert!(matches!(
            node.delete_index("products").await,
            Err(GriddleError::IndexNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cluster_snapshot_reports_local_state() {
        let node = single_node("orch-snapshot").await;
        node.create_index("products", products(2)).await.unwrap();
        wait_for_writers(&node, 2).await;

        let snapshot = node.cluster().await;
        assert_eq!(snapshot.local_node, "orch-snapshot");
        assert!(snapshot.ready);
        assert_eq!(snapshot.members.len(), 1);
        assert_eq!(snapshot.indexers["products"].len(), 2);
        assert!(snapshot.indexers["products"].values().all(|n| n == "orch-snapshot"));
        assert_eq!(snapshot.writers.len(), 2);
        assert!(snapshot.peers.is_empty());
    }

    #[test]
    fn only_shard_events_trigger() {
        assert!(triggers_reconcile(&MetastoreEvent::shard(
            MetastoreEventKind::PutShard,
            "i",
            "s"
        )));
        assert!(!triggers_reconcile(&MetastoreEvent::index(
            MetastoreEventKind::PutIndex,
            "i"
        )));
    }
}
