//! Griddle: the storage-side core of a sharded full-text search cluster.
//!
//! This crate holds everything a node needs that does not depend on the
//! network: the error taxonomy, wire types, the rendezvous ring used for
//! placement, the metastore, per-node shard handle pools, local shard search
//! and the scatter-gather result merge. Cluster membership and the
//! orchestrator live in `griddle-cluster`.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use griddle::metastore::{IndexMetadata, Metastore};
//! use griddle::mapping::IndexMapping;
//!
//! # async fn run() -> griddle::Result<()> {
//! let metastore = Metastore::open("mem://quickstart").await?;
//! let meta = IndexMetadata::new("products", "mem://products", "", IndexMapping::default(), 2);
//! metastore.set_index_metadata("products", meta).await?;
//! let shard = metastore.get_responsible_shard("products", "doc-1")?;
//! # let _ = shard;
//! # Ok(())
//! # }
//! ```

pub mod directory;
pub mod error;
pub mod lock;
pub mod mapping;
pub mod merge;
pub mod metastore;
pub mod ring;
pub mod shard;
pub mod types;

pub use error::{GriddleError, Result};
pub use types::{
    AggregationRequest, AggregationResponse, Document, IndexName, SearchHit, SearchRequest,
    SearchResponse, ShardName, SortBy, SortOrder,
};

/// Current wall-clock time in nanoseconds since the Unix epoch.
///
/// Used for mapping and shard version stamps.
pub fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| chrono::Utc::now().timestamp_micros().saturating_mul(1000))
}
