//! Node-to-node endpoints served on the RPC listener.
//!
//! Forwarded writes and searches arrive shard-pinned and are executed
//! locally; they are never re-routed.

use crate::handlers::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use griddle::{GriddleError, SearchRequest, SearchResponse};
use griddle_cluster::types::{
    AddDocumentsRequest, DeleteDocumentsRequest, GossipMessage, WriteResponse,
};
use std::sync::Arc;

/// POST /internal/gossip
pub async fn gossip(
    State(state): State<Arc<AppState>>,
    Json(message): Json<GossipMessage>,
) -> Json<GossipMessage> {
    Json(state.orchestrator.membership().handle_gossip(message))
}

/// POST /internal/indexes/:index/documents
pub async fn add_documents(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    Json(body): Json<AddDocumentsRequest>,
) -> Result<Json<WriteResponse>, GriddleError> {
    let shard = pinned_shard(&index, body.shard_name.as_deref())?;
    let count = state
        .orchestrator
        .add_documents(&index, Some(shard), body.documents)
        .await?;
    tracing::debug!("[WRITE {}/{}] applied {} forwarded document(s)", index, shard, count);
    Ok(Json(WriteResponse {
        index_name: index,
        count,
    }))
}

/// POST /internal/indexes/:index/documents/delete
pub async fn delete_documents(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    Json(body): Json<DeleteDocumentsRequest>,
) -> Result<Json<WriteResponse>, GriddleError> {
    let shard = pinned_shard(&index, body.shard_name.as_deref())?;
    let count = state
        .orchestrator
        .delete_documents(&index, Some(shard), body.ids)
        .await?;
    Ok(Json(WriteResponse {
        index_name: index,
        count,
    }))
}

/// POST /internal/indexes/:index/_search
///
/// Returns the unfinalized partial for the requested shards.
pub async fn search(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    Json(mut request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, GriddleError> {
    request.index_name = index;
    if request.is_root() {
        return Err(GriddleError::InvalidQuery(
            "forwarded search carries no shard names".to_string(),
        ));
    }
    Ok(Json(state.orchestrator.search(request).await?))
}

fn pinned_shard<'a>(index: &str, shard: Option<&'a str>) -> Result<&'a str, GriddleError> {
    shard.ok_or_else(|| GriddleError::ShardNotFound {
        index: index.to_string(),
        shard: String::new(),
    })
}
