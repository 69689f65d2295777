use axum::{
    extract::{Path, State},
    Json,
};
use griddle::{Document, GriddleError};
use griddle_cluster::types::WriteResponse;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::AppState;

/// PUT /v1/indexes/:index/documents
///
/// Body is a JSON array of flat objects, each carrying `id` (or `_id`).
/// An existing document with the same id is replaced.
pub async fn add_documents(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    Json(body): Json<Vec<serde_json::Value>>,
) -> Result<Json<WriteResponse>, GriddleError> {
    let documents = body
        .iter()
        .map(Document::from_json)
        .collect::<Result<Vec<_>, _>>()?;
    let count = state
        .orchestrator
        .add_documents(&index, None, documents)
        .await?;
    state
        .usage_for(&index)
        .documents_indexed
        .fetch_add(count as u64, Ordering::Relaxed);
    Ok(Json(WriteResponse {
        index_name: index,
        count,
    }))
}

/// DELETE /v1/indexes/:index/documents
///
/// Body is a JSON array of document ids. Unknown ids are ignored.
pub async fn delete_documents(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    Json(ids): Json<Vec<String>>,
) -> Result<Json<WriteResponse>, GriddleError> {
    let count = state
        .orchestrator
        .delete_documents(&index, None, ids)
        .await?;
    state
        .usage_for(&index)
        .documents_deleted
        .fetch_add(count as u64, Ordering::Relaxed);
    Ok(Json(WriteResponse {
        index_name: index,
        count,
    }))
}
