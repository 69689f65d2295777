use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use griddle::GriddleError;
use griddle_cluster::CreateIndexRequest;
use std::sync::Arc;

use super::AppState;
use crate::dto::{CreateIndexResponse, DeleteIndexResponse};

/// PUT /v1/indexes/:index
pub async fn create_index(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    Json(body): Json<CreateIndexRequest>,
) -> Result<(StatusCode, Json<CreateIndexResponse>), GriddleError> {
    let meta = state.orchestrator.create_index(&index, body).await?;
    Ok((StatusCode::CREATED, Json(CreateIndexResponse::from(meta.as_ref()))))
}

/// DELETE /v1/indexes/:index
pub async fn delete_index(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
) -> Result<Json<DeleteIndexResponse>, GriddleError> {
    state.orchestrator.delete_index(&index).await?;
    state.usage.remove(&index);
    Ok(Json(DeleteIndexResponse {
        name: index,
        deleted: true,
    }))
}
