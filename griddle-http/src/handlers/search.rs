use axum::{
    extract::{Path, State},
    Json,
};
use griddle::{GriddleError, SearchResponse};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use super::AppState;
use crate::dto::SearchParams;

/// POST /v1/indexes/:index/_search
pub async fn search(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    body: Option<Json<SearchParams>>,
) -> Result<Json<SearchResponse>, GriddleError> {
    let params = body.map(|Json(p)| p).unwrap_or_default();
    let request = params.into_request(&index);
    let started = Instant::now();

    let response = state.orchestrator.search(request).await?;
    tracing::debug!(
        "[SEARCH {}] {} hit(s) in {}ms",
        index,
        response.hits,
        started.elapsed().as_millis()
    );
    state
        .usage_for(&index)
        .search_count
        .fetch_add(1, Ordering::Relaxed);
    Ok(Json(response))
}
