use axum::{extract::State, Json};
use griddle_cluster::ClusterSnapshot;
use std::sync::Arc;

use super::AppState;

/// GET /v1/cluster
///
/// Membership, the current assignment table and the handles open on this node.
pub async fn cluster(State(state): State<Arc<AppState>>) -> Json<ClusterSnapshot> {
    Json(state.orchestrator.cluster().await)
}
