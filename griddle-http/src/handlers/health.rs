use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use super::AppState;

/// Liveness probe: the process is up and serving HTTP.
pub async fn livez(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "node": state.orchestrator.local_name(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness probe: 200 once the metastore is hydrated and the first
/// reconciliation pass has completed, 503 before that and after shutdown.
pub async fn readyz(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let ready = state.orchestrator.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(serde_json::json!({ "ready": ready })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{body_json, ready_state};
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/livez", get(livez))
            .route("/readyz", get(readyz))
            .with_state(state)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn livez_includes_version() {
        let state = ready_state("http-livez").await;
        let resp = app(state).oneshot(get_req("/livez")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["node"], "http-livez");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert!(json["uptime_secs"].as_u64().is_some());
    }

    #[tokio::test]
    async fn readyz_follows_orchestrator() {
        let state = ready_state("http-readyz").await;
        let resp = app(state.clone()).oneshot(get_req("/readyz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        state.orchestrator.shutdown(Duration::from_millis(100)).await;
        let resp = app(state).oneshot(get_req("/readyz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["ready"], false);
    }
}
