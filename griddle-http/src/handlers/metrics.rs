//! Prometheus `/metrics` endpoint.
//!
//! Node-wide gauges (membership, open handles, readiness) and per-index
//! request counters in Prometheus text exposition format.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::AppState;

/// GET /metrics
///
/// Gauges are populated on each request from live orchestrator state.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = Registry::new();
    let gathered = match populate(&registry, &state).await {
        Ok(()) => registry.gather(),
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("metrics registry error: {}", e),
            )
                .into_response()
        }
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&gathered, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encode error: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

async fn populate(registry: &Registry, state: &AppState) -> prometheus::Result<()> {
    let orch = &state.orchestrator;

    register_gauge(
        registry,
        "griddle_ready",
        "Whether the node has completed its first reconciliation (1=yes, 0=no)",
        if orch.is_ready() { 1.0 } else { 0.0 },
    )?;
    register_gauge(
        registry,
        "griddle_cluster_members",
        "Number of live cluster members as seen by this node",
        orch.membership().members().len() as f64,
    )?;
    register_gauge(
        registry,
        "griddle_indexes",
        "Number of indexes in the metastore",
        orch.metastore().index_names().len() as f64,
    )?;
    register_gauge(
        registry,
        "griddle_open_writers",
        "Shard writers open on this node",
        orch.writers().len().await as f64,
    )?;
    register_gauge(
        registry,
        "griddle_open_readers",
        "Shard readers open on this node",
        orch.readers().len().await as f64,
    )?;

    // --- Per-index handle counts ---
    {
        let writers = per_index_counts(orch.writers().list().await);
        let readers = per_index_counts(orch.readers().list().await);
        let writer_gauge = GaugeVec::new(
            Opts::new("griddle_index_writers", "Shard writers open per index"),
            &["index"],
        )?;
        let reader_gauge = GaugeVec::new(
            Opts::new("griddle_index_readers", "Shard readers open per index"),
            &["index"],
        )?;
        registry.register(Box::new(writer_gauge.clone()))?;
        registry.register(Box::new(reader_gauge.clone()))?;
        for (index, n) in writers {
            writer_gauge.with_label_values(&[&index]).set(n as f64);
        }
        for (index, n) in readers {
            reader_gauge.with_label_values(&[&index]).set(n as f64);
        }
    }

    // --- Per-index usage counters ---
    {
        let search_gauge = GaugeVec::new(
            Opts::new("griddle_search_requests_total", "Total search requests per index"),
            &["index"],
        )?;
        let indexed_gauge = GaugeVec::new(
            Opts::new(
                "griddle_documents_indexed_total",
                "Total documents indexed per index",
            ),
            &["index"],
        )?;
        let deleted_gauge = GaugeVec::new(
            Opts::new(
                "griddle_documents_deleted_total",
                "Total documents deleted per index",
            ),
            &["index"],
        )?;
        registry.register(Box::new(search_gauge.clone()))?;
        registry.register(Box::new(indexed_gauge.clone()))?;
        registry.register(Box::new(deleted_gauge.clone()))?;

        for entry in state.usage.iter() {
            let idx = entry.key();
            let counters = entry.value();
            search_gauge
                .with_label_values(&[idx])
                .set(counters.search_count.load(Ordering::Relaxed) as f64);
            indexed_gauge
                .with_label_values(&[idx])
                .set(counters.documents_indexed.load(Ordering::Relaxed) as f64);
            deleted_gauge
                .with_label_values(&[idx])
                .set(counters.documents_deleted.load(Ordering::Relaxed) as f64);
        }
    }

    Ok(())
}

fn per_index_counts(handles: Vec<(String, String, i64)>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for (index, _, _) in handles {
        *counts.entry(index).or_insert(0) += 1;
    }
    counts
}

fn register_gauge(registry: &Registry, name: &str, help: &str, value: f64) -> prometheus::Result<()> {
    let gauge = prometheus::Gauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    gauge.set(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::ready_state;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn scrape(state: Arc<AppState>) -> String {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(state);
        let resp = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn reports_node_gauges() {
        let state = ready_state("http-metrics").await;
        let text = scrape(state).await;
        assert!(text.contains("griddle_ready 1"));
        assert!(text.contains("griddle_cluster_members 1"));
        assert!(text.contains("griddle_open_writers 0"));
    }

    #[tokio::test]
    async fn reports_usage_per_index() {
        let state = ready_state("http-metrics-usage").await;
        state
            .usage_for("products")
            .search_count
            .fetch_add(4, Ordering::Relaxed);
        let text = scrape(state).await;
        assert!(text.contains("griddle_search_requests_total{index=\"products\"} 4"));
    }

    #[test]
    fn handle_counts_group_by_index() {
        let counts = per_index_counts(vec![
            ("a".into(), "shard-1".into(), 1),
            ("a".into(), "shard-2".into(), 1),
            ("b".into(), "shard-3".into(), 1),
        ]);
        assert_eq!(counts["a"], 2);
        assert_eq!(counts["b"], 1);
    }
}
