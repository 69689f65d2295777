use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use griddle::directory::DirectoryFactory;
use griddle::metastore::Metastore;
use griddle_cluster::{NodeConfig, NodeNetwork, Orchestrator};
use std::future::IntoFuture;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::handlers::{self, AppState};

const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Client-facing API served on `http_port`.
pub fn public_router(state: Arc<AppState>) -> Router {
    let max_body_mb: usize = std::env::var("GRIDDLE_MAX_BODY_MB")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(100);

    Router::new()
        .route(
            "/v1/indexes/:index",
            put(handlers::create_index).delete(handlers::delete_index),
        )
        .route(
            "/v1/indexes/:index/documents",
            put(handlers::add_documents).delete(handlers::delete_documents),
        )
        .route("/v1/indexes/:index/_search", post(handlers::search))
        .route("/v1/cluster", get(handlers::cluster))
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_body_mb * 1024 * 1024))
        .layer(CorsLayer::very_permissive().max_age(Duration::from_secs(86400)))
        .layer(TraceLayer::new_for_http())
}

/// Node-to-node API served on `rpc_port`: gossip and shard-pinned forwarding.
pub fn internal_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/internal/gossip", post(handlers::internal::gossip))
        .route(
            "/internal/indexes/:index/documents",
            post(handlers::internal::add_documents),
        )
        .route(
            "/internal/indexes/:index/documents/delete",
            post(handlers::internal::delete_documents),
        )
        .route(
            "/internal/indexes/:index/_search",
            post(handlers::internal::search),
        )
        .route("/livez", get(handlers::livez))
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
}

pub async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = std::env::var("GRIDDLE_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    std::fs::create_dir_all(&data_dir)?;
    let config = NodeConfig::load_or_default(Path::new(&data_dir));
    config.validate()?;

    let metastore = Metastore::open(&config.metastore_uri).await?;
    tracing::info!(
        "[METASTORE] {} hydrated with {} index(es)",
        config.metastore_uri,
        metastore.index_names().len()
    );

    let rpc_bind = config.rpc_bind();
    let http_bind = config.http_bind();
    let orchestrator = Orchestrator::new(
        config,
        metastore,
        DirectoryFactory::new(),
        NodeNetwork::http(),
    )?;
    let state = AppState::new(Arc::clone(&orchestrator));

    // Bind both listeners before joining so peers can gossip back at once.
    let rpc_listener = tokio::net::TcpListener::bind(&rpc_bind).await?;
    let http_listener = tokio::net::TcpListener::bind(&http_bind).await?;
    let (stop_tx, stop_rx) = watch::channel(false);

    let rpc_server = tokio::spawn(
        axum::serve(rpc_listener, internal_router(Arc::clone(&state)))
            .with_graceful_shutdown(wait_for(stop_rx.clone()))
            .into_future(),
    );
    let http_server = tokio::spawn(
        axum::serve(http_listener, public_router(Arc::clone(&state)))
            .with_graceful_shutdown(wait_for(stop_rx))
            .into_future(),
    );

    orchestrator.start().await;
    tracing::info!(
        "griddle node {} serving API on {} and RPC on {}",
        orchestrator.local_name(),
        http_bind,
        rpc_bind
    );

    shutdown_signal().await;
    tracing::info!("shutting down {}", orchestrator.local_name());
    orchestrator.shutdown(LEAVE_TIMEOUT).await;
    let _ = stop_tx.send(true);

    for (name, server) in [("rpc", rpc_server), ("http", http_server)] {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("{} listener failed: {}", name, e),
            Err(e) => tracing::error!("{} listener task failed: {}", name, e),
        }
    }
    Ok(())
}

async fn wait_for(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
