use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GriddleError {
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Shard not found: {index}/{shard}")]
    ShardNotFound { index: String, shard: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Shard handle not open on this node: {index}/{shard}")]
    HandleNotOpen { index: String, shard: String },

    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("Failed to acquire lock: {0}")]
    LockFailed(String),

    #[error("Already locked: {0}")]
    AlreadyLocked(String),

    #[error("Lock does not exist: {0}")]
    LockDoesNotExist(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    #[error("Invalid index name: {0}")]
    InvalidIndexName(String),

    #[error("Invalid mapping: {0}")]
    InvalidMapping(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("No node available for {index}/{shard}")]
    NoNodeAvailable { index: String, shard: String },

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("Tantivy error: {0}")]
    Tantivy(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GriddleError>;

impl From<std::io::Error> for GriddleError {
    fn from(e: std::io::Error) -> Self {
        GriddleError::Io(e.to_string())
    }
}

impl From<tantivy::TantivyError> for GriddleError {
    fn from(e: tantivy::TantivyError) -> Self {
        GriddleError::Tantivy(e.to_string())
    }
}

impl From<tantivy::query::QueryParserError> for GriddleError {
    fn from(e: tantivy::query::QueryParserError) -> Self {
        GriddleError::InvalidQuery(e.to_string())
    }
}

impl From<serde_json::Error> for GriddleError {
    fn from(e: serde_json::Error) -> Self {
        GriddleError::Json(e.to_string())
    }
}

impl GriddleError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GriddleError::IndexNotFound(_) => StatusCode::NOT_FOUND,
            GriddleError::ShardNotFound { .. } => StatusCode::NOT_FOUND,
            GriddleError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            GriddleError::HandleNotOpen { .. } => StatusCode::NOT_FOUND,
            GriddleError::IndexAlreadyExists(_) => StatusCode::CONFLICT,
            GriddleError::LockFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            GriddleError::AlreadyLocked(_) => StatusCode::CONFLICT,
            GriddleError::LockDoesNotExist(_) => StatusCode::CONFLICT,
            GriddleError::InvalidUri(_) => StatusCode::BAD_REQUEST,
            GriddleError::UnsupportedBackend(_) => StatusCode::BAD_REQUEST,
            GriddleError::InvalidIndexName(_) => StatusCode::BAD_REQUEST,
            GriddleError::InvalidMapping(_) => StatusCode::BAD_REQUEST,
            GriddleError::InvalidDocument(_) => StatusCode::BAD_REQUEST,
            GriddleError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            GriddleError::NoNodeAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GriddleError::Rpc(_) => StatusCode::BAD_GATEWAY,
            GriddleError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GriddleError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GriddleError::S3(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GriddleError::Tantivy(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GriddleError::Json(_) => StatusCode::BAD_REQUEST,
            GriddleError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GriddleError::IndexNotFound(_) => "index_not_found",
            GriddleError::ShardNotFound { .. } => "shard_not_found",
            GriddleError::NodeNotFound(_) => "node_not_found",
            GriddleError::HandleNotOpen { .. } => "handle_not_open",
            GriddleError::IndexAlreadyExists(_) => "index_already_exists",
            GriddleError::LockFailed(_) => "lock_failed",
            GriddleError::AlreadyLocked(_) => "already_locked",
            GriddleError::LockDoesNotExist(_) => "lock_does_not_exist",
            GriddleError::InvalidUri(_) => "invalid_uri",
            GriddleError::UnsupportedBackend(_) => "unsupported_backend",
            GriddleError::InvalidIndexName(_) => "invalid_index_name",
            GriddleError::InvalidMapping(_) => "invalid_mapping",
            GriddleError::InvalidDocument(_) => "invalid_document",
            GriddleError::InvalidQuery(_) => "invalid_query",
            GriddleError::NoNodeAvailable { .. } => "no_node_available",
            GriddleError::Rpc(_) => "rpc_error",
            GriddleError::Timeout(_) => "timeout",
            GriddleError::Io(_) => "io_error",
            GriddleError::S3(_) => "s3_error",
            GriddleError::Tantivy(_) => "internal_error",
            GriddleError::Json(_) => "json_error",
            GriddleError::Config(_) => "config_error",
        }
    }

    /// Rebuild an error from a peer's HTTP error response.
    ///
    /// Only the classes a caller may act on are recovered; anything else
    /// becomes `Rpc` so forwarded failures stay visible.
    pub fn from_remote(status: StatusCode, code: Option<&str>, message: String) -> Self {
        match code {
            Some("invalid_query") => GriddleError::InvalidQuery(message),
            Some("invalid_document") => GriddleError::InvalidDocument(message),
            Some("index_not_found") => GriddleError::IndexNotFound(message),
            Some("index_already_exists") => GriddleError::IndexAlreadyExists(message),
            Some("already_locked") => GriddleError::AlreadyLocked(message),
            Some("lock_failed") => GriddleError::LockFailed(message),
            _ if status == StatusCode::GATEWAY_TIMEOUT => GriddleError::Timeout(message),
            _ => GriddleError::Rpc(format!("peer returned {}: {}", status, message)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == StatusCode::NOT_FOUND
    }
}


// Axum IntoResponse implementation (feature-gated)
#[cfg(feature = "axum-support")]
use axum::response::{IntoResponse, Json, Response};
#[cfg(feature = "axum-support")]
use serde::Serialize;

#[cfg(feature = "axum-support")]
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub request_id: String,
}

#[cfg(feature = "axum-support")]
impl IntoResponse for GriddleError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_response = ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
            request_id: format!("req_gd_{}", uuid::Uuid::new_v4()),
        };
        let mut response = (status, Json(error_response)).into_response();
        if matches!(&self, GriddleError::NoNodeAvailable { .. }) {
            response
                .headers_mut()
                .insert("Retry-After", http::HeaderValue::from_static("1"));
        }
        response
    }
}
