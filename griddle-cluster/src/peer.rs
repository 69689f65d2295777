use crate::types::{AddDocumentsRequest, DeleteDocumentsRequest, GossipMessage, WriteResponse};
use async_trait::async_trait;
use griddle::{Document, GriddleError, Result, SearchRequest, SearchResponse};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Error body every griddle node returns.
#[derive(Debug, Deserialize)]
struct RemoteError {
    error: Option<String>,
    message: Option<String>,
}

/// Shard-pinned operations a node forwards to the owner of a shard.
#[async_trait]
pub trait ShardRpc: Send + Sync {
    fn addr(&self) -> &str;

    async fn add_documents(&self, index: &str, shard: &str, documents: Vec<Document>)
        -> Result<usize>;

    async fn delete_documents(&self, index: &str, shard: &str, ids: Vec<String>) -> Result<usize>;

    /// `request.shard_names` is set; the answer is an unfinalized partial.
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse>;
}

/// Builds a [`ShardRpc`] client for a peer's `host:rpc_port`.
pub trait PeerConnector: Send + Sync {
    fn connect(&self, addr: &str) -> Arc<dyn ShardRpc>;
}

pub struct HttpConnector;

impl PeerConnector for HttpConnector {
    fn connect(&self, addr: &str) -> Arc<dyn ShardRpc> {
        Arc::new(PeerClient::new(addr))
    }
}

/// HTTP client for one peer's internal RPC listener.
pub struct PeerClient {
    addr: String,
    base_url: String,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient").field("addr", &self.addr).finish()
    }
}

impl PeerClient {
    /// `addr` is `host:port`; a full `http://` base URL is accepted too.
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr)
        };
        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        PeerClient {
            addr,
            base_url,
            http_client,
        }
    }

    pub async fn gossip(&self, message: &GossipMessage) -> Result<GossipMessage> {
        let url = format!("{}/internal/gossip", self.base_url);
        self.post(&url, message).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, url: &str, body: &B) -> Result<T> {
        let response = self
            .http_client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let (code, message) = match serde_json::from_str::<RemoteError>(&text) {
                Ok(err) => (err.error, err.message.unwrap_or(text)),
                Err(_) => (None, text),
            };
            let status = http::StatusCode::from_u16(status.as_u16())
                .unwrap_or(http::StatusCode::BAD_GATEWAY);
            return Err(GriddleError::from_remote(status, code.as_deref(), message));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GriddleError::Rpc(format!("bad response from {}: {}", self.addr, e)))
    }

    fn transport_error(&self, e: reqwest::Error) -> GriddleError {
        if e.is_timeout() {
            GriddleError::Timeout(format!("request to {} timed out", self.addr))
        } else {
            GriddleError::Rpc(format!("request to {} failed: {}", self.addr, e))
        }
    }
}

#[async_trait]
impl ShardRpc for PeerClient {
    fn addr(&self) -> &str {
        &self.addr
    }

    async fn add_documents(
        &self,
        index: &str,
        shard: &str,
        documents: Vec<Document>,
    ) -> Result<usize> {
        let url = format!("{}/internal/indexes/{}/documents", self.base_url, index);
        let body = AddDocumentsRequest {
            shard_name: Some(shard.to_string()),
            documents,
        };
        let resp: WriteResponse = self.post(&url, &body).await?;
        Ok(resp.count)
    }

    async fn delete_documents(&self, index: &str, shard: &str, ids: Vec<String>) -> Result<usize> {
        let url = format!("{}/internal/indexes/{}/documents/delete", self.base_url, index);
        let body = DeleteDocumentsRequest {
            shard_name: Some(shard.to_string()),
            ids,
        };
        let resp: WriteResponse = self.post(&url, &body).await?;
        Ok(resp.count)
    }

    /// Shard-pinned search; the peer returns an unfinalized partial.
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let url = format!("{}/internal/indexes/{}/_search", self.base_url, request.index_name);
        self.post(&url, request).await
    }
}
