//! The `reqwest` forwarder to the proxied MCP server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tollgate_mcp::{PipelineError, ProxyResponse, Upstream, UpstreamRequest};

/// Forwards pipeline requests over HTTP.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    timeout: Duration,
}

impl HttpUpstream {
    /// Creates a forwarder with a per-request timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self::with_client(Client::new(), timeout)
    }

    /// Creates a forwarder around an existing client.
    #[must_use]
    pub const fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, request: UpstreamRequest) -> Result<ProxyResponse, PipelineError> {
        let UpstreamRequest {
            method,
            url,
            headers,
            body,
        } = request;

        tracing::debug!(%method, %url, bytes = body.len(), "forwarding upstream");
        let response = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| PipelineError::upstream("Failed to reach upstream", e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| PipelineError::upstream("Failed to read upstream body", e))?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}
