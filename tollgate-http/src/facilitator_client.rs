//! A [`Facilitator`] that talks to a remote x402 facilitator over HTTP.
//!
//! [`FacilitatorClient`] calls `POST ./verify`, `POST ./settle` and
//! `GET ./supported` relative to a base URL. Capability lists change rarely,
//! so `/supported` answers are cached for a configurable TTL.

use std::fmt::Display;
use std::time::{Duration, Instant};

use http::{HeaderMap, HeaderValue, StatusCode, header};
use reqwest::Client;
use tokio::sync::RwLock;
use tollgate::proto::{
    SettleRequest, SettleResponse, SupportedResponse, VerifyRequest, VerifyResponse,
};
use tollgate::{BoxFuture, Facilitator, FacilitatorError};
use tracing::{Instrument, Span, field};
use url::Url;

/// Default public facilitator.
pub const DEFAULT_FACILITATOR_URL: &str = "https://x402.org/facilitator";

#[derive(Clone, Debug)]
struct CachedSupported {
    response: SupportedResponse,
    expires_at: Instant,
}

/// TTL cache for the `/supported` response.
///
/// Each clone starts empty.
#[derive(Debug)]
pub struct SupportedCache {
    ttl: Duration,
    state: RwLock<Option<CachedSupported>>,
}

impl SupportedCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(None),
        }
    }

    /// Returns the cached response while it is fresh.
    pub async fn get(&self) -> Option<SupportedResponse> {
        let guard = self.state.read().await;
        let cached = guard.as_ref()?;
        (Instant::now() < cached.expires_at).then(|| cached.response.clone())
    }

    /// Stores a response for one TTL.
    pub async fn set(&self, response: SupportedResponse) {
        *self.state.write().await = Some(CachedSupported {
            response,
            expires_at: Instant::now() + self.ttl,
        });
    }

    /// Drops the cached response.
    pub async fn clear(&self) {
        *self.state.write().await = None;
    }
}

impl Clone for SupportedCache {
    fn clone(&self) -> Self {
        Self::new(self.ttl)
    }
}

/// Errors talking to a remote facilitator.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    /// An endpoint URL could not be built.
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        /// What was being parsed.
        context: &'static str,
        /// The parse error.
        #[source]
        source: url::ParseError,
    },
    /// A header value is not valid HTTP.
    #[error("Invalid header value: {context}")]
    InvalidHeader {
        /// Which header.
        context: &'static str,
    },
    /// The request could not be sent or timed out.
    #[error("HTTP error: {context}: {source}")]
    Http {
        /// The endpoint, e.g. `POST /verify`.
        context: &'static str,
        /// The transport error.
        #[source]
        source: reqwest::Error,
    },
    /// A 200 answer whose body is not the expected JSON.
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        /// The endpoint.
        context: &'static str,
        /// The decode error.
        #[source]
        source: reqwest::Error,
    },
    /// A non-200 answer.
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        /// The endpoint.
        context: &'static str,
        /// The status received.
        status: StatusCode,
        /// The response body, for diagnostics.
        body: String,
    },
    /// The body of a non-200 answer could not be read.
    #[error("Failed to read response body as text: {context}: {source}")]
    ResponseBodyRead {
        /// The endpoint.
        context: &'static str,
        /// The read error.
        #[source]
        source: reqwest::Error,
    },
}

impl From<FacilitatorClientError> for FacilitatorError {
    fn from(err: FacilitatorClientError) -> Self {
        Self::with_source("facilitator request failed", err)
    }
}

/// Client for a remote x402 facilitator.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    base_url: Url,
    verify_url: Url,
    settle_url: Url,
    supported_url: Url,
    client: Client,
    headers: HeaderMap,
    timeout: Option<Duration>,
    supported_cache: SupportedCache,
}

impl FacilitatorClient {
    /// Default `/supported` cache TTL.
    pub const DEFAULT_SUPPORTED_CACHE_TTL: Duration = Duration::from_secs(600);

    /// Creates a client; endpoint URLs are joined onto `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError::UrlParse`] if an endpoint URL cannot
    /// be built.
    pub fn try_new(base_url: Url) -> Result<Self, FacilitatorClientError> {
        let join = |path: &str, context: &'static str| {
            base_url
                .join(path)
                .map_err(|source| FacilitatorClientError::UrlParse { context, source })
        };
        let verify_url = join("./verify", "Failed to construct ./verify URL")?;
        let settle_url = join("./settle", "Failed to construct ./settle URL")?;
        let supported_url = join("./supported", "Failed to construct ./supported URL")?;
        Ok(Self {
            client: Client::new(),
            base_url,
            verify_url,
            settle_url,
            supported_url,
            headers: HeaderMap::new(),
            timeout: None,
            supported_cache: SupportedCache::new(Self::DEFAULT_SUPPORTED_CACHE_TTL),
        })
    }

    /// The base URL.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The `./verify` endpoint.
    #[must_use]
    pub const fn verify_url(&self) -> &Url {
        &self.verify_url
    }

    /// The `./settle` endpoint.
    #[must_use]
    pub const fn settle_url(&self) -> &Url {
        &self.settle_url
    }

    /// The `./supported` endpoint.
    #[must_use]
    pub const fn supported_url(&self) -> &Url {
        &self.supported_url
    }

    /// Headers sent with every request.
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The per-request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sends `headers` with every request.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Authenticates every request with `Authorization: Bearer <api_key>`.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError::InvalidHeader`] if the key contains
    /// characters not allowed in a header.
    pub fn with_api_key(mut self, api_key: &str) -> Result<Self, FacilitatorClientError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
            FacilitatorClientError::InvalidHeader {
                context: "Authorization",
            }
        })?;
        value.set_sensitive(true);
        self.headers.insert(header::AUTHORIZATION, value);
        Ok(self)
    }

    /// Sets a per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the `/supported` cache TTL.
    #[must_use]
    pub fn with_supported_cache_ttl(mut self, ttl: Duration) -> Self {
        self.supported_cache = SupportedCache::new(ttl);
        self
    }

    /// Fetches `/supported` on every call.
    #[must_use]
    pub fn without_supported_cache(self) -> Self {
        self.with_supported_cache_ttl(Duration::ZERO)
    }

    /// `POST /verify`.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError`] on transport failure, a non-200
    /// status or an undecodable body.
    pub async fn verify(
        &self,
        request: &VerifyRequest,
    ) -> Result<VerifyResponse, FacilitatorClientError> {
        self.send(
            self.client.post(self.verify_url.clone()).json(request),
            "POST /verify",
        )
        .instrument(tracing::info_span!(
            "tollgate.facilitator_client.verify",
            timeout = ?self.timeout,
            otel.status_code = field::Empty,
            error.message = field::Empty,
        ))
        .await
    }

    /// `POST /settle`.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError`] on transport failure, a non-200
    /// status or an undecodable body.
    pub async fn settle(
        &self,
        request: &SettleRequest,
    ) -> Result<SettleResponse, FacilitatorClientError> {
        self.send(
            self.client.post(self.settle_url.clone()).json(request),
            "POST /settle",
        )
        .instrument(tracing::info_span!(
            "tollgate.facilitator_client.settle",
            timeout = ?self.timeout,
            otel.status_code = field::Empty,
            error.message = field::Empty,
        ))
        .await
    }

    /// `GET /supported`, served from the cache while it is fresh.
    ///
    /// # Errors
    ///
    /// Returns [`FacilitatorClientError`] on a cache miss that fails.
    pub async fn supported(&self) -> Result<SupportedResponse, FacilitatorClientError> {
        if let Some(response) = self.supported_cache.get().await {
            return Ok(response);
        }
        tracing::debug!("supported cache miss");
        let response = self.supported_uncached().await?;
        self.supported_cache.set(response.clone()).await;
        Ok(response)
    }

    async fn supported_uncached(&self) -> Result<SupportedResponse, FacilitatorClientError> {
        self.send(
            self.client.get(self.supported_url.clone()),
            "GET /supported",
        )
        .instrument(tracing::info_span!(
            "tollgate.facilitator_client.supported",
            timeout = ?self.timeout,
            otel.status_code = field::Empty,
            error.message = field::Empty,
        ))
        .await
    }

    async fn send<R>(
        &self,
        mut request: reqwest::RequestBuilder,
        context: &'static str,
    ) -> Result<R, FacilitatorClientError>
    where
        R: serde::de::DeserializeOwned,
    {
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|source| FacilitatorClientError::Http { context, source })?;

        let result = if response.status() == StatusCode::OK {
            response
                .json::<R>()
                .await
                .map_err(|source| FacilitatorClientError::JsonDeserialization { context, source })
        } else {
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|source| FacilitatorClientError::ResponseBodyRead { context, source })?;
            Err(FacilitatorClientError::HttpStatus {
                context,
                status,
                body,
            })
        };
        record_result_on_span(&result);
        result
    }
}

impl Facilitator for FacilitatorClient {
    fn verify<'a>(
        &'a self,
        request: &'a VerifyRequest,
    ) -> BoxFuture<'a, Result<VerifyResponse, FacilitatorError>> {
        Box::pin(async move { Ok(Self::verify(self, request).await?) })
    }

    fn settle<'a>(
        &'a self,
        request: &'a SettleRequest,
    ) -> BoxFuture<'a, Result<SettleResponse, FacilitatorError>> {
        Box::pin(async move { Ok(Self::settle(self, request).await?) })
    }

    fn supported(&self) -> BoxFuture<'_, Result<SupportedResponse, FacilitatorError>> {
        Box::pin(async move { Ok(Self::supported(self).await?) })
    }
}

/// Parses a base URL, normalizing it to exactly one trailing slash so that
/// `./verify` joins below it.
impl TryFrom<&str> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut normalized = value.trim_end_matches('/').to_owned();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|source| FacilitatorClientError::UrlParse {
            context: "Failed to parse base url",
            source,
        })?;
        Self::try_new(url)
    }
}

impl TryFrom<String> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

fn record_result_on_span<R, E: Display>(result: &Result<R, E>) {
    let span = Span::current();
    match result {
        Ok(_) => {
            span.record("otel.status_code", "OK");
        }
        Err(err) => {
            span.record("otel.status_code", "ERROR");
            span.record("error.message", field::display(err));
            tracing::error!(error = %err, "request to facilitator failed");
        }
    }
}
