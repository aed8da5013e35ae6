//! The axum front of the proxy.
//!
//! `GET /health` answers locally. Every other path and method goes through the
//! [`HookPipeline`] to `upstream_url + path + query`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tollgate::Facilitator;
use tollgate_http::FacilitatorClient;
use tollgate_mcp::hook::Hook;
use tollgate_mcp::{
    HookPipeline, LoggingHook, PaymentGate, ProxyRequest, ProxyResponse, Upstream, X402Hook,
};
use tower_http::cors;
use tower_http::trace::TraceLayer;
use url::Url;

use crate::config::{FacilitatorSettings, ProxyConfig};
use crate::error::ProxyError;
use crate::hooks::ForwardHeadersHook;
use crate::upstream::HttpUpstream;

/// Largest request body the proxy buffers.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Shared state of the proxy handler.
#[derive(Debug, Clone)]
pub struct ProxyState {
    pipeline: Arc<HookPipeline>,
    upstream_url: Arc<Url>,
}

impl ProxyState {
    /// Creates the state.
    #[must_use]
    pub fn new(pipeline: HookPipeline, upstream_url: Url) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            upstream_url: Arc::new(upstream_url),
        }
    }
}

/// Builds the remote facilitator client from the `[facilitator]` table.
///
/// # Errors
///
/// Returns [`ProxyError::Facilitator`] for a bad URL or API key.
pub fn facilitator_client(settings: &FacilitatorSettings) -> Result<FacilitatorClient, ProxyError> {
    let mut client = FacilitatorClient::try_from(settings.url.as_str())?
        .with_supported_cache_ttl(settings.supported_cache_ttl());
    if let Some(timeout) = settings.timeout() {
        client = client.with_timeout(timeout);
    }
    if let Some(api_key) = settings.api_key.as_deref() {
        client = client.with_api_key(api_key)?;
    }
    Ok(client)
}

/// Composes the hook list `[LoggingHook, ForwardHeadersHook, X402Hook]` over
/// the given collaborators.
///
/// # Errors
///
/// Returns [`ProxyError`] if the forward headers or payment config are invalid.
pub fn build_pipeline(
    config: &ProxyConfig,
    facilitator: Arc<dyn Facilitator>,
    upstream: Arc<dyn Upstream>,
) -> Result<HookPipeline, ProxyError> {
    let gate = PaymentGate::new(config.payment.clone(), facilitator)?;
    let forward_headers = ForwardHeadersHook::from_config(&config.forward_headers)?;

    tracing::info!(
        priced_tools = gate.config().prices.len(),
        networks = ?gate.config().networks,
        forward_headers = forward_headers.len(),
        "Payment gate ready"
    );

    let hooks: Vec<Arc<dyn Hook>> = vec![
        Arc::new(LoggingHook::new()),
        Arc::new(forward_headers),
        Arc::new(X402Hook::new(Arc::new(gate))),
    ];
    let pipeline = HookPipeline::new(hooks, upstream);
    Ok(match &config.server_id {
        Some(server_id) => pipeline.with_server_id(server_id.clone()),
        None => pipeline,
    })
}

/// Builds the router for the given state.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(proxy)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers(cors::Any)
                .expose_headers(cors::Any),
        )
}

/// Loads collaborators from `config`, binds, and serves until shutdown.
///
/// # Errors
///
/// Returns [`ProxyError`] if the pipeline cannot be built or the listener fails.
pub async fn run(config: ProxyConfig) -> Result<(), ProxyError> {
    tracing::info!(
        host = %config.host,
        port = config.port,
        upstream = %config.upstream_url,
        facilitator = %config.facilitator.url,
        "Loaded configuration"
    );

    let facilitator: Arc<dyn Facilitator> = Arc::new(facilitator_client(&config.facilitator)?);
    let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(
        std::time::Duration::from_secs(config.upstream_timeout_secs),
    ));
    let pipeline = build_pipeline(&config, facilitator, upstream)?;
    let app = router(ProxyState::new(pipeline, config.upstream_url.clone()));

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Proxy listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Proxy shut down gracefully");
    Ok(())
}

/// Health check endpoint.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn proxy(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(uri = %parts.uri, error = %e, "Failed to read request body");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": "Failed to read request body", "details": e.to_string() })),
            )
                .into_response();
        }
    };

    let response = state
        .pipeline
        .handle(ProxyRequest {
            method: parts.method,
            original_url: parts.uri.to_string(),
            target_url: target_url(&state.upstream_url, &parts.uri),
            headers: parts.headers,
            body,
        })
        .await;
    into_response(response)
}

fn into_response(response: ProxyResponse) -> Response {
    let ProxyResponse {
        status,
        headers,
        body,
    } = response;
    let mut out = Response::new(Body::from(body));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

/// Appends the request path and query to the upstream base.
///
/// A request for `/` goes to the base URL itself, so an `upstream_url` that
/// already names the MCP endpoint can be reached at the proxy root.
fn target_url(base: &Url, uri: &Uri) -> String {
    let mut target = base.as_str().trim_end_matches('/').to_owned();
    let path = uri.path();
    if path != "/" {
        target.push_str(path);
    }
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }
    target
}

/// Waits for Ctrl-C or SIGTERM (Unix) to initiate graceful shutdown.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            () = ctrl_c => tracing::info!("Received Ctrl-C, shutting down..."),
            () = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        tracing::info!("Received Ctrl-C, shutting down...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAYEE: &str = "0x209693Bc6afc0C5328bA36FaF03C514EF312287C";

    fn config(upstream: &str, facilitator: &str) -> ProxyConfig {
        ProxyConfig::from_toml(&format!(
            r#"
            upstream_url = "{upstream}"
            server_id = "test-server"

            [forward_headers]
            x-upstream-key = "k"

            [facilitator]
            url = "{facilitator}"

            [payment]
            networks = ["base-sepolia"]

            [payment.recipient.evm]
            address = "{PAYEE}"

            [payment.prices]
            forecast = "$0.01"
            "#
        ))
        .unwrap()
    }

    async fn app(upstream: &MockServer, facilitator: &MockServer) -> Router {
        let config = config(&upstream.uri(), &facilitator.uri());
        let facilitator: Arc<dyn Facilitator> =
            Arc::new(facilitator_client(&config.facilitator).unwrap());
        let http: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(Duration::from_secs(5)));
        let pipeline = build_pipeline(&config, facilitator, http).unwrap();
        router(ProxyState::new(pipeline, config.upstream_url))
    }

    fn tool_call(name: &str) -> Request {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": { "name": name, "arguments": {} }
        });
        http::Request::builder()
            .method(Method::POST)
            .uri("/mcp")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let upstream = MockServer::start().await;
        let facilitator = MockServer::start().await;
        let response = app(&upstream, &facilitator)
            .await
            .oneshot(
                http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_unpriced_tool_is_forwarded() {
        let upstream = MockServer::start().await;
        let facilitator = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("x-upstream-key", "k"))
            .and(header_exists("x-request-id"))
            .and(body_partial_json(json!({ "params": { "name": "echo" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 7,
                "result": { "content": [{ "type": "text", "text": "hi" }] }
            })))
            .expect(1)
            .mount(&upstream)
            .await;

        let response = app(&upstream, &facilitator)
            .await
            .oneshot(tool_call("echo"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["id"], 7);
        assert_eq!(body["result"]["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn test_priced_tool_without_payment_never_reaches_upstream() {
        let upstream = MockServer::start().await;
        let facilitator = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&upstream)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&facilitator)
            .await;

        let response = app(&upstream, &facilitator)
            .await
            .oneshot(tool_call("forecast"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["result"]["isError"], true);
        let error = &body["result"]["_meta"]["x402/error"];
        assert_eq!(error["error"], "PAYMENT_REQUIRED");
        assert_eq!(error["accepts"][0]["network"], "base-sepolia");
        assert_eq!(error["accepts"][0]["payTo"], PAYEE);
        assert_eq!(error["accepts"][0]["maxAmountRequired"], "10000");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let facilitator = MockServer::start().await;
        let config = config("http://127.0.0.1:9", &facilitator.uri());
        let http: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(Duration::from_secs(2)));
        let facilitator: Arc<dyn Facilitator> =
            Arc::new(facilitator_client(&config.facilitator).unwrap());
        let pipeline = build_pipeline(&config, facilitator, http).unwrap();
        let response = router(ProxyState::new(pipeline, config.upstream_url))
            .oneshot(tool_call("echo"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Bad Gateway");
    }

    #[test]
    fn test_target_url() {
        let base = Url::parse("http://localhost:3000").unwrap();
        assert_eq!(
            target_url(&base, &"/mcp?session=1".parse().unwrap()),
            "http://localhost:3000/mcp?session=1"
        );
        let base = Url::parse("http://localhost:3000/mcp").unwrap();
        assert_eq!(target_url(&base, &"/".parse().unwrap()), "http://localhost:3000/mcp");
        assert_eq!(
            target_url(&base, &"/messages".parse().unwrap()),
            "http://localhost:3000/mcp/messages"
        );
    }

    #[test]
    fn test_invalid_forward_header_fails_startup() {
        let mut config = config("http://localhost:3000", "http://localhost:4021");
        config
            .forward_headers
            .insert("bad header".to_owned(), "v".to_owned());
        let facilitator: Arc<dyn Facilitator> =
            Arc::new(facilitator_client(&config.facilitator).unwrap());
        let http: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(Duration::from_secs(1)));
        let err = build_pipeline(&config, facilitator, http).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidHeader { .. }));
    }
}
