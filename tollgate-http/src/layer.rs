//! Transport-level x402 enforcement for an MCP server without a proxy hop.
//!
//! [`X402TransportLayer`] wraps the server's own HTTP service. For a priced
//! `tools/call` it verifies the `X-PAYMENT` header before the handler runs,
//! buffers the handler's whole response into a [`BufferedResponse`], settles,
//! splices the receipt into the JSON-RPC reply and only then builds the
//! response the client sees.
//!
//! Unlike the pipeline hook, a call carrying no `X-PAYMENT` header at all is
//! answered with a real `402 Payment Required`.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/mcp", post(mcp_handler))
//!     .layer(X402TransportLayer::new(gate));
//! ```

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum_core::body::Body;
use axum_core::extract::Request;
use axum_core::response::Response;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tollgate::proto;
use tollgate_mcp::hook::McpRequest;
use tollgate_mcp::payment::{Authorization, GateRejection, PaymentGate, SettlementOutcome};
use tollgate_mcp::wire::{self, Message, UpstreamBody};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};
use uuid::Uuid;

/// Request header carrying the base64 payment payload.
pub const X_PAYMENT_HEADER: &str = "X-PAYMENT";

/// Response header carrying the base64 settlement response.
pub const X_PAYMENT_RESPONSE_HEADER: &str = "X-PAYMENT-RESPONSE";

/// A fully read HTTP response, held until settlement decides its final shape.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    /// Status code.
    pub status: StatusCode,
    /// Headers.
    pub headers: HeaderMap,
    /// Complete body.
    pub body: Bytes,
}

impl BufferedResponse {
    /// Reads a response body to the end.
    ///
    /// # Errors
    ///
    /// Returns the body error if the stream fails.
    pub async fn collect(response: Response) -> Result<Self, axum_core::Error> {
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(Self {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    /// The `content-type` header.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.headers.remove(header::CONTENT_LENGTH);
        self
    }

    /// Builds the response.
    #[must_use]
    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Tower layer enforcing x402 payment on priced `tools/call` requests.
#[derive(Debug, Clone)]
pub struct X402TransportLayer {
    gate: Arc<PaymentGate>,
}

impl X402TransportLayer {
    /// Creates the layer.
    #[must_use]
    pub const fn new(gate: Arc<PaymentGate>) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for X402TransportLayer
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = X402TransportService;

    fn layer(&self, inner: S) -> Self::Service {
        X402TransportService {
            gate: Arc::clone(&self.gate),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// Service produced by [`X402TransportLayer`].
#[derive(Clone)]
pub struct X402TransportService {
    gate: Arc<PaymentGate>,
    inner: Inner,
}

impl fmt::Debug for X402TransportService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X402TransportService")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl Service<Request> for X402TransportService {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let gate = Arc::clone(&self.gate);
        let inner = self.inner.clone();
        Box::pin(async move { Ok(enforce(&gate, inner, req).await) })
    }
}

type Inner = BoxCloneSyncService<Request, Response, Infallible>;

async fn call_inner(inner: Inner, req: Request) -> Response {
    match inner.oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

async fn enforce(gate: &PaymentGate, inner: Inner, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read request body");
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({ "error": "Bad Request", "details": e.to_string() }),
            );
        }
    };

    let Message::Call {
        id, method, params, ..
    } = wire::parse_message(&bytes)
    else {
        return call_inner(inner, Request::from_parts(parts, Body::from(bytes))).await;
    };
    let request = McpRequest::new(method, params);
    let Some(tool) = request.tool_name().filter(|_| request.method == "tools/call") else {
        return call_inner(inner, Request::from_parts(parts, Body::from(bytes))).await;
    };
    let Some(price) = gate.price(tool) else {
        return call_inner(inner, Request::from_parts(parts, Body::from(bytes))).await;
    };

    let request_id = Uuid::new_v4().to_string();
    let accepts = gate.requirements(tool, price).await;
    let token = parts
        .headers
        .get(X_PAYMENT_HEADER)
        .map(|v| Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()));

    let context = match gate
        .authorize_against(tool, accepts, token.as_ref(), &request_id)
        .await
    {
        Authorization::Free => {
            return call_inner(inner, Request::from_parts(parts, Body::from(bytes))).await;
        }
        Authorization::Rejected(rejection) if rejection.is_payment_required() => {
            tracing::debug!(request_id = %request_id, tool, "no X-PAYMENT header, answering 402");
            return payment_required(&rejection);
        }
        Authorization::Rejected(rejection) => return rejected(&id, &rejection),
        Authorization::Authorized(context) => context,
    };

    let response = call_inner(inner, Request::from_parts(parts, Body::from(bytes))).await;
    let buffered = match BufferedResponse::collect(response).await {
        Ok(buffered) => buffered,
        Err(e) => {
            tracing::error!(request_id = %request_id, error = %e, "handler response body failed, payment not settled");
            return json_response(
                StatusCode::BAD_GATEWAY,
                &json!({ "error": "Bad Gateway", "details": e.to_string() }),
            );
        }
    };

    if !buffered.status.is_success() {
        tracing::info!(
            request_id = %request_id,
            status = %buffered.status,
            "handler replied with a non-success status, payment not settled"
        );
        return buffered.into_response();
    }

    let result = match wire::decode_upstream(buffered.content_type(), &buffered.body) {
        UpstreamBody::Result(result) => result,
        UpstreamBody::Error(_) | UpstreamBody::Unparsed => {
            tracing::info!(request_id = %request_id, "handler did not return a tool result, payment not settled");
            return buffered.into_response();
        }
    };
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        tracing::info!(request_id = %request_id, tool, "tool reported an error, payment discarded without settling");
        return buffered.into_response();
    }

    if let Err(rejection) = gate.verify(&context).await {
        return rejected(&id, &rejection);
    }

    match gate.settle(context, result).await {
        SettlementOutcome::Skipped(_) => buffered.into_response(),
        SettlementOutcome::Settled { result, response } => {
            let mut buffered = splice(buffered, &wire::wrap_result(&id, result));
            match proto::encode_settle_header(&response)
                .ok()
                .and_then(|encoded| HeaderValue::from_str(&encoded).ok())
            {
                Some(value) => {
                    buffered.headers.insert(X_PAYMENT_RESPONSE_HEADER, value);
                }
                None => tracing::warn!(request_id = %request_id, "settlement response is not a valid header"),
            }
            buffered.into_response()
        }
        SettlementOutcome::Failed { result, .. } => {
            splice(buffered, &wire::wrap_result(&id, result)).into_response()
        }
    }
}

/// Writes `message` back into the buffered reply, keeping its framing.
fn splice(buffered: BufferedResponse, message: &Value) -> BufferedResponse {
    let text = message.to_string();
    if wire::is_event_stream(buffered.content_type()) {
        let rewritten = std::str::from_utf8(&buffered.body)
            .ok()
            .and_then(|stream| wire::replace_last_sse_data(stream, &text));
        if let Some(stream) = rewritten {
            return buffered.with_body(stream);
        }
    }
    let mut buffered = buffered.with_body(text);
    buffered.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    buffered
}

fn payment_required(rejection: &GateRejection) -> Response {
    let body = serde_json::to_value(&rejection.payment_required).unwrap_or_default();
    json_response(StatusCode::PAYMENT_REQUIRED, &body)
}

fn rejected(id: &Value, rejection: &GateRejection) -> Response {
    json_response(StatusCode::OK, &wire::wrap_result(id, rejection.to_value()))
}

fn json_response(status: StatusCode, body: &Value) -> Response {
    BufferedResponse {
        status,
        headers: HeaderMap::from_iter([(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )]),
        body: Bytes::from(body.to_string()),
    }
    .into_response()
}
