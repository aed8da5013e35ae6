//! The hook pipeline engine.
//!
//! [`HookPipeline::handle`] takes one proxied HTTP request, runs it through
//! the declared hook slots, forwards it to the [`Upstream`] and re-emits the
//! answer. The flow for a JSON-RPC call is:
//!
//! 1. Request slots run in list order. Any of them may answer the call
//!    (`Respond`, `ContinueAsync`), reject it (`Abort`, `tools/call` only) or
//!    rewrite it.
//! 2. The request is forwarded. Unless a hook rewrote it, the client's
//!    original body bytes are sent unchanged.
//! 3. The upstream reply is decoded (JSON-RPC envelope, bare result, or SSE).
//!    Undecodable replies skip the hooks and go back verbatim.
//! 4. Response slots (or error slots, for a JSON-RPC error) run in reverse
//!    list order. A `tools/call` result slot may ask for one retry of the
//!    whole call.
//! 5. The result is re-wrapped as `{jsonrpc, id, result}` and sent with
//!    `content-type: application/json`.
//!
//! Notifications are shown to observers and forwarded untouched.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{
    CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderName,
    TRANSFER_ENCODING,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde_json::{Map, Value, json};

use crate::error::{HookError, PipelineError};
use crate::hook::{
    Abort, Hook, McpMethod, McpRequest, Notification, RequestAction, RequestExtra,
    ToolCallAction, ToolResultAction,
};
use crate::wire::{self, INTERNAL_ERROR, Message, UpstreamBody};

/// Extra attempts a `tools/call` may get from a `Retry` result action.
pub const TOOL_CALL_RETRY_BUDGET: usize = 1;

const HOP_HEADERS: [HeaderName; 5] = [
    CONTENT_LENGTH,
    HOST,
    CONNECTION,
    TRANSFER_ENCODING,
    CONTENT_ENCODING,
];

/// An inbound HTTP request handed to the pipeline.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// HTTP method.
    pub method: Method,
    /// URL the client called.
    pub original_url: String,
    /// URL to forward to.
    pub target_url: String,
    /// Inbound headers.
    pub headers: HeaderMap,
    /// Raw body.
    pub body: Bytes,
}

/// An HTTP response, from upstream or produced by the pipeline.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    /// Status code.
    pub status: StatusCode,
    /// Headers.
    pub headers: HeaderMap,
    /// Body.
    pub body: Bytes,
}

impl ProxyResponse {
    /// A JSON response with `content-type: application/json`.
    #[must_use]
    pub fn json(status: StatusCode, value: &Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status,
            headers,
            body: Bytes::from(value.to_string()),
        }
    }

    fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

/// A request about to be sent to the upstream MCP server.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// HTTP method.
    pub method: Method,
    /// Target URL.
    pub url: String,
    /// Headers after hygiene and header hooks.
    pub headers: HeaderMap,
    /// Body bytes.
    pub body: Bytes,
}

/// The upstream MCP server.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Sends the request and returns the full response.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Upstream`] when no response was received.
    async fn forward(&self, request: UpstreamRequest) -> Result<ProxyResponse, PipelineError>;
}

#[async_trait]
impl<T: Upstream + ?Sized> Upstream for Arc<T> {
    async fn forward(&self, request: UpstreamRequest) -> Result<ProxyResponse, PipelineError> {
        (**self).forward(request).await
    }
}

#[derive(Default)]
struct DispatchTables {
    request: [Vec<usize>; 8],
    /// Stored in reverse list order.
    response: [Vec<usize>; 8],
    /// Stored in reverse list order.
    error: [Vec<usize>; 8],
    notifications: Vec<usize>,
    headers: Vec<usize>,
}

impl DispatchTables {
    fn build(hooks: &[Arc<dyn Hook>]) -> Self {
        let mut tables = Self::default();
        for (i, hook) in hooks.iter().enumerate() {
            let caps = hook.capabilities();
            for method in McpMethod::ALL {
                if caps.has_request(method) {
                    tables.request[method.index()].push(i);
                }
                if caps.has_response(method) {
                    tables.response[method.index()].push(i);
                }
                if caps.has_error(method) {
                    tables.error[method.index()].push(i);
                }
            }
            if caps.has_notifications() {
                tables.notifications.push(i);
            }
            if caps.has_headers() {
                tables.headers.push(i);
            }
        }
        for slot in tables.response.iter_mut().chain(tables.error.iter_mut()) {
            slot.reverse();
        }
        tables
    }
}

/// One JSON-RPC call being handled.
struct CallContext {
    http_method: Method,
    body: Bytes,
    envelope: Map<String, Value>,
    id: Value,
    original: McpRequest,
}

/// Runs proxied MCP requests through an ordered hook list.
pub struct HookPipeline {
    hooks: Vec<Arc<dyn Hook>>,
    upstream: Arc<dyn Upstream>,
    server_id: Option<String>,
    tables: DispatchTables,
}

impl fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.hooks.iter().map(|h| h.name()).collect();
        f.debug_struct("HookPipeline")
            .field("hooks", &names)
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}

impl HookPipeline {
    /// Creates a pipeline. Hook capabilities are read once, here.
    #[must_use]
    pub fn new(hooks: Vec<Arc<dyn Hook>>, upstream: Arc<dyn Upstream>) -> Self {
        let tables = DispatchTables::build(&hooks);
        Self {
            hooks,
            upstream,
            server_id: None,
            tables,
        }
    }

    /// Sets the server id attached to every [`RequestExtra`].
    #[must_use]
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    /// Handles one proxied request.
    pub async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        let ProxyRequest {
            method: http_method,
            original_url,
            target_url,
            headers,
            body,
        } = request;
        let extra = RequestExtra::new(original_url, target_url, headers, self.server_id.clone());

        match wire::parse_message(&body) {
            Message::Passthrough => {
                tracing::debug!(request_id = %extra.request_id, "passing through non JSON-RPC body");
                self.forward_verbatim(http_method, body, &extra).await
            }
            Message::Notification { method, params } => {
                self.notify(&Notification { method, params }, &extra).await;
                self.forward_verbatim(http_method, body, &extra).await
            }
            Message::Call {
                id,
                method,
                params,
                envelope,
            } => {
                let mcp_method = McpMethod::from_name(&method);
                let ctx = CallContext {
                    http_method,
                    body,
                    envelope,
                    id,
                    original: McpRequest::new(method, params),
                };
                if mcp_method == McpMethod::ToolsCall {
                    self.run_tool_call(&ctx, &extra).await
                } else {
                    self.run_generic(mcp_method, &ctx, &extra).await
                }
            }
        }
    }

    async fn run_generic(
        &self,
        method: McpMethod,
        ctx: &CallContext,
        extra: &RequestExtra,
    ) -> ProxyResponse {
        let mut current = ctx.original.clone();
        for &i in &self.tables.request[method.index()] {
            let hook = &self.hooks[i];
            match hook.on_request(method, current, extra).await {
                Ok(RequestAction::Continue(next)) => current = next,
                Ok(RequestAction::Respond(result)) => return respond(&ctx.id, result),
                Ok(RequestAction::ContinueAsync { request, result }) => {
                    self.forward_detached(ctx, &request, extra).await;
                    return respond(&ctx.id, result);
                }
                Err(e) => return request_hook_failure(&ctx.id, hook.name(), &e, extra),
            }
        }

        let upstream = match self.forward(ctx, &current, extra).await {
            Ok(upstream) => upstream,
            Err(e) => return upstream_failure(&e, extra),
        };
        match decode(&upstream) {
            UpstreamBody::Result(mut result) => {
                for &i in &self.tables.response[method.index()] {
                    let hook = &self.hooks[i];
                    match hook.on_response(method, result.clone(), &current, extra).await {
                        Ok(next) => result = next,
                        Err(e) => response_hook_failure(hook.name(), &e, extra),
                    }
                }
                reemit(&upstream.headers, &wire::wrap_result(&ctx.id, result))
            }
            UpstreamBody::Error(error) => {
                let error = self.run_error_hooks(method, error, &current, extra).await;
                reemit(&upstream.headers, &wire::wrap_error(&ctx.id, error))
            }
            UpstreamBody::Unparsed => verbatim(upstream),
        }
    }

    async fn run_tool_call(&self, ctx: &CallContext, extra: &RequestExtra) -> ProxyResponse {
        let method = McpMethod::ToolsCall;
        let mut retries_left = TOOL_CALL_RETRY_BUDGET;

        'attempt: loop {
            let mut current = ctx.original.clone();
            for &i in &self.tables.request[method.index()] {
                let hook = &self.hooks[i];
                match hook.on_tool_call(current, extra).await {
                    Ok(ToolCallAction::Continue(next)) => current = next,
                    Ok(ToolCallAction::Respond(result)) => return respond(&ctx.id, result),
                    Ok(ToolCallAction::ContinueAsync { request, result }) => {
                        self.forward_detached(ctx, &request, extra).await;
                        return respond(&ctx.id, result);
                    }
                    Ok(ToolCallAction::Abort(abort)) => {
                        return abort_response(hook.name(), abort, extra);
                    }
                    Err(e) => return request_hook_failure(&ctx.id, hook.name(), &e, extra),
                }
            }

            let upstream = match self.forward(ctx, &current, extra).await {
                Ok(upstream) => upstream,
                Err(e) => return upstream_failure(&e, extra),
            };
            match decode(&upstream) {
                UpstreamBody::Result(mut result) => {
                    for &i in &self.tables.response[method.index()] {
                        let hook = &self.hooks[i];
                        match hook.on_tool_result(result.clone(), &current, extra).await {
                            Ok(ToolResultAction::Continue(next)) => result = next,
                            Ok(ToolResultAction::Retry) if retries_left > 0 => {
                                retries_left -= 1;
                                tracing::info!(
                                    request_id = %extra.request_id,
                                    hook = hook.name(),
                                    "retrying tool call"
                                );
                                continue 'attempt;
                            }
                            Ok(ToolResultAction::Retry) => {
                                tracing::warn!(
                                    request_id = %extra.request_id,
                                    hook = hook.name(),
                                    "retry budget exhausted, keeping current result"
                                );
                            }
                            Ok(ToolResultAction::Abort(abort)) => {
                                return abort_response(hook.name(), abort, extra);
                            }
                            Err(e) => response_hook_failure(hook.name(), &e, extra),
                        }
                    }
                    return reemit(&upstream.headers, &wire::wrap_result(&ctx.id, result));
                }
                UpstreamBody::Error(error) => {
                    let error = self.run_error_hooks(method, error, &current, extra).await;
                    return reemit(&upstream.headers, &wire::wrap_error(&ctx.id, error));
                }
                UpstreamBody::Unparsed => return verbatim(upstream),
            }
        }
    }

    async fn run_error_hooks(
        &self,
        method: McpMethod,
        mut error: Value,
        request: &McpRequest,
        extra: &RequestExtra,
    ) -> Value {
        for &i in &self.tables.error[method.index()] {
            let hook = &self.hooks[i];
            match hook.on_error(method, error.clone(), request, extra).await {
                Ok(next) => error = next,
                Err(e) => response_hook_failure(hook.name(), &e, extra),
            }
        }
        error
    }

    async fn notify(&self, notification: &Notification, extra: &RequestExtra) {
        for &i in &self.tables.notifications {
            let hook = &self.hooks[i];
            if let Err(e) = hook.on_notification(notification, extra).await {
                tracing::warn!(
                    request_id = %extra.request_id,
                    hook = hook.name(),
                    method = %notification.method,
                    error = %e,
                    "notification hook failed"
                );
            }
        }
    }

    async fn upstream_headers(&self, extra: &RequestExtra) -> HeaderMap {
        let mut headers = extra.headers.clone();
        for name in &HOP_HEADERS {
            headers.remove(name);
        }
        for &i in &self.tables.headers {
            let hook = &self.hooks[i];
            if let Err(e) = hook.prepare_headers(&mut headers, extra).await {
                tracing::warn!(
                    request_id = %extra.request_id,
                    hook = hook.name(),
                    error = %e,
                    "header hook failed, ignoring"
                );
            }
        }
        headers
    }

    async fn build_upstream_request(
        &self,
        ctx: &CallContext,
        current: &McpRequest,
        extra: &RequestExtra,
    ) -> Result<UpstreamRequest, PipelineError> {
        let body = if *current == ctx.original {
            ctx.body.clone()
        } else {
            let mut envelope = ctx.envelope.clone();
            envelope.insert("method".to_owned(), Value::String(current.method.clone()));
            match &current.params {
                Some(params) => {
                    envelope.insert("params".to_owned(), params.clone());
                }
                None => {
                    envelope.remove("params");
                }
            }
            Bytes::from(serde_json::to_vec(&Value::Object(envelope))?)
        };
        Ok(UpstreamRequest {
            method: ctx.http_method.clone(),
            url: extra.target_url.clone(),
            headers: self.upstream_headers(extra).await,
            body,
        })
    }

    async fn forward(
        &self,
        ctx: &CallContext,
        current: &McpRequest,
        extra: &RequestExtra,
    ) -> Result<ProxyResponse, PipelineError> {
        let request = self.build_upstream_request(ctx, current, extra).await?;
        self.upstream.forward(request).await
    }

    async fn forward_detached(&self, ctx: &CallContext, current: &McpRequest, extra: &RequestExtra) {
        let request = match self.build_upstream_request(ctx, current, extra).await {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(request_id = %extra.request_id, error = %e, "background forward not sent");
                return;
            }
        };
        let upstream = Arc::clone(&self.upstream);
        let request_id = extra.request_id.clone();
        tokio::spawn(async move {
            match upstream.forward(request).await {
                Ok(response) => {
                    tracing::debug!(%request_id, status = %response.status, "background forward completed");
                }
                Err(e) => {
                    tracing::warn!(%request_id, error = %e, "background forward failed");
                }
            }
        });
    }

    async fn forward_verbatim(
        &self,
        method: Method,
        body: Bytes,
        extra: &RequestExtra,
    ) -> ProxyResponse {
        let request = UpstreamRequest {
            method,
            url: extra.target_url.clone(),
            headers: self.upstream_headers(extra).await,
            body,
        };
        match self.upstream.forward(request).await {
            Ok(upstream) => verbatim(upstream),
            Err(e) => upstream_failure(&e, extra),
        }
    }
}

fn decode(upstream: &ProxyResponse) -> UpstreamBody {
    if !upstream.status.is_success() {
        return UpstreamBody::Unparsed;
    }
    wire::decode_upstream(upstream.content_type(), &upstream.body)
}

fn respond(id: &Value, result: Value) -> ProxyResponse {
    ProxyResponse::json(StatusCode::OK, &wire::wrap_result(id, result))
}

fn reemit(upstream_headers: &HeaderMap, envelope: &Value) -> ProxyResponse {
    let mut response = ProxyResponse::json(StatusCode::OK, envelope);
    for (name, value) in upstream_headers {
        if *name == CONTENT_TYPE || HOP_HEADERS.contains(name) {
            continue;
        }
        response.headers.append(name.clone(), value.clone());
    }
    response
}

fn verbatim(mut upstream: ProxyResponse) -> ProxyResponse {
    for name in [CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION] {
        upstream.headers.remove(name);
    }
    upstream
}

fn abort_response(hook: &str, abort: Abort, extra: &RequestExtra) -> ProxyResponse {
    tracing::info!(request_id = %extra.request_id, hook, reason = %abort.reason, "tool call aborted");
    let body = abort
        .body
        .unwrap_or_else(|| json!({ "error": abort.reason }));
    ProxyResponse::json(StatusCode::BAD_REQUEST, &body)
}

fn request_hook_failure(
    id: &Value,
    hook: &str,
    error: &HookError,
    extra: &RequestExtra,
) -> ProxyResponse {
    tracing::error!(request_id = %extra.request_id, hook, error = %error, "request hook failed");
    let message = format!("Hook {hook} failed: {error}");
    ProxyResponse::json(
        StatusCode::OK,
        &wire::wrap_error(id, wire::error_object(INTERNAL_ERROR, &message)),
    )
}

fn response_hook_failure(hook: &str, error: &HookError, extra: &RequestExtra) {
    tracing::warn!(
        request_id = %extra.request_id,
        hook,
        error = %error,
        "response hook failed, skipping it"
    );
}

fn upstream_failure(error: &PipelineError, extra: &RequestExtra) -> ProxyResponse {
    tracing::error!(request_id = %extra.request_id, error = %error, "upstream request failed");
    ProxyResponse::json(
        StatusCode::BAD_GATEWAY,
        &json!({ "error": "Bad Gateway", "details": error.to_string() }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::Capabilities;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tollgate::BoxFuture;

    #[derive(Default)]
    struct FakeUpstream {
        replies: Mutex<VecDeque<Result<ProxyResponse, String>>>,
        seen: Mutex<Vec<UpstreamRequest>>,
    }

    impl FakeUpstream {
        fn replying(replies: Vec<ProxyResponse>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(Ok).collect()),
                seen: Mutex::default(),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::from([Err("connection refused".to_owned())])),
                seen: Mutex::default(),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn request(&self, i: usize) -> UpstreamRequest {
            self.seen.lock().unwrap()[i].clone()
        }
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn forward(&self, request: UpstreamRequest) -> Result<ProxyResponse, PipelineError> {
            self.seen.lock().unwrap().push(request);
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(Ok(response)) => Ok(response),
                Some(Err(e)) => Err(PipelineError::upstream(
                    "fake upstream",
                    std::io::Error::other(e),
                )),
                None => Ok(json_reply(&json!({"jsonrpc": "2.0", "id": 1, "result": {}}))),
            }
        }
    }

    fn json_reply(value: &Value) -> ProxyResponse {
        ProxyResponse::json(StatusCode::OK, value)
    }

    fn sse_reply(data: &str) -> ProxyResponse {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert("mcp-session-id", HeaderValue::from_static("sess-9"));
        ProxyResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(format!("event: message\ndata: {data}\n\n")),
        }
    }

    fn post(body: &str) -> ProxyRequest {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(HOST, HeaderValue::from_static("proxy.local"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));
        ProxyRequest {
            method: Method::POST,
            original_url: "http://proxy.local/mcp".to_owned(),
            target_url: "http://upstream.local/mcp".to_owned(),
            headers,
            body: Bytes::from(body.to_owned()),
        }
    }

    fn body_json(response: &ProxyResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    /// Records slot invocations into a shared log.
    struct Recorder {
        name: &'static str,
        caps: Capabilities,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &'static str, caps: Capabilities, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                caps,
                log: Arc::clone(log),
            })
        }

        fn record(&self, slot: &str) {
            self.log.lock().unwrap().push(format!("{}:{slot}", self.name));
        }
    }

    impl Hook for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> Capabilities {
            self.caps
        }

        fn on_request<'a>(
            &'a self,
            _method: McpMethod,
            request: McpRequest,
            _extra: &'a RequestExtra,
        ) -> BoxFuture<'a, Result<RequestAction, HookError>> {
            self.record("request");
            Box::pin(async move { Ok(RequestAction::Continue(request)) })
        }

        fn on_response<'a>(
            &'a self,
            _method: McpMethod,
            mut result: Value,
            _request: &'a McpRequest,
            _extra: &'a RequestExtra,
        ) -> BoxFuture<'a, Result<Value, HookError>> {
            self.record("response");
            Box::pin(async move {
                if let Some(seen) = result.get_mut("seen").and_then(Value::as_array_mut) {
                    seen.push(json!(self.name));
                }
                Ok(result)
            })
        }

        fn on_error<'a>(
            &'a self,
            _method: McpMethod,
            error: Value,
            _request: &'a McpRequest,
            _extra: &'a RequestExtra,
        ) -> BoxFuture<'a, Result<Value, HookError>> {
            self.record("error");
            Box::pin(async move { Ok(error) })
        }

        fn on_notification<'a>(
            &'a self,
            _notification: &'a Notification,
            _extra: &'a RequestExtra,
        ) -> BoxFuture<'a, Result<(), HookError>> {
            self.record("notification");
            Box::pin(async { Ok(()) })
        }
    }

    /// Rewrites, answers or fails `tools/call` and generic requests.
    enum Behavior {
        RenameArgument,
        Respond,
        ContinueAsync,
        Abort,
        Fail,
        AlwaysRetry,
        FailResponse,
        HeaderAdd,
        HeaderFail,
    }

    struct Scripted {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Hook for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn capabilities(&self) -> Capabilities {
            match self.behavior {
                Behavior::HeaderAdd | Behavior::HeaderFail => Capabilities::new().headers(),
                Behavior::AlwaysRetry | Behavior::FailResponse => Capabilities::new()
                    .response(McpMethod::ToolsCall)
                    .response(McpMethod::ToolsList),
                _ => Capabilities::new()
                    .request(McpMethod::ToolsCall)
                    .request(McpMethod::ToolsList),
            }
        }

        fn on_request<'a>(
            &'a self,
            _method: McpMethod,
            request: McpRequest,
            _extra: &'a RequestExtra,
        ) -> BoxFuture<'a, Result<RequestAction, HookError>> {
            Box::pin(async move {
                match self.behavior {
                    Behavior::Respond => Ok(RequestAction::Respond(json!({ "tools": [] }))),
                    Behavior::Fail => Err(HookError::new("boom")),
                    _ => Ok(RequestAction::Continue(request)),
                }
            })
        }

        fn on_response<'a>(
            &'a self,
            _method: McpMethod,
            _result: Value,
            _request: &'a McpRequest,
            _extra: &'a RequestExtra,
        ) -> BoxFuture<'a, Result<Value, HookError>> {
            Box::pin(async { Err(HookError::new("response boom")) })
        }

        fn on_tool_call<'a>(
            &'a self,
            mut request: McpRequest,
            _extra: &'a RequestExtra,
        ) -> BoxFuture<'a, Result<ToolCallAction, HookError>> {
            Box::pin(async move {
                match self.behavior {
                    Behavior::RenameArgument => {
                        if let Some(params) = request.params.as_mut() {
                            params["arguments"] = json!({ "q": "rewritten" });
                        }
                        Ok(ToolCallAction::Continue(request))
                    }
                    Behavior::Respond => Ok(ToolCallAction::Respond(json!({ "content": [] }))),
                    Behavior::ContinueAsync => {
                        if let Some(params) = request.params.as_mut() {
                            params["arguments"] = json!({ "q": "queued" });
                        }
                        Ok(ToolCallAction::ContinueAsync {
                            request,
                            result: json!({ "accepted": true }),
                        })
                    }
                    Behavior::Abort => Ok(ToolCallAction::Abort(Abort {
                        reason: "blocked".to_owned(),
                        body: None,
                    })),
                    Behavior::Fail => Err(HookError::new("boom")),
                    _ => Ok(ToolCallAction::Continue(request)),
                }
            })
        }

        fn on_tool_result<'a>(
            &'a self,
            result: Value,
            _request: &'a McpRequest,
            _extra: &'a RequestExtra,
        ) -> BoxFuture<'a, Result<ToolResultAction, HookError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                match self.behavior {
                    Behavior::AlwaysRetry => Ok(ToolResultAction::Retry),
                    Behavior::FailResponse => Err(HookError::new("response boom")),
                    _ => Ok(ToolResultAction::Continue(result)),
                }
            })
        }

        fn prepare_headers<'a>(
            &'a self,
            headers: &'a mut HeaderMap,
            _extra: &'a RequestExtra,
        ) -> BoxFuture<'a, Result<(), HookError>> {
            Box::pin(async move {
                match self.behavior {
                    Behavior::HeaderFail => Err(HookError::new("header boom")),
                    _ => {
                        headers.insert("x-added", HeaderValue::from_static("yes"));
                        Ok(())
                    }
                }
            })
        }
    }

    const TOOL_CALL: &str = r#"{"jsonrpc":"2.0", "id":3, "method":"tools/call", "params":{"name":"search","arguments":{"q":"rust"}}, "x-vendor":1}"#;

    fn pipeline(hooks: Vec<Arc<dyn Hook>>, upstream: &Arc<FakeUpstream>) -> HookPipeline {
        let upstream: Arc<dyn Upstream> = Arc::<FakeUpstream>::clone(upstream);
        HookPipeline::new(hooks, upstream)
    }

    #[tokio::test]
    async fn test_non_json_body_passes_through() {
        let mut reply = ProxyResponse::json(StatusCode::ACCEPTED, &json!({}));
        reply.body = Bytes::from_static(b"plain");
        let upstream = FakeUpstream::replying(vec![reply]);
        let response = pipeline(vec![], &upstream).handle(post("hello")).await;

        assert_eq!(response.status, StatusCode::ACCEPTED);
        assert_eq!(response.body, Bytes::from_static(b"plain"));
        assert_eq!(upstream.request(0).body, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_unmutated_request_forwards_original_bytes() {
        let log = Arc::default();
        let upstream = FakeUpstream::replying(vec![json_reply(
            &json!({"jsonrpc": "2.0", "id": 3, "result": {"content": []}}),
        )]);
        let observer = Recorder::new("observer", Capabilities::all_methods(), &log);
        let response = pipeline(vec![observer], &upstream).handle(post(TOOL_CALL)).await;

        assert_eq!(upstream.request(0).body, Bytes::from_static(TOOL_CALL.as_bytes()));
        assert_eq!(body_json(&response)["result"], json!({"content": []}));
    }

    #[tokio::test]
    async fn test_mutated_request_is_reserialized_with_envelope() {
        let upstream = FakeUpstream::replying(vec![]);
        let hook = Scripted::new(Behavior::RenameArgument);
        pipeline(vec![hook], &upstream).handle(post(TOOL_CALL)).await;

        let sent: Value = serde_json::from_slice(&upstream.request(0).body).unwrap();
        assert_eq!(sent["params"]["arguments"]["q"], "rewritten");
        assert_eq!(sent["x-vendor"], 1);
        assert_eq!(sent["id"], 3);
        assert_eq!(sent["method"], "tools/call");
    }

    #[tokio::test]
    async fn test_sse_reply_is_reemitted_as_json() {
        let upstream = FakeUpstream::replying(vec![sse_reply(
            r#"{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"ok"}]}}"#,
        )]);
        let response = pipeline(vec![], &upstream).handle(post(TOOL_CALL)).await;

        assert_eq!(response.headers[CONTENT_TYPE], "application/json");
        assert_eq!(response.headers["mcp-session-id"], "sess-9");
        let body = body_json(&response);
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["id"], 3);
        assert_eq!(body["result"]["content"][0]["text"], "ok");
    }

    #[tokio::test]
    async fn test_bare_result_is_wrapped() {
        let upstream = FakeUpstream::replying(vec![json_reply(&json!({"tools": []}))]);
        let response = pipeline(vec![], &upstream)
            .handle(post(r#"{"jsonrpc":"2.0","id":"a","method":"tools/list"}"#))
            .await;
        assert_eq!(
            body_json(&response),
            json!({"jsonrpc": "2.0", "id": "a", "result": {"tools": []}})
        );
    }

    #[tokio::test]
    async fn test_response_hooks_run_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Recorder::new("first", Capabilities::all_methods(), &log);
        let second = Recorder::new("second", Capabilities::all_methods(), &log);
        let upstream = FakeUpstream::replying(vec![json_reply(&json!({"seen": []}))]);
        let response = pipeline(vec![first, second], &upstream)
            .handle(post(r#"{"jsonrpc":"2.0","id":1,"method":"prompts/list"}"#))
            .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "first:request",
                "second:request",
                "second:response",
                "first:response"
            ]
        );
        assert_eq!(body_json(&response)["result"]["seen"], json!(["second", "first"]));
    }

    #[tokio::test]
    async fn test_undeclared_slots_are_not_called() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let only_tools = Recorder::new(
            "tools",
            Capabilities::new().request(McpMethod::ToolsList),
            &log,
        );
        let upstream = FakeUpstream::replying(vec![]);
        pipeline(vec![only_tools], &upstream)
            .handle(post(r#"{"jsonrpc":"2.0","id":1,"method":"resources/list"}"#))
            .await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_respond_short_circuits_upstream() {
        let upstream = FakeUpstream::replying(vec![]);
        let hook = Scripted::new(Behavior::Respond);
        let response = pipeline(vec![hook], &upstream)
            .handle(post(r#"{"jsonrpc":"2.0","id":9,"method":"tools/list"}"#))
            .await;

        assert_eq!(upstream.calls(), 0);
        assert_eq!(
            body_json(&response),
            json!({"jsonrpc": "2.0", "id": 9, "result": {"tools": []}})
        );
    }

    #[tokio::test]
    async fn test_continue_async_answers_and_forwards() {
        let upstream = FakeUpstream::replying(vec![]);
        let hook = Scripted::new(Behavior::ContinueAsync);
        let response = pipeline(vec![hook], &upstream).handle(post(TOOL_CALL)).await;
        assert_eq!(body_json(&response)["result"], json!({"accepted": true}));

        for _ in 0..50 {
            if upstream.calls() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(upstream.calls(), 1);
        let forwarded = upstream.request(0);
        assert_ne!(forwarded.body, Bytes::from_static(TOOL_CALL.as_bytes()));
        let sent: Value = serde_json::from_slice(&forwarded.body).unwrap();
        assert_eq!(
            sent,
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": "search", "arguments": { "q": "queued" } },
                "x-vendor": 1
            })
        );
    }

    #[tokio::test]
    async fn test_abort_is_plain_400() {
        let upstream = FakeUpstream::replying(vec![]);
        let hook = Scripted::new(Behavior::Abort);
        let response = pipeline(vec![hook], &upstream).handle(post(TOOL_CALL)).await;

        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(body_json(&response), json!({"error": "blocked"}));
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_request_hook_error_fails_closed() {
        let upstream = FakeUpstream::replying(vec![]);
        let hook = Scripted::new(Behavior::Fail);
        let response = pipeline(vec![hook], &upstream).handle(post(TOOL_CALL)).await;

        let body = body_json(&response);
        assert_eq!(body["id"], 3);
        assert_eq!(body["error"]["code"], -32603);
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_response_hook_error_is_skipped() {
        let upstream = FakeUpstream::replying(vec![json_reply(&json!({"content": []}))]);
        let hook = Scripted::new(Behavior::FailResponse);
        let response = pipeline(vec![hook], &upstream).handle(post(TOOL_CALL)).await;
        assert_eq!(body_json(&response)["result"], json!({"content": []}));
    }

    #[tokio::test]
    async fn test_retry_budget_is_one() {
        let upstream = FakeUpstream::replying(vec![]);
        let hook = Scripted::new(Behavior::AlwaysRetry);
        let hook_ref = Arc::clone(&hook);
        let response = pipeline(vec![hook], &upstream).handle(post(TOOL_CALL)).await;

        assert_eq!(upstream.calls(), 2);
        assert_eq!(hook_ref.calls.load(Ordering::SeqCst), 2);
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_notification_is_observed_not_rewritten() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let observer = Recorder::new("obs", Capabilities::all_methods().notifications(), &log);
        let mut reply = ProxyResponse::json(StatusCode::ACCEPTED, &json!({}));
        reply.body = Bytes::new();
        let upstream = FakeUpstream::replying(vec![reply]);
        let note = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        let response = pipeline(vec![observer], &upstream).handle(post(note)).await;

        assert_eq!(*log.lock().unwrap(), vec!["obs:notification"]);
        assert_eq!(response.status, StatusCode::ACCEPTED);
        assert!(response.body.is_empty());
        assert_eq!(upstream.request(0).body, Bytes::from_static(note.as_bytes()));
    }

    #[tokio::test]
    async fn test_upstream_failure_is_502() {
        let upstream = FakeUpstream::failing();
        let response = pipeline(vec![], &upstream).handle(post(TOOL_CALL)).await;

        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        let body = body_json(&response);
        assert_eq!(body["error"], "Bad Gateway");
        assert!(body["details"].as_str().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_error_envelope_runs_error_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Recorder::new("first", Capabilities::all_methods(), &log);
        let second = Recorder::new("second", Capabilities::all_methods(), &log);
        let upstream = FakeUpstream::replying(vec![json_reply(&json!({
            "jsonrpc": "2.0", "id": 3, "error": {"code": -32602, "message": "bad args"}
        }))]);
        let response = pipeline(vec![first, second], &upstream)
            .handle(post(r#"{"jsonrpc":"2.0","id":3,"method":"resources/read"}"#))
            .await;

        let body = body_json(&response);
        assert_eq!(body["error"]["code"], -32602);
        assert!(body.get("result").is_none());
        let log = log.lock().unwrap();
        assert_eq!(log[2], "second:error");
        assert_eq!(log[3], "first:error");
    }

    #[tokio::test]
    async fn test_header_hygiene_and_header_hooks() {
        let upstream = FakeUpstream::replying(vec![]);
        let adds = Scripted::new(Behavior::HeaderAdd);
        let fails = Scripted::new(Behavior::HeaderFail);
        let response = pipeline(vec![fails, adds], &upstream).handle(post(TOOL_CALL)).await;

        assert_eq!(response.status, StatusCode::OK);
        let sent = upstream.request(0).headers;
        assert!(sent.get(HOST).is_none());
        assert!(sent.get(CONTENT_LENGTH).is_none());
        assert_eq!(sent["authorization"], "Bearer t");
        assert_eq!(sent["x-added"], "yes");
    }

    #[tokio::test]
    async fn test_non_success_upstream_passes_through() {
        let reply = ProxyResponse::json(StatusCode::UNAUTHORIZED, &json!({"error": "nope"}));
        let upstream = FakeUpstream::replying(vec![reply]);
        let response = pipeline(vec![], &upstream).handle(post(TOOL_CALL)).await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(&response), json!({"error": "nope"}));
    }
}
