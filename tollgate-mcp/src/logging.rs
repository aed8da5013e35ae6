//! A `tracing` observer hook.

use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tollgate::BoxFuture;

use crate::error::HookError;
use crate::hook::{
    Capabilities, Hook, McpMethod, McpRequest, Notification, RequestAction, RequestExtra,
    ToolCallAction, ToolResultAction,
};

/// Header carrying the per-call request id upstream.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Logs every call, reply and notification, and tags upstream requests with
/// `x-request-id`.
///
/// Never alters a message.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHook;

impl LoggingHook {
    /// Creates the hook.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn is_error_result(result: &Value) -> bool {
    result.get("isError").and_then(Value::as_bool).unwrap_or(false)
}

impl Hook for LoggingHook {
    fn name(&self) -> &str {
        "logging"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all_methods().notifications().headers()
    }

    fn on_request<'a>(
        &'a self,
        method: McpMethod,
        request: McpRequest,
        extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<RequestAction, HookError>> {
        Box::pin(async move {
            tracing::info!(
                request_id = %extra.request_id,
                session_id = extra.session_id.as_deref(),
                method = %request.method,
                slot = %method,
                "mcp request"
            );
            Ok(RequestAction::Continue(request))
        })
    }

    fn on_response<'a>(
        &'a self,
        method: McpMethod,
        result: Value,
        request: &'a McpRequest,
        extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<Value, HookError>> {
        Box::pin(async move {
            tracing::info!(
                request_id = %extra.request_id,
                method = %request.method,
                slot = %method,
                "mcp response"
            );
            Ok(result)
        })
    }

    fn on_error<'a>(
        &'a self,
        method: McpMethod,
        error: Value,
        request: &'a McpRequest,
        extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<Value, HookError>> {
        Box::pin(async move {
            let code = error.get("code").and_then(Value::as_i64);
            let message = error.get("message").and_then(Value::as_str);
            tracing::warn!(
                request_id = %extra.request_id,
                method = %request.method,
                slot = %method,
                code,
                message,
                "mcp error"
            );
            Ok(error)
        })
    }

    fn on_tool_call<'a>(
        &'a self,
        request: McpRequest,
        extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<ToolCallAction, HookError>> {
        Box::pin(async move {
            tracing::info!(
                request_id = %extra.request_id,
                session_id = extra.session_id.as_deref(),
                tool = request.tool_name(),
                "tool call"
            );
            Ok(ToolCallAction::Continue(request))
        })
    }

    fn on_tool_result<'a>(
        &'a self,
        result: Value,
        request: &'a McpRequest,
        extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<ToolResultAction, HookError>> {
        Box::pin(async move {
            tracing::info!(
                request_id = %extra.request_id,
                tool = request.tool_name(),
                is_error = is_error_result(&result),
                "tool result"
            );
            Ok(ToolResultAction::Continue(result))
        })
    }

    fn on_notification<'a>(
        &'a self,
        notification: &'a Notification,
        extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<(), HookError>> {
        Box::pin(async move {
            tracing::debug!(
                request_id = %extra.request_id,
                method = %notification.method,
                "mcp notification"
            );
            Ok(())
        })
    }

    fn prepare_headers<'a>(
        &'a self,
        headers: &'a mut HeaderMap,
        extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<(), HookError>> {
        Box::pin(async move {
            let value = HeaderValue::from_str(&extra.request_id)
                .map_err(|e| HookError::with_source("request id is not a header value", e))?;
            headers.insert(REQUEST_ID_HEADER, value);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extra() -> RequestExtra {
        RequestExtra::new(
            "/mcp".to_owned(),
            "http://upstream/mcp".to_owned(),
            HeaderMap::new(),
            None,
        )
    }

    #[tokio::test]
    async fn test_tags_upstream_headers() {
        let extra = extra();
        let mut headers = HeaderMap::new();
        LoggingHook.prepare_headers(&mut headers, &extra).await.unwrap();
        assert_eq!(
            headers.get(REQUEST_ID_HEADER).unwrap().to_str().unwrap(),
            extra.request_id
        );
    }

    #[tokio::test]
    async fn test_never_alters_messages() {
        let extra = extra();
        let request = McpRequest::new("tools/call".to_owned(), Some(json!({ "name": "search" })));
        let result = json!({ "content": [], "isError": true });

        let action = LoggingHook.on_tool_call(request.clone(), &extra).await.unwrap();
        assert!(matches!(action, ToolCallAction::Continue(r) if r == request));
        let action = LoggingHook
            .on_tool_result(result.clone(), &request, &extra)
            .await
            .unwrap();
        assert!(matches!(action, ToolResultAction::Continue(r) if r == result));
    }

    #[tokio::test]
    async fn test_error_is_logged_and_returned_unchanged() {
        let extra = extra();
        let request = McpRequest::new("tools/call".to_owned(), Some(json!({ "name": "search" })));
        for error in [
            json!({ "code": -32602, "message": "bad params" }),
            json!({ "code": "not a number" }),
        ] {
            let logged = LoggingHook
                .on_error(McpMethod::ToolsCall, error.clone(), &request, &extra)
                .await
                .unwrap();
            assert_eq!(logged, error);
        }
    }

    #[test]
    fn test_observes_every_slot() {
        let caps = LoggingHook.capabilities();
        assert!(McpMethod::ALL.iter().all(|m| caps.has_request(*m) && caps.has_error(*m)));
        assert!(caps.has_notifications());
        assert!(caps.has_headers());
    }
}
