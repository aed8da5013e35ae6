//! The hook contract.
//!
//! A [`Hook`] is one middleware unit of the pipeline. It declares up front,
//! through [`Capabilities`], which slots it implements; the pipeline builds
//! its dispatch tables from those declarations once and only ever calls the
//! declared slots.
//!
//! Request-phase slots run in list order, response-phase and error slots in
//! reverse order. Every slot of one call receives the same [`RequestExtra`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use http::HeaderMap;
use serde_json::{Map, Value};
use tollgate::BoxFuture;
use uuid::Uuid;

use crate::error::HookError;

/// MCP methods the pipeline dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McpMethod {
    /// `initialize`
    Initialize,
    /// `tools/list`
    ToolsList,
    /// `tools/call`
    ToolsCall,
    /// `prompts/list`
    PromptsList,
    /// `resources/list`
    ResourcesList,
    /// `resources/templates/list`
    ResourcesTemplatesList,
    /// `resources/read`
    ResourcesRead,
    /// Any other method.
    Other,
}

impl McpMethod {
    /// All variants, in slot order.
    pub const ALL: [Self; 8] = [
        Self::Initialize,
        Self::ToolsList,
        Self::ToolsCall,
        Self::PromptsList,
        Self::ResourcesList,
        Self::ResourcesTemplatesList,
        Self::ResourcesRead,
        Self::Other,
    ];

    /// Maps a JSON-RPC method name to its slot.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "initialize" => Self::Initialize,
            "tools/list" => Self::ToolsList,
            "tools/call" => Self::ToolsCall,
            "prompts/list" => Self::PromptsList,
            "resources/list" => Self::ResourcesList,
            "resources/templates/list" => Self::ResourcesTemplatesList,
            "resources/read" => Self::ResourcesRead,
            _ => Self::Other,
        }
    }

    /// Slot index, `0..8`.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for McpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialize => "initialize",
            Self::ToolsList => "tools/list",
            Self::ToolsCall => "tools/call",
            Self::PromptsList => "prompts/list",
            Self::ResourcesList => "resources/list",
            Self::ResourcesTemplatesList => "resources/templates/list",
            Self::ResourcesRead => "resources/read",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// The slots a hook implements.
///
/// ```
/// use tollgate_mcp::{Capabilities, McpMethod};
///
/// let caps = Capabilities::new()
///     .request(McpMethod::ToolsCall)
///     .response(McpMethod::ToolsCall);
/// assert!(caps.has_request(McpMethod::ToolsCall));
/// assert!(!caps.has_request(McpMethod::ToolsList));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    request: u8,
    response: u8,
    error: u8,
    notifications: bool,
    headers: bool,
}

impl Capabilities {
    /// No slots.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            request: 0,
            response: 0,
            error: 0,
            notifications: false,
            headers: false,
        }
    }

    /// Request, response and error slots for every method.
    #[must_use]
    pub const fn all_methods() -> Self {
        Self {
            request: u8::MAX,
            response: u8::MAX,
            error: u8::MAX,
            notifications: false,
            headers: false,
        }
    }

    /// Declares the request slot of `method`.
    #[must_use]
    pub const fn request(mut self, method: McpMethod) -> Self {
        self.request |= method.bit();
        self
    }

    /// Declares the response slot of `method`.
    #[must_use]
    pub const fn response(mut self, method: McpMethod) -> Self {
        self.response |= method.bit();
        self
    }

    /// Declares the error slot of `method`.
    #[must_use]
    pub const fn error(mut self, method: McpMethod) -> Self {
        self.error |= method.bit();
        self
    }

    /// Declares the notification observer.
    #[must_use]
    pub const fn notifications(mut self) -> Self {
        self.notifications = true;
        self
    }

    /// Declares the header-mutation slot.
    #[must_use]
    pub const fn headers(mut self) -> Self {
        self.headers = true;
        self
    }

    /// Whether the request slot of `method` is declared.
    #[must_use]
    pub const fn has_request(&self, method: McpMethod) -> bool {
        self.request & method.bit() != 0
    }

    /// Whether the response slot of `method` is declared.
    #[must_use]
    pub const fn has_response(&self, method: McpMethod) -> bool {
        self.response & method.bit() != 0
    }

    /// Whether the error slot of `method` is declared.
    #[must_use]
    pub const fn has_error(&self, method: McpMethod) -> bool {
        self.error & method.bit() != 0
    }

    /// Whether the notification observer is declared.
    #[must_use]
    pub const fn has_notifications(&self) -> bool {
        self.notifications
    }

    /// Whether the header-mutation slot is declared.
    #[must_use]
    pub const fn has_headers(&self) -> bool {
        self.headers
    }
}

/// The method and params of an in-flight JSON-RPC request.
#[derive(Debug, Clone, PartialEq)]
pub struct McpRequest {
    /// Method name.
    pub method: String,
    /// Parameters, if any.
    pub params: Option<Value>,
}

impl McpRequest {
    /// Creates a request.
    #[must_use]
    pub const fn new(method: String, params: Option<Value>) -> Self {
        Self { method, params }
    }

    /// `params.name` of a `tools/call`.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        self.params.as_ref()?.get("name")?.as_str()
    }

    /// `params._meta`.
    #[must_use]
    pub fn meta(&self) -> Option<&Map<String, Value>> {
        self.params.as_ref()?.get("_meta")?.as_object()
    }

    /// A single `params._meta` entry.
    #[must_use]
    pub fn meta_value(&self, key: &str) -> Option<&Value> {
        self.meta()?.get(key)
    }
}

/// A notification as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Parameters, if any.
    pub params: Option<Value>,
}

/// A request-phase hook short-circuit for `tools/call` that is not JSON-RPC:
/// answered with HTTP 400.
#[derive(Debug, Clone, PartialEq)]
pub struct Abort {
    /// Why the call was aborted.
    pub reason: String,
    /// Optional JSON body; `{"error": reason}` is sent when absent.
    pub body: Option<Value>,
}

/// Outcome of a generic request-phase slot.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestAction {
    /// Pass the (possibly rewritten) request to the next hook.
    Continue(McpRequest),
    /// Answer the client with this result; upstream is not called.
    Respond(Value),
    /// Answer the client with `result` and still forward `request` in the
    /// background.
    ContinueAsync {
        /// The request sent upstream, including this hook's rewrites.
        request: McpRequest,
        /// The result the client gets right away.
        result: Value,
    },
}

/// Outcome of the `tools/call` request-phase slot.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallAction {
    /// Pass the (possibly rewritten) request to the next hook.
    Continue(McpRequest),
    /// Answer the client with this result; upstream is not called.
    Respond(Value),
    /// Answer the client with `result` and still forward `request` in the
    /// background.
    ContinueAsync {
        /// The request sent upstream, including this hook's rewrites.
        request: McpRequest,
        /// The result the client gets right away.
        result: Value,
    },
    /// Reject the call outside of JSON-RPC.
    Abort(Abort),
}

/// Outcome of the `tools/call` response-phase slot.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResultAction {
    /// Pass the (possibly rewritten) result on.
    Continue(Value),
    /// Re-run the whole call, request phase included.
    Retry,
    /// Reject the call outside of JSON-RPC.
    Abort(Abort),
}

/// Per-call typed storage.
///
/// Stateful hooks park side effects here during the request phase and pick
/// them up in the response phase of the same call. The store lives exactly as
/// long as the call, so nothing outlives a dropped connection.
#[derive(Default)]
pub struct CallState {
    slots: Mutex<HashMap<TypeId, Box<dyn Any + Send>>>,
}

impl fmt::Debug for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("CallState").field("slots", &len).finish()
    }
}

impl CallState {
    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T: Any + Send>(&self, value: T) -> Option<T> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast::<T>().ok())
            .map(|prev| *prev)
    }

    /// Removes and returns the value of type `T`.
    pub fn take<T: Any + Send>(&self) -> Option<T> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    /// Whether a value of type `T` is stored.
    #[must_use]
    pub fn contains<T: Any + Send>(&self) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeId::of::<T>())
    }
}

/// Correlation context of one proxied call.
///
/// Created once per inbound HTTP request and shared by every hook slot of the
/// call, retries included.
#[derive(Debug)]
pub struct RequestExtra {
    /// Fresh UUID v4.
    pub request_id: String,
    /// Value of the `mcp-session-id` header.
    pub session_id: Option<String>,
    /// URL the client called.
    pub original_url: String,
    /// URL the call is forwarded to.
    pub target_url: String,
    /// Inbound headers.
    pub headers: HeaderMap,
    /// Configured server id.
    pub server_id: Option<String>,
    /// Per-call hook state.
    pub state: CallState,
}

impl RequestExtra {
    /// Creates a context with a fresh request id.
    #[must_use]
    pub fn new(
        original_url: String,
        target_url: String,
        headers: HeaderMap,
        server_id: Option<String>,
    ) -> Self {
        let session_id = headers
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Self {
            request_id: Uuid::new_v4().to_string(),
            session_id,
            original_url,
            target_url,
            headers,
            server_id,
            state: CallState::default(),
        }
    }
}

/// One middleware unit of the pipeline.
///
/// Every slot has a pass-through default; a hook overrides the slots it lists
/// in [`capabilities`](Hook::capabilities). The pipeline never calls an
/// undeclared slot.
pub trait Hook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Slots this hook implements.
    fn capabilities(&self) -> Capabilities;

    /// Request phase of any method except `tools/call`.
    fn on_request<'a>(
        &'a self,
        _method: McpMethod,
        request: McpRequest,
        _extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<RequestAction, HookError>> {
        Box::pin(async move { Ok(RequestAction::Continue(request)) })
    }

    /// Response phase of any method except `tools/call`.
    fn on_response<'a>(
        &'a self,
        _method: McpMethod,
        result: Value,
        _request: &'a McpRequest,
        _extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<Value, HookError>> {
        Box::pin(async move { Ok(result) })
    }

    /// Upstream JSON-RPC error of any method.
    fn on_error<'a>(
        &'a self,
        _method: McpMethod,
        error: Value,
        _request: &'a McpRequest,
        _extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<Value, HookError>> {
        Box::pin(async move { Ok(error) })
    }

    /// Request phase of `tools/call`.
    fn on_tool_call<'a>(
        &'a self,
        request: McpRequest,
        _extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<ToolCallAction, HookError>> {
        Box::pin(async move { Ok(ToolCallAction::Continue(request)) })
    }

    /// Response phase of `tools/call`.
    fn on_tool_result<'a>(
        &'a self,
        result: Value,
        _request: &'a McpRequest,
        _extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<ToolResultAction, HookError>> {
        Box::pin(async move { Ok(ToolResultAction::Continue(result)) })
    }

    /// Observes a notification. Cannot alter or stop it.
    fn on_notification<'a>(
        &'a self,
        _notification: &'a Notification,
        _extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<(), HookError>> {
        Box::pin(async { Ok(()) })
    }

    /// Mutates the headers sent upstream.
    fn prepare_headers<'a>(
        &'a self,
        _headers: &'a mut HeaderMap,
        _extra: &'a RequestExtra,
    ) -> BoxFuture<'a, Result<(), HookError>> {
        Box::pin(async { Ok(()) })
    }
}
