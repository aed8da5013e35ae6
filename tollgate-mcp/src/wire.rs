//! JSON-RPC and Server-Sent-Events wire handling.
//!
//! Inbound bodies are classified into calls, notifications and everything
//! else. Upstream bodies arrive in three shapes (a JSON-RPC envelope, a bare
//! result object, or an SSE stream whose last `data:` event holds the final
//! message) and are collapsed into one [`UpstreamBody`].

use serde_json::{Map, Value, json};

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for internal errors.
pub const INTERNAL_ERROR: i64 = -32603;

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A request carrying an `id`.
    Call {
        /// Request id, kept as raw JSON (string, number or null).
        id: Value,
        /// Method name.
        method: String,
        /// Parameters, if any.
        params: Option<Value>,
        /// The whole envelope, for re-serialization with unknown fields intact.
        envelope: Map<String, Value>,
    },
    /// A request without an `id`.
    Notification {
        /// Method name.
        method: String,
        /// Parameters, if any.
        params: Option<Value>,
    },
    /// Anything the pipeline does not interpret: non-JSON, batches,
    /// non-objects, responses, objects without a method.
    Passthrough,
}

/// Classifies an inbound request body.
#[must_use]
pub fn parse_message(body: &[u8]) -> Message {
    let Ok(Value::Object(envelope)) = serde_json::from_slice::<Value>(body) else {
        return Message::Passthrough;
    };
    let Some(method) = envelope.get("method").and_then(Value::as_str) else {
        return Message::Passthrough;
    };
    let method = method.to_owned();
    let params = envelope.get("params").cloned();
    match envelope.get("id") {
        Some(id) => Message::Call {
            id: id.clone(),
            method,
            params,
            envelope,
        },
        None => Message::Notification { method, params },
    }
}

/// Returns `true` for a `text/event-stream` content type, parameters ignored.
#[must_use]
pub fn is_event_stream(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
}

/// Returns the payload of the last `data:` line of an SSE stream.
///
/// Only the final event is authoritative for a single JSON-RPC reply; earlier
/// events are progress notifications.
#[must_use]
pub fn last_sse_data(stream: &str) -> Option<&str> {
    stream
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
}

/// Rewrites the payload of the last `data:` line of an SSE stream.
///
/// Returns `None` when the stream has no `data:` line.
#[must_use]
pub fn replace_last_sse_data(stream: &str, data: &str) -> Option<String> {
    let lines: Vec<&str> = stream.split('\n').collect();
    let target = lines
        .iter()
        .rposition(|line| line.trim_end_matches('\r').starts_with("data:"))?;
    let mut out = String::with_capacity(stream.len() + data.len());
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if i == target {
            out.push_str("data: ");
            out.push_str(data);
        } else {
            out.push_str(line);
        }
    }
    Some(out)
}

/// Upstream reply collapsed to one canonical shape.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamBody {
    /// A successful result (from an envelope's `result` or a bare object).
    Result(Value),
    /// A JSON-RPC error object.
    Error(Value),
    /// The body could not be interpreted; it is passed through verbatim.
    Unparsed,
}

/// Decodes an upstream reply body.
#[must_use]
pub fn decode_upstream(content_type: Option<&str>, body: &[u8]) -> UpstreamBody {
    let parsed = if is_event_stream(content_type) {
        std::str::from_utf8(body)
            .ok()
            .and_then(last_sse_data)
            .and_then(|data| serde_json::from_str::<Value>(data).ok())
    } else {
        serde_json::from_slice::<Value>(body).ok()
    };
    match parsed {
        Some(Value::Object(object)) => classify_object(object),
        _ => UpstreamBody::Unparsed,
    }
}

fn classify_object(mut object: Map<String, Value>) -> UpstreamBody {
    let is_envelope = object.contains_key("jsonrpc")
        || (object.contains_key("id")
            && (object.contains_key("result") || object.contains_key("error")));
    if !is_envelope {
        return UpstreamBody::Result(Value::Object(object));
    }
    if let Some(result) = object.remove("result") {
        return UpstreamBody::Result(result);
    }
    match object.remove("error") {
        Some(error) => UpstreamBody::Error(error),
        None => UpstreamBody::Unparsed,
    }
}

/// Builds a success envelope. A null id becomes `0`.
#[must_use]
pub fn wrap_result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": normalize_id(id), "result": result })
}

/// Builds an error envelope. A null id becomes `0`.
#[must_use]
pub fn wrap_error(id: &Value, error: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": normalize_id(id), "error": error })
}

/// A JSON-RPC error object.
#[must_use]
pub fn error_object(code: i64, message: &str) -> Value {
    json!({ "code": code, "message": message })
}

fn normalize_id(id: &Value) -> Value {
    if id.is_null() { json!(0) } else { id.clone() }
}
