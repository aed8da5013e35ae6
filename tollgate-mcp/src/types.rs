//! Typed view over MCP tool call results.
//!
//! Only the fields the payment gate reads or writes are typed; everything else
//! (image content, annotations, fields added by newer MCP revisions) is kept in
//! flattened maps so a result survives a decode/encode pass unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One content block of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Block type (`"text"`, `"image"`, `"resource"`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Text of a `"text"` block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Any other fields of the block.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl ContentItem {
    /// Creates a text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_owned(),
            text: Some(text.into()),
            rest: Map::new(),
        }
    }

    /// Returns the text of a text block.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if self.kind == "text" {
            self.text.as_deref()
        } else {
            None
        }
    }
}

/// Result of an MCP `tools/call`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    /// Content blocks. Required, so an arbitrary JSON object is not taken
    /// for a tool result.
    pub content: Vec<ContentItem>,
    /// Whether the tool reported a failure.
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    /// Protocol extension data.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
    /// Structured tool output.
    #[serde(
        rename = "structuredContent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<Value>,
    /// Any other fields of the result.
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl CallToolResult {
    /// Builds an error result with one text block.
    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: Some(true),
            ..Self::default()
        }
    }

    /// Returns `true` only if the tool explicitly flagged the result as an error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.is_error.unwrap_or(false)
    }

    /// Inserts a `_meta` entry, creating the map if needed.
    pub fn insert_meta(&mut self, key: &str, value: Value) {
        self.meta
            .get_or_insert_with(Map::new)
            .insert(key.to_owned(), value);
    }

    /// Reads a `_meta` entry.
    #[must_use]
    pub fn meta_value(&self, key: &str) -> Option<&Value> {
        self.meta.as_ref()?.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_fields_survive() {
        let raw = json!({
            "content": [
                { "type": "text", "text": "hello", "annotations": { "priority": 1 } },
                { "type": "image", "data": "aGk=", "mimeType": "image/png" }
            ],
            "isError": false,
            "nextCursor": "abc"
        });
        let result: CallToolResult = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(result.content[0].as_text(), Some("hello"));
        assert_eq!(result.content[1].as_text(), None);
        assert_eq!(serde_json::to_value(&result).unwrap(), raw);
    }

    #[test]
    fn test_missing_is_error_means_success() {
        let result: CallToolResult = serde_json::from_value(json!({ "content": [] })).unwrap();
        assert!(!result.is_error());
        assert!(CallToolResult::error("boom").is_error());
    }

    #[test]
    fn test_object_without_content_is_not_a_tool_result() {
        assert!(serde_json::from_value::<CallToolResult>(json!({ "tools": [] })).is_err());
        assert!(serde_json::from_value::<CallToolResult>(json!({ "content": "text" })).is_err());
    }

    #[test]
    fn test_insert_meta_creates_map() {
        let mut result = CallToolResult::default();
        result.insert_meta("x402/payment-response", json!({ "success": true }));
        assert_eq!(
            result.meta_value("x402/payment-response"),
            Some(&json!({ "success": true }))
        );
    }
}
