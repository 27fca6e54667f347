//! Third-party result envelopes
//!
//! Some capabilities return a transport envelope instead of a plain value. The
//! bridge offers every raw result to an [`EnvelopeAdapter`]; recognized envelopes
//! are normalized before the trace or the inspection callback see them.

use super::CapabilityError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recognizes and unwraps a result envelope format
pub trait EnvelopeAdapter: Send + Sync {
    /// Whether `value` has this envelope's shape
    fn recognizes(&self, value: &Value) -> bool;

    /// Convert the envelope to a plain value.
    ///
    /// Envelopes that flag themselves as errors must fail, carrying the envelope's
    /// diagnostic text and structured payload.
    fn adapt(&self, value: Value, output_schema: Option<&Value>) -> Result<Value, CapabilityError>;
}

/// Result of an MCP `tools/call` request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// Content block in tool results
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    ResourceLink {
        uri: String,
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

impl ToolCallResult {
    /// Successful result with a single text block
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            structured_content: None,
            is_error: None,
        }
    }

    /// Error result with a single text block
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            structured_content: None,
            is_error: Some(true),
        }
    }

    /// Attach structured content
    pub fn with_structured_content(mut self, value: Value) -> Self {
        self.structured_content = Some(value);
        self
    }

    fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Adapter for MCP `tools/call` results
#[derive(Debug, Clone, Copy, Default)]
pub struct McpEnvelopeAdapter;

impl EnvelopeAdapter for McpEnvelopeAdapter {
    fn recognizes(&self, value: &Value) -> bool {
        let Some(object) = value.as_object() else {
            return false;
        };
        let Some(content) = object.get("content").and_then(Value::as_array) else {
            return false;
        };
        let known_keys = object
            .keys()
            .all(|k| matches!(k.as_str(), "content" | "structuredContent" | "isError" | "_meta"));
        known_keys
            && content
                .iter()
                .all(|block| block.get("type").and_then(Value::as_str).is_some())
    }

    fn adapt(&self, value: Value, output_schema: Option<&Value>) -> Result<Value, CapabilityError> {
        let raw_content = value.get("content").cloned().unwrap_or(Value::Null);
        let result: ToolCallResult = serde_json::from_value(value).map_err(|e| {
            CapabilityError::new(format!("Malformed tool result envelope: {e}"))
        })?;

        if result.is_error.unwrap_or(false) {
            let text = result.joined_text();
            let message = if text.is_empty() {
                "Tool call failed".to_string()
            } else {
                text
            };
            let mut error = CapabilityError::new(message);
            if let Some(payload) = result.structured_content {
                error = error.with_payload(payload);
            }
            return Err(error);
        }

        if let Some(structured) = result.structured_content {
            return Ok(structured);
        }

        let text_only = !result.content.is_empty()
            && result.content.iter().all(|b| b.as_text().is_some());
        if text_only {
            let text = result.joined_text();
            if output_schema.is_some() {
                if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
                    return Ok(parsed);
                }
            }
            return Ok(Value::String(text));
        }

        Ok(raw_content)
    }
}
