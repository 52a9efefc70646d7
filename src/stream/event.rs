//! Canonical event model produced by the stream normalizer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One backend output event, independent of the backend's raw format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    /// Assistant prose.
    Text { content: String },
    /// Reasoning output.
    Thinking { content: String },
    /// A tool invocation. `detail` is a short human-readable summary of `input`.
    ToolCall {
        id: String,
        name: String,
        input: Value,
        detail: String,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    /// The backend's own end-of-run signal.
    Complete { reason: Option<String> },
    /// Structurally valid input without a dedicated variant.
    Metadata { data: Value },
}

impl NormalizedEvent {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::Thinking {
            content: content.into(),
        }
    }

    pub fn complete(reason: Option<String>) -> Self {
        Self::Complete { reason }
    }

    pub fn metadata(data: Value) -> Self {
        Self::Metadata { data }
    }

    /// Variant name as used in the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Thinking { .. } => "thinking",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Complete { .. } => "complete",
            Self::Metadata { .. } => "metadata",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    /// Content of a `text` event.
    pub fn text_content(&self) -> Option<&str> {
        match self {
            Self::Text { content } => Some(content),
            _ => None,
        }
    }
}
