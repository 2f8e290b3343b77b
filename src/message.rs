use crate::provider::ProviderId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role in conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One exchange unit in the conversation log.
///
/// Turns are immutable once appended; the log is insertion-ordered and
/// never reordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Which backend produced this turn (assistant turns only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
    /// Tool calls the model issued alongside the text (assistant turns only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Turn {
    pub fn user(text: &str) -> Self {
        Self {
            role: Role::User,
            content: text.to_string(),
            timestamp: Utc::now(),
            provider: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(text: &str, provider: ProviderId) -> Self {
        Self {
            role: Role::Assistant,
            content: text.to_string(),
            timestamp: Utc::now(),
            provider: Some(provider),
            tool_calls: Vec::new(),
        }
    }

    pub fn system(text: &str) -> Self {
        Self {
            role: Role::System,
            content: text.to_string(),
            timestamp: Utc::now(),
            provider: None,
            tool_calls: Vec::new(),
        }
    }
}

/// Tool definition passed through to the backend
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool call from the model, with its fully accumulated JSON input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Why the backend stopped generating, normalized across vendors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    End,
    ToolUse,
    MaxTokens,
}

impl StopReason {
    /// Map a vendor finish/stop string onto the closed set.
    pub fn from_vendor(raw: &str) -> Self {
        match raw {
            "tool_use" | "tool_calls" | "function_call" => Self::ToolUse,
            "max_tokens" | "length" | "MAX_TOKENS" => Self::MaxTokens,
            _ => Self::End,
        }
    }
}

/// A normalized completion request, uniform across backends.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Turn>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub tools: Vec<ToolDefinition>,
}

/// Result of a single-shot (non-streaming) completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub stop_reason: StopReason,
}

/// Streaming event from a provider.
///
/// A stream always terminates in `MessageEnd` or an error item. Tool input
/// arrives as JSON fragments between `ToolUseStart` and `ToolUseEnd`; the
/// consumer accumulates the fragments into the complete input.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Text content delta
    TextDelta(String),
    /// Tool use started
    ToolUseStart { id: String, name: String },
    /// Tool input delta (JSON fragment)
    ToolInputDelta(String),
    /// Tool use complete
    ToolUseEnd,
    /// Token usage update
    TokenUsage {
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
    /// Message complete
    MessageEnd { stop_reason: Option<StopReason> },
}
