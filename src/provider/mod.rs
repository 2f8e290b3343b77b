pub mod anthropic;
pub mod gemini;
pub mod openai;

use crate::error::ProviderError;
use crate::message::{ChatRequest, Completion, StopReason, StreamEvent, ToolCall, Turn};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// Stream of events from a provider
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

/// Closed set of backend identities. Adding a backend means adding a variant
/// here, a factory arm, and a ceiling table row; nothing else branches on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    Gemini,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [
        ProviderId::Anthropic,
        ProviderId::OpenAI,
        ProviderId::Gemini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Anthropic => "anthropic",
            ProviderId::OpenAI => "openai",
            ProviderId::Gemini => "gemini",
        }
    }

    pub fn parse(raw: &str) -> Option<ProviderId> {
        match raw.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Some(ProviderId::Anthropic),
            "openai" | "gpt" => Some(ProviderId::OpenAI),
            "gemini" | "google" => Some(ProviderId::Gemini),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Green,
    Yellow,
    Red,
}

impl HealthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            HealthStatus::Green => "green",
            HealthStatus::Yellow => "yellow",
            HealthStatus::Red => "red",
        }
    }
}

/// Result of a minimal round-trip health probe.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: String,
    pub has_credential: bool,
    pub latency_ms: Option<u64>,
}

/// Provider trait for LLM backends.
///
/// Adapters are stateless after construction and safe to share across
/// sessions. They make network calls only (conversation state is folded
/// back in by the caller) and they never retry internally.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend identity
    fn id(&self) -> ProviderId;

    /// Model identifier in use
    fn model(&self) -> String;

    /// True iff the required credential is present and non-empty.
    fn is_configured(&self) -> bool;

    /// Budget-heuristic token count for a text blob. Centralized in the
    /// estimator so swapping in a real tokenizer later is one change.
    fn count_tokens(&self, text: &str) -> usize {
        crate::estimator::estimate(text)
    }

    /// Open a streaming completion. Events arrive incrementally so the
    /// caller can render partial text; the stream always terminates in
    /// `MessageEnd` or an error item.
    async fn stream(&self, request: &ChatRequest) -> Result<EventStream, ProviderError>;

    /// Single-shot completion, collected from the streaming call.
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, ProviderError> {
        let stream = self.stream(request).await?;
        collect(stream).await
    }

    /// Minimal round-trip health probe.
    async fn check_health(&self) -> HealthReport {
        if !self.is_configured() {
            return HealthReport {
                status: HealthStatus::Red,
                message: format!("no credential for {}", self.id()),
                has_credential: false,
                latency_ms: None,
            };
        }

        let request = ChatRequest {
            messages: vec![Turn::user("ping")],
            max_tokens: Some(1),
            ..Default::default()
        };
        let started = Instant::now();
        match self.complete(&request).await {
            Ok(_) => HealthReport {
                status: HealthStatus::Green,
                message: "ok".to_string(),
                has_credential: true,
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(err) => classify_health_failure(err),
        }
    }
}

/// Map a failed probe call onto the health tri-state. Auth rejections and
/// unreachable backends are both red, with distinct messages; rate limits
/// and other API errors are recoverable yellow.
fn classify_health_failure(err: ProviderError) -> HealthReport {
    let (status, message) = match &err {
        ProviderError::NotConfigured(id) => {
            (HealthStatus::Red, format!("no credential for {}", id))
        }
        ProviderError::Auth(detail) => {
            (HealthStatus::Red, format!("invalid credential: {}", detail))
        }
        ProviderError::Transport(detail) => {
            (HealthStatus::Red, format!("unreachable: {}", detail))
        }
        ProviderError::RateLimited { message, .. } => {
            (HealthStatus::Yellow, format!("rate limited: {}", message))
        }
        ProviderError::Api { status, message } => (
            HealthStatus::Yellow,
            format!("api error ({}): {}", status, message),
        ),
        ProviderError::Malformed(detail) => {
            (HealthStatus::Yellow, format!("malformed response: {}", detail))
        }
    };
    HealthReport {
        status,
        message,
        has_credential: !matches!(err, ProviderError::NotConfigured(_)),
        latency_ms: None,
    }
}

/// Drain a stream into a single completion, accumulating text, tool-call
/// input fragments, and usage.
pub async fn collect(mut stream: EventStream) -> Result<Completion, ProviderError> {
    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut current_tool: Option<(String, String)> = None;
    let mut current_input = String::new();
    let mut input_tokens = None;
    let mut output_tokens = None;
    let mut stop_reason = None;

    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::TextDelta(text) => content.push_str(&text),
            StreamEvent::ToolUseStart { id, name } => {
                current_tool = Some((id, name));
                current_input.clear();
            }
            StreamEvent::ToolInputDelta(delta) => current_input.push_str(&delta),
            StreamEvent::ToolUseEnd => {
                if let Some((id, name)) = current_tool.take() {
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        input: parse_tool_input(&current_input),
                    });
                    current_input.clear();
                }
            }
            StreamEvent::TokenUsage {
                input_tokens: input,
                output_tokens: output,
            } => {
                if input.is_some() {
                    input_tokens = input;
                }
                if output.is_some() {
                    output_tokens = output;
                }
            }
            StreamEvent::MessageEnd { stop_reason: reason } => {
                if reason.is_some() {
                    stop_reason = reason;
                }
            }
        }
    }

    let stop_reason = stop_reason.unwrap_or(if tool_calls.is_empty() {
        StopReason::End
    } else {
        StopReason::ToolUse
    });

    Ok(Completion {
        content,
        tool_calls,
        input_tokens,
        output_tokens,
        stop_reason,
    })
}

/// Parse accumulated tool input JSON; empty or invalid fragments become null.
pub fn parse_tool_input(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

/// Map a non-2xx HTTP response onto the error taxonomy.
pub(crate) fn classify_response(
    status: reqwest::StatusCode,
    body: &str,
    retry_after_secs: Option<u64>,
) -> ProviderError {
    let message = crate::util::truncate_str(body.trim(), 500).to_string();
    match status.as_u16() {
        401 | 403 => ProviderError::Auth(message),
        429 => ProviderError::RateLimited {
            message,
            retry_after_secs,
        },
        code => ProviderError::Api {
            status: code,
            message,
        },
    }
}

/// Resolve a credential: environment variable first, then config file.
pub(crate) fn resolve_credential(env_var: &str, file_key: Option<&String>) -> Option<String> {
    std::env::var(env_var)
        .ok()
        .filter(|key| !key.is_empty())
        .or_else(|| file_key.cloned().filter(|key| !key.is_empty()))
}

/// Adapters looked up by identity. Stateless and shared; the active identity
/// lives on the conversation, not here.
#[derive(Default)]
pub struct ProviderSet {
    adapters: HashMap<ProviderId, Arc<dyn Provider>>,
}

impl ProviderSet {
    /// Build the full adapter set from config and environment.
    pub fn from_config() -> Self {
        let mut set = Self::default();
        set.insert(Arc::new(anthropic::AnthropicProvider::new()));
        set.insert(Arc::new(openai::OpenAIProvider::new()));
        set.insert(Arc::new(gemini::GeminiProvider::new()));
        set
    }

    pub fn insert(&mut self, provider: Arc<dyn Provider>) {
        self.adapters.insert(provider.id(), provider);
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn Provider>> {
        self.adapters.get(&id).cloned()
    }

    /// First configured provider in declaration order, defaulting to
    /// Anthropic when none has credentials (it will fail on use).
    pub fn default_active(&self) -> ProviderId {
        ProviderId::ALL
            .into_iter()
            .find(|id| {
                self.adapters
                    .get(id)
                    .map(|p| p.is_configured())
                    .unwrap_or(false)
            })
            .unwrap_or(ProviderId::Anthropic)
    }
}
