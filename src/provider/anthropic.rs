//! Anthropic Messages API adapter
//!
//! Talks to the Messages API directly and parses its SSE stream by hand.

use super::{classify_response, resolve_credential, EventStream, Provider, ProviderId};
use crate::config;
use crate::error::ProviderError;
use crate::message::{ChatRequest, Role, StopReason, StreamEvent, ToolDefinition, Turn};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Anthropic Messages API endpoint
const API_URL: &str = "https://api.anthropic.com/v1/messages";

/// API version header
const API_VERSION: &str = "2023-06-01";

/// Default model
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Reply budget when the request doesn't set one
const DEFAULT_MAX_TOKENS: u32 = 16384;

pub struct AnthropicProvider {
    client: Client,
    api_key: Option<String>,
    model: String,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        let settings = &config::config().providers.anthropic;
        let api_key = resolve_credential("ANTHROPIC_API_KEY", settings.api_key.as_ref());
        let model = std::env::var("TANDEM_ANTHROPIC_MODEL")
            .ok()
            .or_else(|| settings.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Self {
            client: Client::new(),
            api_key,
            model,
        }
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    async fn stream(&self, request: &ChatRequest) -> Result<EventStream, ProviderError> {
        let Some(api_key) = self.api_key.clone() else {
            return Err(ProviderError::NotConfigured(ProviderId::Anthropic));
        };

        let api_request = ApiRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: build_system_param(request),
            messages: format_messages(&request.messages),
            tools: format_tools(&request.tools),
            temperature: request.temperature,
            stream: true,
        };

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_secs(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &body, retry_after));
        }

        // Channel-backed stream: a spawned task pumps SSE events into the
        // receiver the caller consumes.
        let (tx, rx) = mpsc::channel::<Result<StreamEvent, ProviderError>>(100);

        tokio::spawn(async move {
            if let Err(err) = pump_sse(response, tx.clone()).await {
                let _ = tx.send(Err(err)).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Read the SSE body and forward normalized events.
async fn pump_sse(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<StreamEvent, ProviderError>>,
) -> Result<(), ProviderError> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut tool_open = false;
    let mut input_tokens: Option<u64> = None;
    let mut output_tokens: Option<u64> = None;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| ProviderError::Transport(e.to_string()))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(event) = parse_sse_event(&mut buffer) {
            let events = process_sse_event(
                &event,
                &mut tool_open,
                &mut input_tokens,
                &mut output_tokens,
            )?;
            for stream_event in events {
                if tx.send(Ok(stream_event)).await.is_err() {
                    return Ok(()); // Receiver dropped
                }
            }
        }
    }

    // Usage arrives split across message_start and message_delta; forward the
    // final view once the body is exhausted.
    if input_tokens.is_some() || output_tokens.is_some() {
        let _ = tx
            .send(Ok(StreamEvent::TokenUsage {
                input_tokens,
                output_tokens,
            }))
            .await;
    }

    Ok(())
}

/// Parse a single SSE event from the buffer
fn parse_sse_event(buffer: &mut String) -> Option<SseEvent> {
    // Look for complete event (ends with double newline)
    let event_end = buffer.find("\n\n")?;
    let event_str = buffer[..event_end].to_string();
    buffer.drain(..event_end + 2);

    let mut event_type = String::new();
    let mut data = String::new();

    for line in event_str.lines() {
        if let Some(rest) = line.strip_prefix("event: ") {
            event_type = rest.to_string();
        } else if let Some(rest) = line.strip_prefix("data: ") {
            data = rest.to_string();
        }
    }

    if event_type.is_empty() && data.is_empty() {
        return None;
    }

    Some(SseEvent { event_type, data })
}

struct SseEvent {
    event_type: String,
    data: String,
}

fn process_sse_event(
    event: &SseEvent,
    tool_open: &mut bool,
    input_tokens: &mut Option<u64>,
    output_tokens: &mut Option<u64>,
) -> Result<Vec<StreamEvent>, ProviderError> {
    let mut events = Vec::new();

    match event.event_type.as_str() {
        "message_start" => {
            if let Ok(parsed) = serde_json::from_str::<MessageStartEvent>(&event.data) {
                if let Some(usage) = parsed.message.usage {
                    *input_tokens = usage.input_tokens.map(u64::from);
                }
            }
        }
        "content_block_start" => {
            if let Ok(parsed) = serde_json::from_str::<ContentBlockStartEvent>(&event.data) {
                if let ApiContentBlockStart::ToolUse { id, name } = parsed.content_block {
                    *tool_open = true;
                    events.push(StreamEvent::ToolUseStart { id, name });
                }
            }
        }
        "content_block_delta" => {
            if let Ok(parsed) = serde_json::from_str::<ContentBlockDeltaEvent>(&event.data) {
                match parsed.delta {
                    ApiDelta::TextDelta { text } => {
                        events.push(StreamEvent::TextDelta(text));
                    }
                    ApiDelta::InputJsonDelta { partial_json } => {
                        events.push(StreamEvent::ToolInputDelta(partial_json));
                    }
                }
            }
        }
        "content_block_stop" => {
            if std::mem::take(tool_open) {
                events.push(StreamEvent::ToolUseEnd);
            }
        }
        "message_delta" => {
            if let Ok(parsed) = serde_json::from_str::<MessageDeltaEvent>(&event.data) {
                if let Some(usage) = parsed.usage {
                    *output_tokens = usage.output_tokens.map(u64::from);
                }
                if let Some(stop_reason) = parsed.delta.stop_reason {
                    events.push(StreamEvent::MessageEnd {
                        stop_reason: Some(StopReason::from_vendor(&stop_reason)),
                    });
                }
            }
        }
        "message_stop" | "ping" => {
            // Final stop already surfaced via message_delta; ping is keepalive
        }
        "error" => {
            crate::logging::error(&format!("anthropic stream error: {}", event.data));
            return Err(stream_error(&event.data));
        }
        _ => {
            // Unknown event type, ignore
        }
    }

    Ok(events)
}

/// Classify an in-stream error payload.
fn stream_error(data: &str) -> ProviderError {
    let message = serde_json::from_str::<Value>(data)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| data.to_string());
    if data.contains("rate_limit") {
        ProviderError::RateLimited {
            message,
            retry_after_secs: None,
        }
    } else {
        ProviderError::Transport(message)
    }
}

fn format_messages(messages: &[Turn]) -> Vec<ApiMessage> {
    messages
        .iter()
        .filter(|turn| turn.role != Role::System)
        .map(|turn| {
            let mut content = Vec::new();
            if !turn.content.is_empty() {
                content.push(ApiContentBlock::Text {
                    text: turn.content.clone(),
                });
            }
            for call in &turn.tool_calls {
                content.push(ApiContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    // input must be an object, not null
                    input: if call.input.is_null() {
                        serde_json::json!({})
                    } else {
                        call.input.clone()
                    },
                });
            }
            ApiMessage {
                role: match turn.role {
                    Role::Assistant => "assistant".to_string(),
                    _ => "user".to_string(),
                },
                content,
            }
        })
        .filter(|msg| !msg.content.is_empty())
        .collect()
}

/// System text is the request's system prompt plus any system-role turns.
fn build_system_param(request: &ChatRequest) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(ref system) = request.system {
        if !system.is_empty() {
            parts.push(system);
        }
    }
    for turn in &request.messages {
        if turn.role == Role::System && !turn.content.is_empty() {
            parts.push(&turn.content);
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

fn format_tools(tools: &[ToolDefinition]) -> Option<Vec<ApiTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| ApiTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect(),
    )
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    content: Vec<ApiContentBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: Value,
}

// Response types for SSE parsing

#[derive(Deserialize)]
struct MessageStartEvent {
    message: MessageStartMessage,
}

#[derive(Deserialize)]
struct MessageStartMessage {
    usage: Option<UsageInfo>,
}

#[derive(Deserialize)]
struct ContentBlockStartEvent {
    #[allow(dead_code)]
    index: u32,
    content_block: ApiContentBlockStart,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ApiContentBlockStart {
    #[serde(rename = "text")]
    Text {
        #[allow(dead_code)]
        text: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
}

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    #[allow(dead_code)]
    index: u32,
    delta: ApiDelta,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ApiDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    delta: MessageDeltaDelta,
    usage: Option<UsageInfo>,
}

#[derive(Deserialize)]
struct MessageDeltaDelta {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct UsageInfo {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}
