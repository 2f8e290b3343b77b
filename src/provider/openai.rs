//! OpenAI chat-completions adapter
//!
//! SSE arrives as `data:` lines terminated by a `[DONE]` sentinel; the
//! stream impl buffers lines and converts chunks as they complete.

use super::{classify_response, resolve_credential, EventStream, Provider, ProviderId};
use crate::config;
use crate::error::ProviderError;
use crate::message::{ChatRequest, Role, StopReason, StreamEvent, ToolDefinition, Turn};
use bytes::Bytes;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

const API_URL: &str = "https://api.openai.com/v1/chat/completions";

const DEFAULT_MODEL: &str = "gpt-4o";

const DEFAULT_MAX_TOKENS: u32 = 16384;

pub struct OpenAIProvider {
    client: Client,
    api_key: Option<String>,
    model: String,
}

impl OpenAIProvider {
    pub fn new() -> Self {
        let settings = &config::config().providers.openai;
        let api_key = resolve_credential("OPENAI_API_KEY", settings.api_key.as_ref());
        let model = std::env::var("TANDEM_OPENAI_MODEL")
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

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Provider for OpenAIProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAI
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    async fn stream(&self, request: &ChatRequest) -> Result<EventStream, ProviderError> {
        let Some(api_key) = self.api_key.clone() else {
            return Err(ProviderError::NotConfigured(ProviderId::OpenAI));
        };

        let api_request = ApiRequest {
            model: &self.model,
            messages: convert_messages(&request.messages, request.system.as_deref()),
            tools: convert_tools(&request.tools),
            max_completion_tokens: Some(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
            temperature: request.temperature,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        let response = self
            .client
            .post(API_URL)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &body, retry_after));
        }

        Ok(Box::pin(OpenAIStream::new(response.bytes_stream())))
    }
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCallMessage>>,
}

#[derive(Serialize)]
struct ToolCallMessage {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: FunctionCall,
}

#[derive(Serialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct OpenAITool<'a> {
    #[serde(rename = "type")]
    tool_type: &'a str,
    function: OpenAIFunction<'a>,
}

#[derive(Serialize)]
struct OpenAIFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

fn convert_messages(messages: &[Turn], system: Option<&str>) -> Vec<ApiMessage> {
    let mut result = Vec::with_capacity(messages.len() + 1);

    if let Some(system) = system {
        if !system.is_empty() {
            result.push(ApiMessage {
                role: "system".to_string(),
                content: Some(system.to_string()),
                tool_calls: None,
            });
        }
    }

    for turn in messages {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };

        let tool_calls: Vec<ToolCallMessage> = turn
            .tool_calls
            .iter()
            .map(|call| ToolCallMessage {
                id: call.id.clone(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: call.name.clone(),
                    arguments: serde_json::to_string(&call.input).unwrap_or_default(),
                },
            })
            .collect();

        result.push(ApiMessage {
            role: role.to_string(),
            content: if turn.content.is_empty() {
                None
            } else {
                Some(turn.content.clone())
            },
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        });
    }

    result
}

fn convert_tools(tools: &[ToolDefinition]) -> Option<Vec<OpenAITool<'_>>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|t| OpenAITool {
                tool_type: "function",
                function: OpenAIFunction {
                    name: &t.name,
                    description: &t.description,
                    parameters: &t.input_schema,
                },
            })
            .collect(),
    )
}

#[derive(Deserialize, Debug)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ChunkUsage>,
}

#[derive(Deserialize, Debug)]
struct ChunkUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct Delta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct ToolCallDelta {
    #[allow(dead_code)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

/// Stream wrapper for OpenAI SSE events
struct OpenAIStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    tool_open: bool,
    sent_message_end: bool,
    pending: Vec<StreamEvent>,
}

impl Stream for OpenAIStream {
    type Item = Result<StreamEvent, ProviderError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.next_pending() {
                return Poll::Ready(Some(Ok(event)));
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    if let Ok(text) = std::str::from_utf8(&bytes) {
                        self.buffer.push_str(text);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(ProviderError::Transport(e.to_string()))));
                }
                Poll::Ready(None) => {
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }
    }
}

impl OpenAIStream {
    fn new(stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
            buffer: String::new(),
            tool_open: false,
            sent_message_end: false,
            pending: Vec::new(),
        }
    }

    /// Pop the next queued event, refilling the queue from complete buffered
    /// lines as needed.
    fn next_pending(&mut self) -> Option<StreamEvent> {
        loop {
            if !self.pending.is_empty() {
                return Some(self.pending.remove(0));
            }

            let pos = self.buffer.find('\n')?;
            let line = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 1);

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };

            if data == "[DONE]" {
                if !self.sent_message_end {
                    self.sent_message_end = true;
                    return Some(StreamEvent::MessageEnd { stop_reason: None });
                }
                continue;
            }

            if let Ok(chunk) = serde_json::from_str::<SseChunk>(data) {
                self.convert_chunk(chunk);
            }
        }
    }

    fn convert_chunk(&mut self, chunk: SseChunk) {
        if let Some(usage) = chunk.usage {
            self.pending.push(StreamEvent::TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            });
        }

        let Some(choice) = chunk.choices.first() else {
            return;
        };

        if let Some(content) = &choice.delta.content {
            self.pending.push(StreamEvent::TextDelta(content.clone()));
        }

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for tc in tool_calls {
                // New tool call starting; close out any open one first
                if let Some(id) = &tc.id {
                    if self.tool_open {
                        self.pending.push(StreamEvent::ToolUseEnd);
                    }
                    let name = tc
                        .function
                        .as_ref()
                        .and_then(|f| f.name.clone())
                        .unwrap_or_default();
                    self.tool_open = true;
                    self.pending.push(StreamEvent::ToolUseStart {
                        id: id.clone(),
                        name,
                    });
                }

                // Argument fragments stream through to the consumer
                if let Some(args) = tc.function.as_ref().and_then(|f| f.arguments.as_ref()) {
                    if !args.is_empty() {
                        self.pending.push(StreamEvent::ToolInputDelta(args.clone()));
                    }
                }
            }
        }

        if let Some(reason) = &choice.finish_reason {
            if self.tool_open {
                self.tool_open = false;
                self.pending.push(StreamEvent::ToolUseEnd);
            }
            self.sent_message_end = true;
            self.pending.push(StreamEvent::MessageEnd {
                stop_reason: Some(StopReason::from_vendor(reason)),
            });
        }
    }
}
