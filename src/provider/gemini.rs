//! Gemini generateContent adapter
//!
//! Streams via `streamGenerateContent?alt=sse`. Unlike the other backends,
//! Gemini delivers function-call arguments whole, so each call surfaces as a
//! start / single input delta / end triple.

use super::{classify_response, resolve_credential, EventStream, Provider, ProviderId};
use crate::config;
use crate::error::ProviderError;
use crate::id::new_id;
use crate::message::{ChatRequest, Role, StopReason, StreamEvent, ToolDefinition, Turn};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const DEFAULT_MODEL: &str = "gemini-2.5-pro";

const DEFAULT_MAX_TOKENS: u32 = 16384;

pub struct GeminiProvider {
    client: Client,
    api_key: Option<String>,
    model: String,
}

impl GeminiProvider {
    pub fn new() -> Self {
        let settings = &config::config().providers.gemini;
        let api_key = resolve_credential("GEMINI_API_KEY", settings.api_key.as_ref());
        let model = std::env::var("TANDEM_GEMINI_MODEL")
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

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Provider for GeminiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    fn model(&self) -> String {
        self.model.clone()
    }

    fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    async fn stream(&self, request: &ChatRequest) -> Result<EventStream, ProviderError> {
        let Some(api_key) = self.api_key.clone() else {
            return Err(ProviderError::NotConfigured(ProviderId::Gemini));
        };

        let url = format!("{}/{}:streamGenerateContent?alt=sse", API_BASE, self.model);
        let api_request = ApiRequest {
            contents: format_contents(&request.messages),
            system_instruction: build_system_instruction(request),
            generation_config: Some(GenerationConfig {
                max_output_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                temperature: request.temperature,
            }),
            tools: format_tools(&request.tools),
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &api_key)
            .header("content-type", "application/json")
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

        let (tx, rx) = mpsc::channel::<Result<StreamEvent, ProviderError>>(100);

        tokio::spawn(async move {
            if let Err(err) = pump_sse(response, tx.clone()).await {
                let _ = tx.send(Err(err)).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Read the SSE body and forward normalized events. Gemini repeats
/// usageMetadata on every chunk, so only the final view is forwarded.
async fn pump_sse(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<StreamEvent, ProviderError>>,
) -> Result<(), ProviderError> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut input_tokens: Option<u64> = None;
    let mut output_tokens: Option<u64> = None;
    let mut finish: Option<StopReason> = None;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| ProviderError::Transport(e.to_string()))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end().to_string();
            buffer.drain(..pos + 1);

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let Ok(chunk) = serde_json::from_str::<ApiChunk>(data) else {
                continue;
            };

            if let Some(usage) = &chunk.usage_metadata {
                input_tokens = usage.prompt_token_count.or(input_tokens);
                output_tokens = usage.candidates_token_count.or(output_tokens);
            }

            for event in convert_chunk(&chunk, &mut finish) {
                if tx.send(Ok(event)).await.is_err() {
                    return Ok(()); // Receiver dropped
                }
            }
        }
    }

    if input_tokens.is_some() || output_tokens.is_some() {
        let _ = tx
            .send(Ok(StreamEvent::TokenUsage {
                input_tokens,
                output_tokens,
            }))
            .await;
    }
    let _ = tx
        .send(Ok(StreamEvent::MessageEnd {
            stop_reason: finish,
        }))
        .await;

    Ok(())
}

fn convert_chunk(chunk: &ApiChunk, finish: &mut Option<StopReason>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let Some(candidate) = chunk.candidates.first() else {
        return events;
    };

    if let Some(content) = &candidate.content {
        for part in &content.parts {
            if let Some(text) = &part.text {
                if !text.is_empty() {
                    events.push(StreamEvent::TextDelta(text.clone()));
                }
            }
            if let Some(call) = &part.function_call {
                events.push(StreamEvent::ToolUseStart {
                    id: new_id("call"),
                    name: call.name.clone(),
                });
                events.push(StreamEvent::ToolInputDelta(call.args.to_string()));
                events.push(StreamEvent::ToolUseEnd);
            }
        }
    }

    if let Some(reason) = &candidate.finish_reason {
        *finish = Some(StopReason::from_vendor(reason));
    }

    events
}

fn format_contents(messages: &[Turn]) -> Vec<ApiContent> {
    messages
        .iter()
        .filter(|turn| turn.role != Role::System && !turn.content.is_empty())
        .map(|turn| ApiContent {
            role: Some(
                match turn.role {
                    Role::Assistant => "model",
                    _ => "user",
                }
                .to_string(),
            ),
            parts: vec![ApiPart {
                text: turn.content.clone(),
            }],
        })
        .collect()
}

fn build_system_instruction(request: &ChatRequest) -> Option<ApiContent> {
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
        return None;
    }
    Some(ApiContent {
        role: None,
        parts: vec![ApiPart {
            text: parts.join("\n\n"),
        }],
    })
}

fn format_tools(tools: &[ToolDefinition]) -> Option<Vec<ApiToolDecl>> {
    if tools.is_empty() {
        return None;
    }
    Some(vec![ApiToolDecl {
        function_declarations: tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            })
            .collect(),
    }])
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Serialize)]
struct ApiRequest {
    contents: Vec<ApiContent>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ApiContent>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiToolDecl>>,
}

#[derive(Serialize)]
struct ApiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<ApiPart>,
}

#[derive(Serialize)]
struct ApiPart {
    text: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ApiToolDecl {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

// Response types for SSE parsing

#[derive(Deserialize)]
struct ApiChunk {
    #[serde(default)]
    candidates: Vec<ApiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct ApiCandidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<ApiFunctionCall>,
}

#[derive(Deserialize)]
struct ApiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_text_chunk() {
        let chunk: ApiChunk = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"hello"}]}}]}"#,
        )
        .unwrap();
        let mut finish = None;
        let events = convert_chunk(&chunk, &mut finish);
        assert!(matches!(&events[0], StreamEvent::TextDelta(t) if t == "hello"));
        assert!(finish.is_none());
    }

    #[test]
    fn test_convert_function_call_chunk() {
        let chunk: ApiChunk = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"grep","args":{"pattern":"fn main"}}}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        let mut finish = None;
        let events = convert_chunk(&chunk, &mut finish);
        assert!(matches!(&events[0], StreamEvent::ToolUseStart { name, .. } if name == "grep"));
        assert!(
            matches!(&events[1], StreamEvent::ToolInputDelta(args) if args.contains("fn main"))
        );
        assert!(matches!(&events[2], StreamEvent::ToolUseEnd));
        assert_eq!(finish, Some(StopReason::End));
    }

    #[test]
    fn test_finish_reason_max_tokens() {
        let chunk: ApiChunk = serde_json::from_str(
            r#"{"candidates":[{"finishReason":"MAX_TOKENS"}],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":9}}"#,
        )
        .unwrap();
        let mut finish = None;
        let events = convert_chunk(&chunk, &mut finish);
        assert!(events.is_empty());
        assert_eq!(finish, Some(StopReason::MaxTokens));
        assert_eq!(chunk.usage_metadata.unwrap().prompt_token_count, Some(5));
    }

    #[test]
    fn test_assistant_turns_map_to_model_role() {
        let messages = vec![
            Turn::user("hi"),
            Turn::assistant("hello", ProviderId::Gemini),
        ];
        let contents = format_contents(&messages);
        assert_eq!(contents[0].role.as_deref(), Some("user"));
        assert_eq!(contents[1].role.as_deref(), Some("model"));
    }
}
