//! Anthropic Messages API streaming transport

use super::types::{ContentBlock, LlmRequest, Message};
use super::{BlockKind, Delta, EventStream, LlmError, LlmTransport, StopReason, StreamEvent};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Display;
use std::time::Duration;

const API_VERSION: &str = "2023-06-01";

/// Anthropic service implementation
pub struct AnthropicTransport {
    client: Client,
    api_key: String,
    endpoint: String,
    model_id: String,
}

impl AnthropicTransport {
    pub fn new(api_key: String, base_url: &str, model_id: &str) -> Result<Self, LlmError> {
        // No total timeout: a healthy stream may stay open for minutes
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LlmError::unknown(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            endpoint: format!("{}/v1/messages", base_url.trim_end_matches('/')),
            model_id: model_id.to_string(),
        })
    }

    fn translate_request(request: &LlmRequest) -> AnthropicRequest {
        let messages = request.messages.iter().map(Self::translate_message).collect();

        let tools: Vec<AnthropicTool> = request
            .tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect();

        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            stream: true,
            system: request.system_prompt.clone(),
            messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
        }
    }

    fn translate_message(msg: &Message) -> AnthropicMessage {
        let content = msg
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => AnthropicContentBlock::Text { text: text.clone() },
                ContentBlock::ToolUse { id, name, input } => AnthropicContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    // The API requires an object; unparseable input was already
                    // answered with an error result
                    input: input
                        .clone()
                        .unwrap_or_else(|| Value::Object(Map::new())),
                },
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => AnthropicContentBlock::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: content.clone(),
                    is_error: *is_error,
                },
            })
            .collect();

        AnthropicMessage {
            role: msg.role.as_str(),
            content,
        }
    }

    fn classify_error(status: reqwest::StatusCode, body: &str) -> LlmError {
        let message = body.to_string();
        match status.as_u16() {
            401 | 403 => LlmError::auth(format!("Authentication failed: {message}")),
            429 => {
                let mut err = LlmError::rate_limit(format!("Rate limited: {message}"));
                if let Ok(parsed) = serde_json::from_str::<Value>(body) {
                    if let Some(retry_after) = parsed
                        .get("error")
                        .and_then(|e| e.get("retry_after"))
                        .and_then(Value::as_f64)
                    {
                        err = err.with_retry_after(Duration::from_secs_f64(retry_after));
                    }
                }
                err
            }
            400 => LlmError::invalid_request(format!("Invalid request: {message}")),
            500..=599 => LlmError::server_error(format!("Server error: {message}")),
            _ => LlmError::unknown(format!("HTTP {status}: {message}")),
        }
    }

    fn classify_reqwest_error(e: &reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::network(format!("Request timeout: {e}"))
        } else if e.is_connect() {
            LlmError::network(format!("Connection failed: {e}"))
        } else {
            LlmError::unknown(format!("Request failed: {e}"))
        }
    }
}

#[async_trait]
impl LlmTransport for AnthropicTransport {
    async fn stream(&self, request: &LlmRequest) -> Result<EventStream, LlmError> {
        let anthropic_request = Self::translate_request(request);

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&anthropic_request)
            .send()
            .await
            .map_err(|e| Self::classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|e| LlmError::network(format!("Failed to read error body: {e}")))?;
            return Err(Self::classify_error(status, &body));
        }

        Ok(Box::pin(decode_sse(response.bytes_stream())))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Decode a raw SSE byte stream into stream events
pub(crate) fn decode_sse<S, B, E>(bytes: S) -> impl Stream<Item = Result<StreamEvent, LlmError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    bytes.eventsource().filter_map(|item| {
        let mapped = match item {
            Ok(event) => parse_sse_event(&event.event, &event.data).transpose(),
            Err(e) => Some(Err(LlmError::stream(format!("SSE stream error: {e}")))),
        };
        futures::future::ready(mapped)
    })
}

/// Translate one SSE frame. Frames that carry nothing the assembler needs
/// map to `Ok(None)`.
pub(crate) fn parse_sse_event(event_type: &str, data: &str) -> Result<Option<StreamEvent>, LlmError> {
    match event_type {
        "ping" | "message_start" | "content_block_stop" => Ok(None),
        "content_block_start" => {
            let parsed: SseContentBlockStart = parse_data(event_type, data)?;
            let mut block = parsed.content_block;
            let kind = match block.get("type").and_then(Value::as_str) {
                Some("text") => BlockKind::Text,
                Some("tool_use") => {
                    let id = take_string(&mut block, "id");
                    let name = take_string(&mut block, "name");
                    match (id, name) {
                        (Some(id), Some(name)) => BlockKind::ToolUse { id, name },
                        _ => {
                            return Err(LlmError::stream(
                                "tool_use block start without id or name",
                            ))
                        }
                    }
                }
                Some(other) => BlockKind::Other(other.to_string()),
                None => BlockKind::Other("untyped".to_string()),
            };
            Ok(Some(StreamEvent::BlockStart {
                index: parsed.index,
                kind,
            }))
        }
        "content_block_delta" => {
            let parsed: SseContentBlockDelta = parse_data(event_type, data)?;
            let mut fields = parsed.delta;
            let kind = match fields.remove("type") {
                Some(Value::String(kind)) => kind,
                _ => "untyped".to_string(),
            };
            let delta = match kind.as_str() {
                "text_delta" => Delta::Text {
                    text: take_string(&mut fields, "text").unwrap_or_default(),
                },
                "input_json_delta" => Delta::InputJson {
                    partial_json: take_string(&mut fields, "partial_json").unwrap_or_default(),
                },
                _ => Delta::Other { kind, fields },
            };
            Ok(Some(StreamEvent::BlockDelta {
                index: parsed.index,
                delta,
            }))
        }
        "message_delta" => {
            let parsed: SseMessageDelta = parse_data(event_type, data)?;
            Ok(Some(StreamEvent::MessageDelta {
                stop_reason: parsed.delta.stop_reason.map(StopReason::from),
            }))
        }
        "message_stop" => Ok(Some(StreamEvent::MessageStop)),
        "error" => {
            let parsed: SseError = parse_data(event_type, data)?;
            Ok(Some(StreamEvent::Error {
                message: format!("{}: {}", parsed.error.error_type, parsed.error.message),
            }))
        }
        other => {
            tracing::debug!(event = %other, "Ignoring unknown SSE event type");
            Ok(None)
        }
    }
}

fn parse_data<T: for<'de> Deserialize<'de>>(event_type: &str, data: &str) -> Result<T, LlmError> {
    serde_json::from_str(data)
        .map_err(|e| LlmError::stream(format!("Failed to parse {event_type}: {e}")))
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

// Anthropic API types

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    system: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct SseContentBlockStart {
    index: usize,
    content_block: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct SseContentBlockDelta {
    index: usize,
    delta: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct SseMessageDelta {
    delta: SseMessageDeltaInner,
}

#[derive(Debug, Deserialize)]
struct SseMessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseError {
    error: SseErrorInfo,
}

#[derive(Debug, Deserialize)]
struct SseErrorInfo {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}
