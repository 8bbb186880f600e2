//! Streaming Claude Messages API client.
//!
//! Sends `stream: true` requests and turns the server-sent events into a
//! [`ChunkStream`] of text deltas. Effort levels map onto the extended
//! thinking budget.

use super::service::{ChunkStream, ServiceCall, ServiceError, TextService};
use super::sse::{SseEvent, SseParser};
use super::EffortLevel;
use crate::config::DispatchConfig;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;

// ── Constants ───────────────────────────────────────────────────────

/// Anthropic Messages API endpoint.
const API_URL: &str = "https://api.anthropic.com/v1/messages";

/// API version header value.
const API_VERSION: &str = "2023-06-01";

/// Output tokens reserved on top of the thinking budget.
const ANSWER_TOKENS: u32 = 1024;

// ── Content blocks ──────────────────────────────────────────────────

/// A single content block in a message (text, tool_use, or tool_result).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

// ── Message ─────────────────────────────────────────────────────────

/// A conversation message with role and content blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// Create a user message from plain text.
    pub fn user(text: &str) -> Self {
        Self::text_message("user", text)
    }

    pub fn assistant(text: &str) -> Self {
        Self::text_message("assistant", text)
    }

    fn text_message(role: &str, text: &str) -> Self {
        Self {
            role: role.to_string(),
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        }
    }

    /// Concatenate all text blocks into a single string.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

// ── Tool definition ─────────────────────────────────────────────────

/// A tool definition for the Claude API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

// ── API request ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: &'a Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Value>,
}

/// What one server-sent event means for the text stream.
#[derive(Debug, PartialEq)]
enum StreamEvent {
    Text(String),
    /// A content block that is not text, such as `tool_use`
    NonText(String),
    Stop,
    Failed { status: u16, message: String },
    Ignore,
}

/// HTTP-equivalent status for a streamed `error` event type.
fn error_type_status(kind: &str) -> u16 {
    match kind {
        "invalid_request_error" => 400,
        "authentication_error" => 401,
        "permission_error" => 403,
        "not_found_error" => 404,
        "request_too_large" => 413,
        "rate_limit_error" => 429,
        "overloaded_error" => 529,
        _ => 500,
    }
}

fn parse_event(event: &SseEvent) -> Result<StreamEvent, ServiceError> {
    if event.data.trim().is_empty() {
        return Ok(StreamEvent::Ignore);
    }
    let value: Value = serde_json::from_str(&event.data)
        .map_err(|e| ServiceError::Format(format!("bad stream event: {}", e)))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .or(event.event.as_deref())
        .unwrap_or_default();

    Ok(match kind {
        "content_block_delta" => {
            let delta = &value["delta"];
            match (delta["type"].as_str(), delta["text"].as_str()) {
                (Some("text_delta"), Some(text)) if !text.is_empty() => {
                    StreamEvent::Text(text.to_string())
                }
                _ => StreamEvent::Ignore,
            }
        }
        "content_block_start" => match value["content_block"]["type"].as_str() {
            Some("text") | None => StreamEvent::Ignore,
            Some(other) => StreamEvent::NonText(other.to_string()),
        },
        "message_stop" => StreamEvent::Stop,
        "error" => {
            let error = &value["error"];
            StreamEvent::Failed {
                status: error_type_status(error["type"].as_str().unwrap_or_default()),
                message: error["message"]
                    .as_str()
                    .unwrap_or("stream error")
                    .to_string(),
            }
        }
        _ => StreamEvent::Ignore,
    })
}

struct StreamState {
    bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    parser: SseParser,
    pending: VecDeque<Result<String, ServiceError>>,
    done: bool,
}

impl StreamState {
    fn absorb(&mut self, chunk: &[u8]) {
        for event in self.parser.push(chunk) {
            match parse_event(&event) {
                Ok(StreamEvent::Text(text)) => self.pending.push_back(Ok(text)),
                Ok(StreamEvent::Ignore) => {}
                Ok(StreamEvent::NonText(kind)) => {
                    log::debug!("[Dispatch] skipping {} block, only text is streamed", kind);
                }
                Ok(StreamEvent::Stop) => {
                    self.done = true;
                    return;
                }
                Ok(StreamEvent::Failed { status, message }) => {
                    self.pending
                        .push_back(Err(ServiceError::Api { status, message }));
                    self.done = true;
                    return;
                }
                Err(e) => {
                    self.pending.push_back(Err(e));
                    self.done = true;
                    return;
                }
            }
        }
    }
}

fn text_stream(bytes: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>) -> ChunkStream {
    let state = StreamState {
        bytes,
        parser: SseParser::new(),
        pending: VecDeque::new(),
        done: false,
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => state.absorb(&chunk),
                Some(Err(e)) => {
                    state.pending.push_back(Err(ServiceError::from(e)));
                    state.done = true;
                }
                None => {
                    log::debug!("[Dispatch] event stream closed without message_stop");
                    state.done = true;
                }
            }
        }
    }))
}

// ── Client ──────────────────────────────────────────────────────────

/// A streaming Claude API client.
#[derive(Debug, Clone)]
pub struct ClaudeClient {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
    max_tokens: u32,
}

impl ClaudeClient {
    pub fn new(api_key: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            api_url: API_URL.to_string(),
            max_tokens,
        }
    }

    /// Create a client from the `ANTHROPIC_API_KEY` environment variable.
    pub fn from_env(config: &DispatchConfig) -> Result<Self, ServiceError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ServiceError::MissingApiKey)?;
        Ok(Self::new(api_key, config.max_tokens))
    }

    /// Point the client at a different Messages endpoint.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    fn request_body(&self, call: &ServiceCall) -> Value {
        let budget = call.effort.thinking_budget();
        let max_tokens = match budget {
            Some(budget) => self.max_tokens.max(budget + ANSWER_TOKENS),
            None => self.max_tokens,
        };
        let body = ApiRequest {
            model: &call.model,
            max_tokens,
            stream: true,
            system: call.system.as_deref(),
            messages: &call.messages,
            tools: &call.tools,
            thinking: budget.map(|b| json!({"type": "enabled", "budget_tokens": b})),
        };
        serde_json::to_value(&body).unwrap_or(Value::Null)
    }

    async fn open_stream(&self, call: &ServiceCall) -> Result<ChunkStream, ServiceError> {
        let body = self.request_body(call);
        if body.is_null() {
            return Err(ServiceError::Format("request could not be encoded".to_string()));
        }

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ServiceError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed();
        Ok(text_stream(bytes))
    }
}

impl TextService for ClaudeClient {
    fn open(
        &self,
        call: &ServiceCall,
    ) -> impl std::future::Future<Output = Result<ChunkStream, ServiceError>> + Send {
        self.open_stream(call)
    }
}

impl EffortLevel {
    /// Extended-thinking token budget; `None` disables thinking.
    pub fn thinking_budget(&self) -> Option<u32> {
        match self {
            EffortLevel::High => Some(8192),
            EffortLevel::Medium => Some(4096),
            EffortLevel::Low => Some(2048),
            EffortLevel::Minimal => None,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
