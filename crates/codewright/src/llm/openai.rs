use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::Error;
use crate::llm::types::{
    ChatRequest, ChatResponse, FinishReason, Message, ResponseFragment, Role, TokenUsage,
    ToolCall, ToolCallDelta, ToolDefinition,
};
use crate::llm::{FragmentStream, ModelBackend};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const PROVIDER_NAME: &str = "openai";

/// Maximum bytes of a provider error body kept in diagnostics.
const MAX_DIAGNOSTIC_BYTES: usize = 600;

/// OpenAI-compatible chat-completions backend.
///
/// Works against any endpoint speaking the chat-completions wire format
/// (OpenAI, OpenRouter, local inference servers) via `with_base_url`.
pub struct OpenAiBackend {
    client: Client,
    api_key: String,
    model: String,
    api_url: String,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            api_url: DEFAULT_API_URL.into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response, Error> {
        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            // Sanitize auth failures so API key fragments echoed by the
            // provider never reach logs or the model.
            let message = if status.as_u16() == 401 || status.as_u16() == 403 {
                format!("authentication failed (HTTP {})", status.as_u16())
            } else {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("<body read error: {e}>"));
                truncate_diagnostic(&body)
            };
            return Err(Error::Api {
                status: status.as_u16(),
                message,
                provider: PROVIDER_NAME.into(),
                endpoint: self.api_url.clone(),
            });
        }

        Ok(response)
    }
}

impl ModelBackend for OpenAiBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, Error> {
        let body = build_request_body(&self.model, &request, false);
        let response = self.send(&body).await?;
        let api_response: ApiResponse = response.json().await?;
        into_chat_response(api_response, &self.api_url)
    }

    async fn complete_streaming(&self, request: ChatRequest) -> Result<FragmentStream, Error> {
        let mut body = build_request_body(&self.model, &request, true);
        body["stream_options"] = serde_json::json!({"include_usage": true});

        let response = self.send(&body).await?;
        let mut byte_stream = response.bytes_stream();

        let (mut tx, rx) = futures::channel::mpsc::channel::<Result<ResponseFragment, Error>>(32);
        tokio::spawn(async move {
            use futures::SinkExt;

            let mut buffer = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(Error::Http(e))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Complete SSE events are separated by blank lines
                while let Some(event_end) = buffer.find("\n\n") {
                    let event_text = buffer[..event_end].to_string();
                    buffer.drain(..event_end + 2);

                    match parse_sse_event(&event_text) {
                        SseEvent::Fragment(fragment) => {
                            if tx.send(Ok(fragment)).await.is_err() {
                                return;
                            }
                        }
                        SseEvent::Done => return,
                        SseEvent::Skip => {}
                        SseEvent::Malformed(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(rx))
    }
}

fn truncate_diagnostic(body: &str) -> String {
    if body.len() <= MAX_DIAGNOSTIC_BYTES {
        return body.to_string();
    }
    let mut cut = MAX_DIAGNOSTIC_BYTES;
    while cut > 0 && !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}… [truncated]", &body[..cut])
}

// --- Request building: conversation → chat-completions wire format ---

fn build_request_body(model: &str, request: &ChatRequest, stream: bool) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request.messages.iter().map(message_to_wire).collect();

    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "max_tokens": request.max_tokens,
        "stream": stream,
    });

    if let Some(temperature) = request.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }

    if !request.tools.is_empty() {
        let tools: Vec<serde_json::Value> = request.tools.iter().map(tool_to_wire).collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    body
}

fn message_to_wire(message: &Message) -> serde_json::Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let mut wire = serde_json::json!({ "role": role });

    wire["content"] = match &message.content {
        Some(text) => serde_json::Value::String(text.clone()),
        None => serde_json::Value::Null,
    };

    if !message.tool_calls.is_empty() {
        let calls: Vec<serde_json::Value> = message
            .tool_calls
            .iter()
            .map(|call| {
                serde_json::json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments,
                    }
                })
            })
            .collect();
        wire["tool_calls"] = serde_json::Value::Array(calls);
    }

    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = serde_json::Value::String(id.clone());
    }

    wire
}

fn tool_to_wire(tool: &ToolDefinition) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

// --- Non-streaming response parsing ---

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize, Clone, Copy)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<ApiUsage> for TokenUsage {
    fn from(u: ApiUsage) -> Self {
        Self {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }
    }
}

fn into_chat_response(api: ApiResponse, endpoint: &str) -> Result<ChatResponse, Error> {
    let usage = api.usage.ok_or(Error::MissingUsage)?;
    let choice = api.choices.into_iter().next().ok_or_else(|| Error::Api {
        status: 0,
        message: "empty choices array in response".into(),
        provider: PROVIDER_NAME.into(),
        endpoint: endpoint.into(),
    })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall {
            id: tc.id,
            name: tc.function.name,
            arguments: tc.function.arguments,
        })
        .collect();

    let finish_reason = choice
        .finish_reason
        .as_deref()
        .map(FinishReason::parse)
        .unwrap_or(FinishReason::Stop);

    Ok(ChatResponse {
        message: Message {
            role: Role::Assistant,
            content: choice.message.content.filter(|c| !c.is_empty()),
            tool_calls,
            tool_call_id: None,
        },
        finish_reason,
        usage: usage.into(),
    })
}

// --- Streaming (SSE) parsing ---

enum SseEvent {
    Fragment(ResponseFragment),
    Done,
    Skip,
    Malformed(Error),
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Deserialize, Default)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

fn parse_sse_event(raw: &str) -> SseEvent {
    let Some(data) = raw.lines().find_map(|l| l.strip_prefix("data: ")) else {
        return SseEvent::Skip;
    };

    if data.trim() == "[DONE]" {
        return SseEvent::Done;
    }

    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            return SseEvent::Malformed(Error::MalformedStream(format!(
                "unparseable stream chunk: {e}"
            )));
        }
    };

    SseEvent::Fragment(chunk_to_fragment(chunk))
}

fn chunk_to_fragment(chunk: StreamChunk) -> ResponseFragment {
    let mut fragment = ResponseFragment {
        usage: chunk.usage.map(Into::into),
        ..Default::default()
    };

    // Usage-only chunks (stream_options include_usage) have no choices
    let Some(choice) = chunk.choices.into_iter().next() else {
        return fragment;
    };

    fragment.content = choice.delta.content;
    fragment.finish_reason = choice.finish_reason;
    fragment.tool_calls = choice
        .delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let function = tc.function.unwrap_or_default();
            ToolCallDelta {
                index: tc.index,
                id: tc.id,
                name: function.name,
                arguments: function.arguments.unwrap_or_default(),
            }
        })
        .collect();

    if fragment.content.is_none() && fragment.tool_calls.is_empty() && fragment.finish_reason.is_none() {
        debug!("stream chunk carried no delta content");
    }

    fragment
}
