use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
///
/// `arguments` is the raw JSON text as produced by the model; it is parsed
/// lazily because streamed arguments arrive as text deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    /// Parse the argument text into a JSON value. Empty arguments parse to
    /// an empty object so tools with no parameters validate cleanly.
    pub fn parsed_arguments(&self) -> Result<serde_json::Value, Error> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.arguments).map_err(Error::Json)
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on `Role::Tool` messages to correlate the result with its request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
}

impl FinishReason {
    /// Map a provider finish-reason string. Unknown strings fall back to
    /// `Stop` (the conservative choice: the loop terminates).
    pub fn parse(s: &str) -> Self {
        match s {
            "stop" | "end_turn" => Self::Stop,
            "tool_calls" | "tool_use" => Self::ToolCalls,
            "length" | "max_tokens" => Self::Length,
            other => {
                tracing::warn!(finish_reason = other, "unknown finish_reason, treating as stop");
                Self::Stop
            }
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// A request to the model backend.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
}

/// A finalized response from the model backend.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: Message,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
}

/// Definition of a tool the model can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// One partial unit of a streamed model response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseFragment {
    /// Text appended to the assistant message, if any.
    #[serde(default)]
    pub content: Option<String>,
    /// Partial tool-call data carried by this fragment.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDelta>,
    /// Token counters. Usually present only on the final fragment.
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    /// Raw provider finish-reason string, when this fragment carries one.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Partial tool-call data inside one fragment.
///
/// `index` identifies which tool call of the assistant turn this delta
/// belongs to; `arguments` text is concatenated across fragments sharing an
/// index. A delta with no index cannot be merged and is a protocol error.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolCallDelta {
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

/// Ordered, append-only message history.
///
/// The first element is always the system message. Only the engine appends,
/// and only `compact` replaces the history (with a 2-element summary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn last_role(&self) -> Option<Role> {
        self.messages.last().map(|m| m.role)
    }

    /// Verify the trailing message allows a model query (user or tool).
    /// Anything else means the history was corrupted somewhere upstream.
    pub fn check_ready_for_query(&self) -> Result<(), Error> {
        match self.last_role() {
            Some(Role::User) | Some(Role::Tool) => Ok(()),
            Some(role) => Err(Error::Desync(format!(
                "trailing message has role {role:?}, expected user or tool"
            ))),
            None => Err(Error::Desync("conversation is empty".into())),
        }
    }

    /// Replace the history with `[system, summary]`, preserving the original
    /// system message. The summary is stored as a user message so a model
    /// query remains valid immediately after compaction.
    pub fn compact(&mut self, summary: impl Into<String>) {
        let system = self
            .messages
            .first()
            .cloned()
            .unwrap_or_else(|| Message::system(""));
        self.messages = vec![system, Message::user(summary)];
    }

    /// Drop everything but the system message.
    pub fn clear(&mut self) {
        self.messages.truncate(1);
    }
}
