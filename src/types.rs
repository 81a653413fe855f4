//! Core types: conversation model, agent options, OpenAI wire format

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Answer returned when the completion service gives us nothing usable.
pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "Sorry, I got a weird response from the assistant. Please try again.";

/// Options for configuring the orchestration loop
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// System instructions sent with every completion request
    pub system_prompt: String,

    /// Number of prior conversation turns included in each request
    pub history_window: usize,

    /// Upper bound on tool rounds for one user request
    pub max_tool_rounds: u32,

    /// Deadline for connecting + tool discovery, and for each tool round.
    /// `None` waits indefinitely.
    pub tool_timeout: Option<Duration>,

    /// User-facing answer when the model response is unusable
    pub fallback_message: String,

    /// Backoff policy for completion-service calls
    pub retry: RetryConfig,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            history_window: 10,
            max_tool_rounds: 10,
            tool_timeout: Some(Duration::from_secs(60)),
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl AgentOptions {
    pub fn builder() -> AgentOptionsBuilder {
        AgentOptionsBuilder::default()
    }
}

/// Validating builder; see [`AgentOptions::builder`]
#[derive(Debug, Default)]
pub struct AgentOptionsBuilder {
    system_prompt: Option<String>,
    history_window: Option<usize>,
    max_tool_rounds: Option<u32>,
    tool_timeout: Option<Option<Duration>>,
    fallback_message: Option<String>,
    retry: Option<RetryConfig>,
}

impl AgentOptionsBuilder {
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn history_window(mut self, turns: usize) -> Self {
        self.history_window = Some(turns);
        self
    }

    pub fn max_tool_rounds(mut self, rounds: u32) -> Self {
        self.max_tool_rounds = Some(rounds);
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(Some(timeout));
        self
    }

    /// Let tool calls run without a deadline.
    pub fn no_tool_timeout(mut self) -> Self {
        self.tool_timeout = Some(None);
        self
    }

    pub fn fallback_message(mut self, message: impl Into<String>) -> Self {
        self.fallback_message = Some(message.into());
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> crate::Result<AgentOptions> {
        let defaults = AgentOptions::default();

        let max_tool_rounds = self.max_tool_rounds.unwrap_or(defaults.max_tool_rounds);
        if max_tool_rounds == 0 {
            return Err(crate::Error::config("max_tool_rounds must be at least 1"));
        }

        let fallback_message = self.fallback_message.unwrap_or(defaults.fallback_message);
        if fallback_message.trim().is_empty() {
            return Err(crate::Error::config("fallback_message cannot be empty"));
        }

        Ok(AgentOptions {
            system_prompt: self.system_prompt.unwrap_or_default(),
            history_window: self.history_window.unwrap_or(defaults.history_window),
            max_tool_rounds,
            tool_timeout: self.tool_timeout.unwrap_or(defaults.tool_timeout),
            fallback_message,
            retry: self.retry.unwrap_or(defaults.retry),
        })
    }
}

/// Who authored a [`Message`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    /// Batched tool results for the preceding assistant turn
    Tool,
}

/// Typed pieces of message content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

/// Text content block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextBlock {
    pub text: String,
}

impl TextBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl ToolUseBlock {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// Tool result block, already rendered to text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResultBlock {
    pub fn success(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: message.into(),
            is_error: true,
        }
    }
}

/// One turn of the working conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentBlock::Text(TextBlock::new(text))],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::assistant(vec![ContentBlock::Text(TextBlock::new(text))])
    }

    /// One batched turn carrying every result of a tool round
    pub fn tool_results(results: Vec<ToolResultBlock>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: results.into_iter().map(ContentBlock::ToolResult).collect(),
        }
    }

    /// Text of the first text block, if any
    pub fn first_text(&self) -> Option<&str> {
        first_text(&self.content)
    }

    /// Tool invocations requested by this message, in order
    pub fn tool_uses(&self) -> impl Iterator<Item = &ToolUseBlock> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse(tool_use) => Some(tool_use),
            _ => None,
        })
    }
}

/// First text block in a content list
pub fn first_text(content: &[ContentBlock]) -> Option<&str> {
    content.iter().find_map(|block| match block {
        ContentBlock::Text(text) => Some(text.text.as_str()),
        _ => None,
    })
}

/// Author of a stored conversation turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
}

/// A prior turn as supplied by the document store: plain role + text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryTurn {
    pub role: HistoryRole,
    pub text: String,
}

impl HistoryTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::Assistant,
            text: text.into(),
        }
    }
}

impl From<HistoryTurn> for Message {
    fn from(turn: HistoryTurn) -> Self {
        match turn.role {
            HistoryRole::User => Message::user(turn.text),
            HistoryRole::Assistant => Message::assistant_text(turn.text),
        }
    }
}

/// One entry of `messages` in a chat-completions request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenAIMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// A tool call the assistant made, replayed in later requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenAIToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: OpenAIFunction,
}

/// Name and JSON-encoded arguments of a replayed tool call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenAIFunction {
    pub name: String,
    pub arguments: String,
}

/// Body of a streaming `/chat/completions` request
#[derive(Debug, Clone, Serialize)]
pub struct OpenAIRequest {
    pub model: String,
    pub messages: Vec<OpenAIMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
}

/// One `data:` payload of the completion stream
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: OpenAIDelta,
    pub finish_reason: Option<String>,
}

/// Incremental assistant output carried by a chunk
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAIDelta {
    pub role: Option<String>,
    pub content: Option<String>,
    pub tool_calls: Option<Vec<OpenAIToolCallDelta>>,
}

/// Fragment of a tool call; fragments sharing `index` belong together
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub call_type: Option<String>,
    pub function: Option<OpenAIFunctionDelta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIFunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}
