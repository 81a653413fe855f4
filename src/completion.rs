//! Completion-service interface
//!
//! The orchestration loop talks to a language model only through
//! [`CompletionService`]. [`crate::openai::OpenAiClient`] implements it for
//! OpenAI-compatible servers; tests implement it with scripted responses.

use crate::types::{ContentBlock, Message, ToolUseBlock, first_text};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stop reason meaning "run the requested tools, then call me again"
pub const STOP_TOOL_USE: &str = "tool_use";
/// Stop reason for a finished answer
pub const STOP_END_TURN: &str = "end_turn";
/// Stop reason when the output hit the token limit
pub const STOP_MAX_TOKENS: &str = "max_tokens";

/// A tool as offered to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    /// OpenAI function-calling format
    pub fn to_openai_format(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema
            }
        })
    }
}

/// One call to the completion service
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    #[serde(rename = "availableTools")]
    pub tools: Vec<ToolDefinition>,
}

/// What the completion service answered
///
/// `content` is optional because a misbehaving backend may omit it; the loop
/// treats that as an unusable response, not as an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub content: Option<Vec<ContentBlock>>,
}

impl CompletionResponse {
    pub fn new(stop_reason: impl Into<String>, content: Vec<ContentBlock>) -> Self {
        Self {
            stop_reason: Some(stop_reason.into()),
            content: Some(content),
        }
    }

    /// Text of the first text block
    pub fn text(&self) -> Option<&str> {
        self.content.as_deref().and_then(first_text)
    }

    /// Requested tool invocations, in the order the model listed them
    pub fn tool_uses(&self) -> Vec<&ToolUseBlock> {
        self.content
            .iter()
            .flatten()
            .filter_map(|block| match block {
                ContentBlock::ToolUse(tool_use) => Some(tool_use),
                _ => None,
            })
            .collect()
    }

    /// Whether this response starts a tool round
    pub fn requests_tool_use(&self) -> bool {
        self.stop_reason.as_deref() == Some(STOP_TOOL_USE) && !self.tool_uses().is_empty()
    }
}

/// A language-model backend
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}
