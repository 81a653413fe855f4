//! Completion service for OpenAI-compatible `/chat/completions` endpoints
//!
//! Works with LM Studio, Ollama, llama.cpp, vLLM and anything else that speaks
//! the streaming chat-completions dialect.
//!
//! # Tool call aggregation
//!
//! Tool calls arrive as incremental deltas keyed by `index`:
//!
//! ```text
//! Chunk 1: { tool_calls: [{ index: 0, id: "call_abc", function: { name: "search" } }] }
//! Chunk 2: { tool_calls: [{ index: 0, function: { arguments: "{\"que" } }] }
//! Chunk 3: { tool_calls: [{ index: 0, function: { arguments: "ry\":\"revenue\"}" } }] }
//! Chunk 4: { finish_reason: "tool_calls" }
//! ```
//!
//! [`ToolCallAggregator`] accumulates them and, once the stream ends, emits one
//! text block followed by the tool calls in index order.

use crate::completion::{
    CompletionRequest, CompletionResponse, CompletionService, STOP_END_TURN, STOP_MAX_TOKENS,
    STOP_TOOL_USE,
};
use crate::sse::response_frames;
use crate::types::{
    ContentBlock, Message, MessageRole, OpenAIChunk, OpenAIFunction, OpenAIMessage, OpenAIRequest,
    OpenAIToolCall, TextBlock, ToolUseBlock,
};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::time::Duration;

/// Marker payload that ends an OpenAI stream
const DONE_MARKER: &str = "[DONE]";

/// Connection settings for an OpenAI-compatible server
#[derive(Clone)]
pub struct OpenAiOptions {
    /// Model name (e.g., "qwen2.5-32b-instruct")
    pub model: String,

    /// Endpoint URL up to and including the version segment
    pub base_url: String,

    /// API key (most local servers don't need this)
    pub api_key: String,

    /// Maximum tokens to generate (None uses provider default)
    pub max_tokens: Option<u32>,

    /// Sampling temperature (0.0 to 2.0)
    pub temperature: f32,

    /// Request timeout in seconds
    pub timeout: u64,
}

impl std::fmt::Debug for OpenAiOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiOptions")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl OpenAiOptions {
    pub fn builder() -> OpenAiOptionsBuilder {
        OpenAiOptionsBuilder::default()
    }
}

/// Builder for OpenAiOptions
#[derive(Default)]
pub struct OpenAiOptionsBuilder {
    model: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout: Option<u64>,
}

impl std::fmt::Debug for OpenAiOptionsBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiOptionsBuilder")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl OpenAiOptionsBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<OpenAiOptions> {
        let model = self
            .model
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| Error::config("model is required"))?;

        let base_url = self
            .base_url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| Error::config("base_url is required"))?;

        let temperature = self.temperature.unwrap_or(0.7);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(Error::config("temperature must be between 0.0 and 2.0"));
        }

        Ok(OpenAiOptions {
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: self.api_key.unwrap_or_else(|| "not-needed".to_string()),
            max_tokens: self.max_tokens.or(Some(4096)),
            temperature,
            timeout: self.timeout.unwrap_or(60),
        })
    }
}

/// Streaming chat-completions client
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    options: OpenAiOptions,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(options: OpenAiOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.timeout))
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { options, http })
    }

    pub fn options(&self) -> &OpenAiOptions {
        &self.options
    }

    fn build_request(&self, request: &CompletionRequest) -> OpenAIRequest {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(|t| t.to_openai_format()).collect())
        };

        OpenAIRequest {
            model: self.options.model.clone(),
            messages: to_openai_messages(&request.system_prompt, &request.messages),
            stream: true,
            max_tokens: self.options.max_tokens,
            temperature: Some(self.options.temperature),
            tools,
        }
    }
}

#[async_trait]
impl CompletionService for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let body = self.build_request(request);
        let url = format!("{}/chat/completions", self.options.base_url);

        log::debug!(
            "chat completion: {} message(s), {} tool(s)",
            body.messages.len(),
            request.tools.len()
        );

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.options.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error (failed to read response body)".to_string());
            return Err(Error::api(format!("API error {}: {}", status, body)));
        }

        let mut frames = response_frames(response);
        let mut aggregator = ToolCallAggregator::new();

        while let Some(frame) = frames.next().await {
            let frame = frame?;
            let data = frame.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == DONE_MARKER {
                break;
            }
            let chunk: OpenAIChunk = serde_json::from_str(data)
                .map_err(|e| Error::stream(format!("Failed to parse chunk: {}", e)))?;
            aggregator.process_chunk(chunk);
        }

        aggregator.finish()
    }
}

/// Convert the conversation into chat-completions messages.
///
/// Tool-result turns expand into one `tool` message per result, in order.
pub fn to_openai_messages(system_prompt: &str, messages: &[Message]) -> Vec<OpenAIMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);

    if !system_prompt.is_empty() {
        out.push(OpenAIMessage {
            role: "system".to_string(),
            content: Some(system_prompt.to_string()),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for msg in messages {
        let mut texts = Vec::new();
        let mut tool_calls = Vec::new();

        for block in &msg.content {
            match block {
                ContentBlock::Text(text) => texts.push(text.text.as_str()),
                ContentBlock::ToolUse(tool_use) => tool_calls.push(OpenAIToolCall {
                    id: tool_use.id.clone(),
                    call_type: "function".to_string(),
                    function: OpenAIFunction {
                        name: tool_use.name.clone(),
                        arguments: tool_use.input.to_string(),
                    },
                }),
                ContentBlock::ToolResult(result) => {
                    let content = if result.is_error {
                        format!("Error: {}", result.content)
                    } else {
                        result.content.clone()
                    };
                    out.push(OpenAIMessage {
                        role: "tool".to_string(),
                        content: Some(content),
                        tool_calls: None,
                        tool_call_id: Some(result.tool_use_id.clone()),
                    });
                }
            }
        }

        if msg.role == MessageRole::Tool {
            continue;
        }

        let role = match msg.role {
            MessageRole::User => "user",
            MessageRole::Assistant | MessageRole::Tool => "assistant",
        };

        out.push(OpenAIMessage {
            role: role.to_string(),
            // content is required alongside tool_calls, even if empty
            content: Some(texts.join("\n")),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        });
    }

    out
}

/// Map an OpenAI finish reason onto a completion stop reason.
pub fn map_finish_reason(finish_reason: Option<&str>, has_tool_calls: bool) -> String {
    match finish_reason {
        Some("tool_calls") | Some("function_call") => STOP_TOOL_USE.to_string(),
        Some("stop") => STOP_END_TURN.to_string(),
        Some("length") => STOP_MAX_TOKENS.to_string(),
        Some(other) => other.to_string(),
        None if has_tool_calls => STOP_TOOL_USE.to_string(),
        None => STOP_END_TURN.to_string(),
    }
}

/// Accumulates streamed deltas into one [`CompletionResponse`].
#[derive(Debug, Default)]
pub struct ToolCallAggregator {
    text_buffer: String,
    /// Keyed by the delta's `index`, so iteration follows request order
    tool_calls: BTreeMap<u32, PartialToolCall>,
    finish_reason: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_chunk(&mut self, chunk: OpenAIChunk) {
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                self.text_buffer.push_str(&content);
            }

            for tool_call in choice.delta.tool_calls.into_iter().flatten() {
                let entry = self.tool_calls.entry(tool_call.index).or_default();

                if let Some(id) = tool_call.id {
                    entry.id = Some(id);
                }
                if let Some(function) = tool_call.function {
                    if let Some(name) = function.name {
                        entry.name = Some(name);
                    }
                    if let Some(args) = function.arguments {
                        entry.arguments.push_str(&args);
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }
    }

    /// Assemble the final response.
    ///
    /// Fails if a tool call's accumulated arguments are not valid JSON.
    pub fn finish(self) -> Result<CompletionResponse> {
        let mut content = Vec::new();

        if !self.text_buffer.is_empty() {
            content.push(ContentBlock::Text(TextBlock::new(self.text_buffer)));
        }

        for (index, partial) in self.tool_calls {
            let Some(name) = partial.name else {
                log::warn!("dropping tool call {} without a function name", index);
                continue;
            };
            let id = partial.id.unwrap_or_else(|| format!("call_{}", index));
            let input = if partial.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&partial.arguments).map_err(|e| {
                    Error::stream(format!("Failed to parse tool arguments: {}", e))
                })?
            };
            content.push(ContentBlock::ToolUse(ToolUseBlock::new(id, name, input)));
        }

        let has_tool_calls = content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse(_)));

        Ok(CompletionResponse {
            stop_reason: Some(map_finish_reason(
                self.finish_reason.as_deref(),
                has_tool_calls,
            )),
            content: Some(content),
        })
    }
}
