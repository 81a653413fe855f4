//! # Toolwire
//!
//! A client for remote tool servers that speak JSON-RPC 2.0 over Server-Sent
//! Events, plus an agentic loop that lets a language model call those tools in
//! the middle of a conversation.
//!
//! ## Overview
//!
//! The crate is layered bottom-up:
//!
//! - **SSE framing** ([`sse`]): incremental parsing of `text/event-stream`
//!   bodies into frames, independent of how the bytes are chunked.
//! - **Transport** ([`transport`]): holds the GET event stream open, learns the
//!   POST endpoint from the server's `endpoint` event, and sends outbound
//!   JSON-RPC messages there.
//! - **Protocol client** ([`ProtocolClient`]): id allocation, request and
//!   response correlation, the `initialize` handshake, `tools/list` and
//!   `tools/call`.
//! - **Connection** ([`Connection`]): a handshaken client plus a tool list
//!   cached for the life of the connection. Dropping it closes it.
//! - **Tool adapter** ([`remote_tools`], [`ToolSet`]): remote tools as
//!   invocable [`Tool`]s with normalized input schemas.
//! - **Orchestration** ([`Agent`]): completion call, concurrent tool round,
//!   batched results, repeat until the model answers in text.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use toolwire::{Agent, AgentOptions, ChatRequest, OpenAiClient, OpenAiOptions, SseConnector, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let completion = OpenAiClient::new(
//!         OpenAiOptions::builder()
//!             .model("qwen2.5-32b-instruct")
//!             .base_url("http://localhost:1234/v1")
//!             .build()?,
//!     )?;
//!
//!     let agent = Agent::new(
//!         AgentOptions::builder()
//!             .system_prompt("You are a helpful assistant")
//!             .build()?,
//!         Arc::new(completion),
//!     )
//!     .with_connector(Arc::new(SseConnector::new(TransportConfig::new(
//!         "http://localhost:8080/sse",
//!     ))));
//!
//!     let reply = agent
//!         .respond(ChatRequest::new("What changed in last week's report?"), None)
//!         .await;
//!     println!("{}", reply.text);
//!     Ok(())
//! }
//! ```
//!
//! ## Failure handling
//!
//! [`Agent::respond`] does not return errors. Tool discovery failures degrade
//! to answering without tools, single tool failures are reported back to the
//! model, and anything that breaks the connection or the completion call ends
//! the request with a fixed fallback message. Details go to the [`log`] facade.

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Orchestration loop driving completion calls and tool rounds.
mod agent;

/// JSON-RPC client state machine over a [`transport::Transport`].
mod client;

/// Completion-service interface and request/response shapes.
mod completion;

/// Endpoint and model resolution from environment variables.
mod config;

/// Handshaken connection with a per-connection tool cache.
mod connection;

/// Token estimation and history windowing.
mod context;

/// Error types shared by every layer.
mod error;

/// Streaming OpenAI-compatible completion backend.
mod openai;

/// Tool adapter and tool collections.
mod tools;

/// Messages, content blocks, options and OpenAI wire types.
mod types;

// ============================================================================
// PUBLIC MODULES
// ============================================================================

pub mod progress;
pub mod protocol;
pub mod retry;
pub mod sse;
pub mod transport;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

// --- Orchestration ---

pub use agent::{
    Agent, AgentReply, ChatRequest, Conversation, InvocationStatus, ToolInvocationRecord,
};

// --- Protocol client ---

pub use client::{ClientOptions, ClientPhase, ErrorHandler, ProtocolClient};
pub use connection::{Connection, Connector, SseConnector};
pub use transport::{SseTransport, Transport, TransportConfig, TransportEvent};

// --- Completion backends ---

pub use completion::{
    CompletionRequest, CompletionResponse, CompletionService, STOP_END_TURN, STOP_MAX_TOKENS,
    STOP_TOOL_USE, ToolDefinition,
};
pub use openai::{OpenAiClient, OpenAiOptions, OpenAiOptionsBuilder, ToolCallAggregator};

// --- Configuration ---

pub use config::{Provider, get_base_url, get_model, get_tool_server_url};

// --- Context Management ---

pub use context::{estimate_tokens, history_window};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Tools ---

pub use tools::{Tool, ToolHandler, ToolSet, normalize_input_schema, remote_tools};

// --- Core Types ---

pub use types::{
    AgentOptions, AgentOptionsBuilder, ContentBlock, DEFAULT_FALLBACK_MESSAGE, HistoryRole,
    HistoryTurn, Message, MessageRole, TextBlock, ToolResultBlock, ToolUseBlock,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The types most callers need.
///
/// ```rust
/// use toolwire::prelude::*;
/// ```
pub mod prelude {
    pub use crate::progress::{ProgressEvent, ProgressSink};
    pub use crate::{
        Agent, AgentOptions, AgentReply, ChatRequest, CompletionService, Connection, Connector,
        ContentBlock, Error, HistoryTurn, Message, Result, SseConnector, Tool, ToolSet,
        TransportConfig,
    };
}
