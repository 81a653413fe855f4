//! Orchestration loop: multi-round tool use driven by a completion service.
//!
//! # Flow
//!
//! ```text
//! history window + user message
//!         │
//!         ▼
//!   connect + discover tools ── fails / times out ──▶ continue without tools
//!         │
//!         ▼
//!   ┌─▶ completion call
//!   │     │ stop_reason == "tool_use" and tool_use blocks present?
//!   │     ├── no ──▶ first text block is the answer (fallback if none)
//!   │     ▼ yes
//!   │   run every invocation concurrently, join in request order
//!   │     │ fatal error / timeout ──▶ close connection, fallback
//!   └──── append assistant turn + one batched tool-result turn
//! ```
//!
//! The tool connection lives inside [`Agent::respond`] and is closed when that
//! call returns, whichever way it returns.
//!
//! # Failure policy
//!
//! `respond` never returns an error. Failures that only affect one tool
//! invocation are reported to the model as an error-flagged result. Failures
//! that break the connection end the request with the fallback message.

use crate::completion::{CompletionRequest, CompletionResponse, CompletionService};
use crate::connection::{Connection, Connector};
use crate::context::{estimate_tokens, history_window};
use crate::progress::{ProgressEvent, ProgressSink, emit};
use crate::protocol::content_text;
use crate::retry::retry_with_backoff_conditional;
use crate::tools::{ToolSet, remote_tools};
use crate::types::{
    AgentOptions, ContentBlock, HistoryTurn, Message, MessageRole, ToolResultBlock, ToolUseBlock,
};
use crate::{Error, Result};
use futures::future::join_all;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One user request: prior turns plus the new message.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Prior turns, oldest first; only the trailing window is sent
    pub history: Vec<HistoryTurn>,
    pub message: String,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            history: Vec::new(),
            message: message.into(),
        }
    }

    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }
}

/// Lifecycle of a tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationStatus {
    Pending,
    Succeeded { result: String },
    Failed { error: String },
}

/// One tool invocation requested by the model.
///
/// Settles once; a settled record is never reopened.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocationRecord {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    status: InvocationStatus,
}

impl ToolInvocationRecord {
    pub fn new(tool_use: &ToolUseBlock) -> Self {
        Self {
            call_id: tool_use.id.clone(),
            tool_name: tool_use.name.clone(),
            arguments: tool_use.input.clone(),
            status: InvocationStatus::Pending,
        }
    }

    pub fn status(&self) -> &InvocationStatus {
        &self.status
    }

    pub fn is_settled(&self) -> bool {
        self.status != InvocationStatus::Pending
    }

    /// Record a successful result. Returns `false` if already settled.
    pub fn succeed(&mut self, result: impl Into<String>) -> bool {
        self.settle(InvocationStatus::Succeeded {
            result: result.into(),
        })
    }

    /// Record a failure. Returns `false` if already settled.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        self.settle(InvocationStatus::Failed {
            error: error.into(),
        })
    }

    fn settle(&mut self, status: InvocationStatus) -> bool {
        if self.is_settled() {
            log::warn!("invocation {} already settled", self.call_id);
            return false;
        }
        self.status = status;
        true
    }

    /// The result turn block for this invocation, once settled.
    pub fn to_result_block(&self) -> Option<ToolResultBlock> {
        match &self.status {
            InvocationStatus::Pending => None,
            InvocationStatus::Succeeded { result } => {
                Some(ToolResultBlock::success(&self.call_id, result))
            }
            InvocationStatus::Failed { error } => Some(ToolResultBlock::error(&self.call_id, error)),
        }
    }
}

/// Ordered turns sent to the completion service.
///
/// A tool-result turn is only accepted directly after an assistant turn that
/// requested tools, and must answer every request in order.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(history: Vec<Message>, user_message: impl Into<String>) -> Self {
        let mut messages = history;
        messages.push(Message::user(user_message));
        Self { messages }
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

    pub fn push_assistant(&mut self, content: Vec<ContentBlock>) {
        self.messages.push(Message::assistant(content));
    }

    pub fn push_tool_results(&mut self, results: Vec<ToolResultBlock>) -> Result<()> {
        let last = self
            .messages
            .last()
            .filter(|m| m.role == MessageRole::Assistant)
            .ok_or_else(|| Error::invalid_state("tool results must follow an assistant turn"))?;

        let requested: Vec<&str> = last.tool_uses().map(|t| t.id.as_str()).collect();
        let answered: Vec<&str> = results.iter().map(|r| r.tool_use_id.as_str()).collect();
        if requested.is_empty() || requested != answered {
            return Err(Error::invalid_state(format!(
                "tool results {:?} do not answer requested invocations {:?}",
                answered, requested
            )));
        }

        self.messages.push(Message::tool_results(results));
        Ok(())
    }
}

/// Outcome of one request
#[derive(Debug, Clone)]
pub struct AgentReply {
    /// Text shown to the user
    pub text: String,
    /// Tool rounds executed
    pub rounds: u32,
    /// Every invocation the model requested, in request order
    pub invocations: Vec<ToolInvocationRecord>,
    /// Whether any tools were offered to the model
    pub tools_available: bool,
    /// Whether `text` is the fallback message
    pub used_fallback: bool,
}

/// Tools for one request plus the connection backing the remote ones.
struct ToolSession {
    tools: ToolSet,
    connection: Option<Connection>,
}

impl ToolSession {
    fn close(&self) {
        if let Some(connection) = &self.connection {
            connection.close();
        }
    }
}

/// Drives the conversation with the completion service.
#[derive(Clone)]
pub struct Agent {
    options: AgentOptions,
    completion: Arc<dyn CompletionService>,
    connector: Option<Arc<dyn Connector>>,
    local_tools: ToolSet,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("options", &self.options)
            .field("connector", &self.connector.is_some())
            .field("local_tools", &self.local_tools.len())
            .finish()
    }
}

impl Agent {
    pub fn new(options: AgentOptions, completion: Arc<dyn CompletionService>) -> Self {
        Self {
            options,
            completion,
            connector: None,
            local_tools: ToolSet::new(),
        }
    }

    /// Open a tool-server connection for each request.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// In-process tools offered next to the remote ones.
    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.local_tools = tools;
        self
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Answer one user request.
    pub async fn respond(
        &self,
        request: ChatRequest,
        progress: Option<&dyn ProgressSink>,
    ) -> AgentReply {
        let history = history_window(&request.history, self.options.history_window);
        let mut conversation = Conversation::new(history, request.message);

        // Dropped (and so closed) on every return path below.
        let session = self.load_tools(progress).await;
        let tools_available = !session.tools.is_empty();

        let mut reply = AgentReply {
            text: String::new(),
            rounds: 0,
            invocations: Vec::new(),
            tools_available,
            used_fallback: false,
        };

        let definitions = session.tools.definitions();

        loop {
            emit(progress, ProgressEvent::Thinking { round: reply.rounds });

            let completion_request = CompletionRequest {
                system_prompt: self.options.system_prompt.clone(),
                messages: conversation.messages().to_vec(),
                tools: definitions.clone(),
            };
            log::debug!(
                "completion round {}: {} messages, ~{} tokens",
                reply.rounds,
                completion_request.messages.len(),
                estimate_tokens(&completion_request.messages)
            );

            let response = match retry_with_backoff_conditional(self.options.retry.clone(), || {
                self.completion.complete(&completion_request)
            })
            .await
            {
                Ok(response) => response,
                Err(e) => {
                    log::warn!("completion failed: {}", e);
                    return self.fallback(reply);
                }
            };

            if !response.requests_tool_use() {
                return self.finish(reply, &response);
            }

            if reply.rounds >= self.options.max_tool_rounds {
                log::warn!(
                    "stopping after {} tool round(s); model still requests tools",
                    reply.rounds
                );
                return self.finish(reply, &response);
            }

            reply.rounds += 1;
            let tool_uses: Vec<ToolUseBlock> =
                response.tool_uses().into_iter().cloned().collect();
            conversation.push_assistant(response.content.unwrap_or_default());

            let (records, outcome) = self.run_tool_round(&session, &tool_uses, progress).await;
            reply.invocations.extend(records.iter().cloned());

            if let Err(e) = outcome {
                log::warn!("tool round {} failed: {}", reply.rounds, e);
                session.close();
                return self.fallback(reply);
            }

            let results: Vec<ToolResultBlock> =
                records.iter().filter_map(|r| r.to_result_block()).collect();
            if let Err(e) = conversation.push_tool_results(results) {
                log::warn!("{}", e);
                session.close();
                return self.fallback(reply);
            }
        }
    }

    /// Connect and discover tools, degrading to local tools only on failure.
    async fn load_tools(&self, progress: Option<&dyn ProgressSink>) -> ToolSession {
        let mut session = ToolSession {
            tools: self.local_tools.clone(),
            connection: None,
        };

        let Some(connector) = &self.connector else {
            return session;
        };

        emit(progress, ProgressEvent::LoadingTools);

        let setup = async {
            let connection = connector.connect().await?;
            let tools = remote_tools(&connection).await?;
            Ok::<_, Error>((connection, tools))
        };

        match with_deadline(self.options.tool_timeout, setup).await {
            Ok((connection, remote)) => {
                for tool in remote.iter() {
                    session.tools.insert(tool.clone());
                }
                emit(
                    progress,
                    ProgressEvent::ToolsReady {
                        count: session.tools.len(),
                    },
                );
                session.connection = Some(connection);
            }
            Err(e) => {
                log::warn!("continuing without remote tools: {}", e);
                emit(
                    progress,
                    ProgressEvent::ToolsUnavailable {
                        reason: e.to_string(),
                    },
                );
            }
        }

        session
    }

    /// Run every requested invocation and settle its record.
    ///
    /// Records come back in request order. The outcome is `Err` when the round
    /// hit a fatal error or the deadline.
    async fn run_tool_round(
        &self,
        session: &ToolSession,
        tool_uses: &[ToolUseBlock],
        progress: Option<&dyn ProgressSink>,
    ) -> (Vec<ToolInvocationRecord>, Result<()>) {
        let mut records: Vec<ToolInvocationRecord> =
            tool_uses.iter().map(ToolInvocationRecord::new).collect();

        let calls = tool_uses.iter().map(|tool_use| {
            let tools = &session.tools;
            async move {
                emit(
                    progress,
                    ProgressEvent::UsingTool {
                        name: tool_use.name.clone(),
                    },
                );
                let result = tools.invoke(&tool_use.name, tool_use.input.clone()).await;
                emit(
                    progress,
                    ProgressEvent::ToolFinished {
                        name: tool_use.name.clone(),
                        success: result.is_ok(),
                    },
                );
                result
            }
        });

        let round = async { Ok::<_, Error>(join_all(calls).await) };
        let outcomes = match with_deadline(self.options.tool_timeout, round).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                for record in &mut records {
                    record.fail(e.to_string());
                }
                return (records, Err(e));
            }
        };

        let mut fatal = None;
        for (record, outcome) in records.iter_mut().zip(outcomes) {
            match outcome {
                Ok(value) => {
                    log::debug!("tool {} ({}) succeeded", record.tool_name, record.call_id);
                    record.succeed(content_text(&value));
                }
                Err(e) => {
                    log::debug!("tool {} ({}) failed: {}", record.tool_name, record.call_id, e);
                    record.fail(error_message(&e));
                    if e.is_fatal() && fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }

        match fatal {
            Some(e) => (records, Err(e)),
            None => (records, Ok(())),
        }
    }

    fn finish(&self, mut reply: AgentReply, response: &CompletionResponse) -> AgentReply {
        match response.text().filter(|t| !t.trim().is_empty()) {
            Some(text) => {
                reply.text = text.to_string();
                reply
            }
            None => {
                log::warn!(
                    "completion response had no text (stop reason {:?})",
                    response.stop_reason
                );
                self.fallback(reply)
            }
        }
    }

    fn fallback(&self, mut reply: AgentReply) -> AgentReply {
        reply.text = self.options.fallback_message.clone();
        reply.used_fallback = true;
        reply
    }
}

/// Message fed back to the model for a failed invocation.
fn error_message(error: &Error) -> String {
    match error {
        Error::ToolExecution(msg) => msg.clone(),
        other => other.to_string(),
    }
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| Error::timeout())?,
        None => future.await,
    }
}
