//! Progress notifications emitted while a request is processed
//!
//! A sink only observes; it cannot change what the loop does next. Any
//! `Fn(ProgressEvent)` closure is a sink, and so is an unbounded Tokio
//! channel sender, which suits streaming status to a client:
//!
//! ```rust,no_run
//! use toolwire::progress::ProgressEvent;
//! use tokio::sync::mpsc;
//!
//! let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
//! // agent.respond(request, Some(&tx)).await;
//! # drop(tx);
//! ```

use std::fmt;
use tokio::sync::mpsc;

/// One step of the orchestration loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Connecting to the tool server and listing its tools
    LoadingTools,
    /// Tools discovered
    ToolsReady { count: usize },
    /// Continuing without tools
    ToolsUnavailable { reason: String },
    /// Waiting on the completion service (round 0 is the first call)
    Thinking { round: u32 },
    /// A tool invocation started
    UsingTool { name: String },
    /// A tool invocation settled
    ToolFinished { name: String, success: bool },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::LoadingTools => write!(f, "loading tools…"),
            ProgressEvent::ToolsReady { count } => write!(f, "{} tool(s) ready", count),
            ProgressEvent::ToolsUnavailable { reason } => {
                write!(f, "continuing without tools ({})", reason)
            }
            ProgressEvent::Thinking { .. } => write!(f, "thinking…"),
            ProgressEvent::UsingTool { name } => write!(f, "using tool {}…", name),
            ProgressEvent::ToolFinished { name, success: true } => write!(f, "{} done", name),
            ProgressEvent::ToolFinished { name, success: false } => write!(f, "{} failed", name),
        }
    }
}

/// Receives progress events
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event)
    }
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // a caller that stopped listening is not an error
        let _ = self.send(event);
    }
}

/// Forward to the sink, if there is one.
pub(crate) fn emit(sink: Option<&dyn ProgressSink>, event: ProgressEvent) {
    if let Some(sink) = sink {
        sink.emit(event);
    }
}
