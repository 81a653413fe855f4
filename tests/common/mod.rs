//! Shared fixtures: an in-process tool server and a scripted completion service.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use toolwire::protocol::LATEST_PROTOCOL_VERSION;
use toolwire::retry::RetryConfig;
use toolwire::{
    AgentOptions, ClientOptions, CompletionRequest, CompletionResponse, CompletionService,
    Connection, Connector, ContentBlock, Error, Result, STOP_END_TURN, STOP_TOOL_USE, TextBlock,
    ToolUseBlock, Transport, TransportEvent,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// How the fake server answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Result(Value),
    Error { code: i64, message: String },
    Delayed(Duration, Value),
    /// Never answer
    Silent,
    /// End the event stream instead of answering
    CloseStream,
}

pub type Handler = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

/// Tool server living in the test process.
///
/// Answers requests by pushing responses onto the client's event channel, the
/// same way [`toolwire::SseTransport`] forwards `message` frames.
pub struct FakeServer {
    handler: Handler,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    sent: Mutex<Vec<Value>>,
    closes: Mutex<usize>,
}

impl FakeServer {
    pub fn start(handler: Handler) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Arc::new(Self {
            handler,
            events: Mutex::new(Some(tx)),
            sent: Mutex::new(Vec::new()),
            closes: Mutex::new(0),
        });
        (server, rx)
    }

    /// Every message the client sent, in order.
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    /// Params of every request for `method`.
    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|m| m["method"] == method && m.get("id").is_some())
            .map(|m| m.get("params").cloned().unwrap_or(Value::Null))
            .collect()
    }

    pub fn close_count(&self) -> usize {
        *self.closes.lock().unwrap()
    }

    /// Inject a raw event as if it arrived on the stream.
    pub fn push(&self, event: TransportEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn push_json(&self, message: Value) {
        self.push(TransportEvent::Message(message.to_string()));
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn send(&self, message: Value) -> Result<()> {
        let tx = match self.events.lock().unwrap().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(Error::Closed),
        };
        self.sent.lock().unwrap().push(message.clone());

        let Some(id) = message.get("id").cloned() else {
            return Ok(());
        };
        let method = message["method"].as_str().unwrap_or_default();
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match (self.handler)(method, &params) {
            Reply::Result(result) => {
                let _ = tx.send(response(id, result));
            }
            Reply::Error { code, message } => {
                let error = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": code, "message": message}
                });
                let _ = tx.send(TransportEvent::Message(error.to_string()));
            }
            Reply::Delayed(delay, result) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(response(id, result));
                });
            }
            Reply::Silent => {}
            Reply::CloseStream => {
                let _ = tx.send(TransportEvent::Closed);
            }
        }
        Ok(())
    }

    fn close(&self) {
        *self.closes.lock().unwrap() += 1;
        self.events.lock().unwrap().take();
    }
}

fn response(id: Value, result: Value) -> TransportEvent {
    TransportEvent::Message(json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string())
}

/// Handler for a well-behaved server offering `tools` and answering
/// `tools/call` with `call(name, arguments)`.
pub fn tool_server<F>(tools: Value, call: F) -> Handler
where
    F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
{
    Arc::new(move |method: &str, params: &Value| match method {
        "initialize" => Reply::Result(initialize_result(LATEST_PROTOCOL_VERSION)),
        "ping" => Reply::Result(json!({})),
        "tools/list" => Reply::Result(json!({ "tools": tools.clone() })),
        "tools/call" => call(
            params["name"].as_str().unwrap_or_default(),
            &params["arguments"],
        ),
        other => Reply::Error {
            code: -32601,
            message: format!("Method not found: {}", other),
        },
    })
}

pub fn initialize_result(version: &str) -> Value {
    json!({
        "protocolVersion": version,
        "capabilities": {"tools": {}},
        "serverInfo": {"name": "fake-tools", "version": "0.0.1"}
    })
}

pub fn tool_descriptor(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("The {} tool", name),
        "inputSchema": {
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        }
    })
}

/// Text content as a tool server returns it
pub fn text_content(text: &str) -> Value {
    json!({"content": [{"type": "text", "text": text}], "isError": false})
}

pub fn error_content(text: &str) -> Value {
    json!({"content": [{"type": "text", "text": text}], "isError": true})
}

/// Opens a [`FakeServer`]-backed connection per request and keeps every
/// server it created for inspection.
pub struct FakeConnector {
    handler: Handler,
    servers: Mutex<Vec<Arc<FakeServer>>>,
}

impl FakeConnector {
    pub fn new(handler: Handler) -> Arc<Self> {
        Arc::new(Self {
            handler,
            servers: Mutex::new(Vec::new()),
        })
    }

    pub fn servers(&self) -> Vec<Arc<FakeServer>> {
        self.servers.lock().unwrap().clone()
    }

    pub fn last_server(&self) -> Arc<FakeServer> {
        self.servers()
            .pop()
            .expect("connector was never used")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Connection> {
        let (server, events) = FakeServer::start(self.handler.clone());
        self.servers.lock().unwrap().push(server.clone());
        Connection::from_transport(server, events, ClientOptions::default()).await
    }
}

/// Connector whose server cannot be reached
pub struct UnreachableConnector;

#[async_trait]
impl Connector for UnreachableConnector {
    async fn connect(&self) -> Result<Connection> {
        Err(Error::connect("connection refused"))
    }
}

/// Completion service that plays back a fixed script.
pub struct ScriptedCompletion {
    script: Mutex<VecDeque<Result<CompletionResponse>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new(script: Vec<Result<CompletionResponse>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::other("completion script exhausted")))
    }
}

pub fn text_response(text: &str) -> Result<CompletionResponse> {
    Ok(CompletionResponse::new(
        STOP_END_TURN,
        vec![ContentBlock::Text(TextBlock::new(text))],
    ))
}

/// A response requesting the given `(id, tool, arguments)` invocations
pub fn tool_response(calls: &[(&str, &str, Value)]) -> Result<CompletionResponse> {
    Ok(CompletionResponse::new(
        STOP_TOOL_USE,
        calls
            .iter()
            .map(|(id, name, input)| ContentBlock::ToolUse(ToolUseBlock::new(*id, *name, input.clone())))
            .collect(),
    ))
}

/// Options with retries off and a short tool deadline
pub fn test_options() -> AgentOptions {
    AgentOptions::builder()
        .system_prompt("You are a test assistant")
        .tool_timeout(Duration::from_secs(5))
        .retry(RetryConfig::disabled())
        .build()
        .unwrap()
}
