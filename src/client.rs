//! Protocol client: handshake, request/response correlation, typed tool calls.
//!
//! # State machine
//!
//! ```text
//! Uninitialized ──initialize()──▶ Handshaking ──version ok──▶ Ready
//!       │                              │                        │
//!       └──────────── close() / stream end / handshake error ───┴──▶ Closed
//! ```
//!
//! # Correlation
//!
//! Every request takes the next numeric id and parks a `oneshot` sender in the
//! pending map. The dispatcher task reads transport events in order and, for
//! each response, removes the matching sender and fires it. Closing drains the
//! map and fails every sender with [`Error::Closed`], so no caller ever waits
//! on a request that can no longer be answered.
//!
//! The pending map is only touched by this module: inserted by `request`,
//! removed by the dispatcher, the failed-send path, or `close`.
//!
//! # Timeouts
//!
//! None. A request the server never answers stays pending until the caller
//! gives up and closes the client; the orchestration loop owns that deadline.

use crate::protocol::{
    CallToolParams, CallToolResult, IncomingMessage, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, LATEST_PROTOCOL_VERSION, ListToolsResult,
    METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
    SUPPORTED_PROTOCOL_VERSIONS, ToolDescriptor, Implementation,
};
use crate::transport::{EventReceiver, Transport, TransportEvent};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Lifecycle phase of a [`ProtocolClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Uninitialized,
    Handshaking,
    Ready,
    Closed,
}

/// Receives errors that cannot be returned to any caller, such as a response
/// for an unknown request id.
pub type ErrorHandler = Arc<dyn Fn(Error) + Send + Sync>;

/// Settings for a [`ProtocolClient`].
#[derive(Clone)]
pub struct ClientOptions {
    /// Name and version announced in the handshake
    pub client_info: Implementation,
    /// Capabilities declared in the handshake
    pub capabilities: Value,
    /// Server protocol versions we accept
    pub supported_versions: Vec<String>,
    /// Handler for uncaught errors; logs at `warn` when unset
    pub on_error: Option<ErrorHandler>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation::default(),
            capabilities: serde_json::json!({}),
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            on_error: None,
        }
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("client_info", &self.client_info)
            .field("capabilities", &self.capabilities)
            .field("supported_versions", &self.supported_versions)
            .field("on_error", &self.on_error.as_ref().map(|_| "<handler>"))
            .finish()
    }
}

impl ClientOptions {
    pub fn with_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = Implementation {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    pub fn with_capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_on_error(mut self, handler: impl Fn(Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }
}

type Settlement = oneshot::Sender<Result<Value>>;

struct ClientState {
    phase: ClientPhase,
    next_id: u64,
    pending: HashMap<u64, Settlement>,
    server: Option<InitializeResult>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    state: Mutex<ClientState>,
    on_error: Option<ErrorHandler>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, error: Error) {
        match &self.on_error {
            Some(handler) => handler(error),
            None => log::warn!("uncaught protocol error: {}", error),
        }
    }

    fn dispatch(&self, message: IncomingMessage) {
        match message {
            IncomingMessage::Response { id, outcome } => {
                let settlement = self.state().pending.remove(&id);
                match settlement {
                    Some(tx) => {
                        log::debug!("response received for request {}", id);
                        let _ = tx.send(outcome.map_err(Error::from));
                    }
                    None => self.report(Error::protocol_violation(format!(
                        "received a response for unknown request id {}",
                        id
                    ))),
                }
            }
            IncomingMessage::Notification { method, .. } => {
                log::debug!("server notification: {}", method);
            }
            IncomingMessage::Request { id, method } => {
                self.report(Error::protocol_violation(format!(
                    "request messages not supported (method '{}', id {})",
                    method, id
                )));
            }
        }
    }

    fn close(&self) {
        let pending = {
            let mut state = self.state();
            if state.phase == ClientPhase::Closed {
                return;
            }
            state.phase = ClientPhase::Closed;
            std::mem::take(&mut state.pending)
        };

        if !pending.is_empty() {
            log::debug!("closing with {} pending request(s)", pending.len());
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(Error::Closed));
        }

        self.transport.close();

        if let Some(dispatcher) = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            dispatcher.abort();
        }
    }
}

/// Client for the remote tool protocol over any [`Transport`].
pub struct ProtocolClient {
    shared: Arc<Shared>,
    options: ClientOptions,
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("ProtocolClient")
            .field("phase", &state.phase)
            .field("next_id", &state.next_id)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl ProtocolClient {
    /// Wrap a started transport and begin reading its events.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, events: EventReceiver, options: ClientOptions) -> Self {
        let shared = Arc::new(Shared {
            transport,
            state: Mutex::new(ClientState {
                phase: ClientPhase::Uninitialized,
                next_id: 1,
                pending: HashMap::new(),
                server: None,
            }),
            on_error: options.on_error.clone(),
            dispatcher: Mutex::new(None),
        });

        let handle = tokio::spawn(run_dispatcher(Arc::downgrade(&shared), events));
        *shared
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Self { shared, options }
    }

    pub fn phase(&self) -> ClientPhase {
        self.shared.state().phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == ClientPhase::Closed
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.state().pending.len()
    }

    /// Handshake result, once `initialize` has succeeded.
    pub fn server(&self) -> Option<InitializeResult> {
        self.shared.state().server.clone()
    }

    /// Capabilities the server declared during the handshake.
    pub fn server_capabilities(&self) -> Option<Value> {
        self.server().map(|s| s.capabilities)
    }

    /// Negotiated protocol version.
    pub fn protocol_version(&self) -> Option<String> {
        self.server().map(|s| s.protocol_version)
    }

    /// Run the initialize / initialized handshake.
    ///
    /// Any failure closes the client before the error is returned.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        {
            let mut state = self.shared.state();
            match state.phase {
                ClientPhase::Uninitialized => state.phase = ClientPhase::Handshaking,
                ClientPhase::Closed => return Err(Error::Closed),
                phase => {
                    return Err(Error::invalid_state(format!(
                        "initialize called while {:?}",
                        phase
                    )));
                }
            }
        }

        let result = self.handshake().await;
        if let Err(e) = &result {
            log::warn!("handshake failed: {}", e);
            self.close();
        }
        result
    }

    async fn handshake(&self) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.options.capabilities.clone(),
            client_info: self.options.client_info.clone(),
        };

        let value = self
            .send_request(METHOD_INITIALIZE, Some(serde_json::to_value(params)?))
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;

        if !self
            .options
            .supported_versions
            .iter()
            .any(|v| *v == result.protocol_version)
        {
            return Err(Error::UnsupportedVersion(result.protocol_version));
        }

        self.notification(METHOD_INITIALIZED, None).await?;

        let mut state = self.shared.state();
        if state.phase == ClientPhase::Closed {
            return Err(Error::Closed);
        }
        state.phase = ClientPhase::Ready;
        state.server = Some(result.clone());
        log::debug!(
            "handshake complete (protocol {}, server {:?})",
            result.protocol_version,
            result.server_info.as_ref().map(|s| s.name.as_str())
        );
        Ok(result)
    }

    /// Send a request and wait for its response.
    ///
    /// Only valid once the handshake has completed. Fails immediately with
    /// [`Error::Closed`] after close.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.send_request(method, params).await
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let (id, rx) = {
            let mut state = self.shared.state();
            match state.phase {
                ClientPhase::Ready => {}
                ClientPhase::Handshaking if method == METHOD_INITIALIZE => {}
                ClientPhase::Closed => return Err(Error::Closed),
                phase => {
                    return Err(Error::invalid_state(format!(
                        "cannot send '{}' while {:?}",
                        method, phase
                    )));
                }
            }
            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(id, tx);
            (id, rx)
        };

        log::debug!("request {} -> {}", id, method);
        let message = serde_json::to_value(JsonRpcRequest::new(id, method, params))?;
        if let Err(e) = self.shared.transport.send(message).await {
            self.shared.state().pending.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Closed),
        }
    }

    /// Send a notification. No id is assigned and nothing is awaited but the POST.
    pub async fn notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        match self.phase() {
            ClientPhase::Closed => return Err(Error::Closed),
            ClientPhase::Uninitialized => {
                return Err(Error::invalid_state(format!(
                    "cannot notify '{}' before initialize",
                    method
                )));
            }
            ClientPhase::Handshaking | ClientPhase::Ready => {}
        }
        let message = serde_json::to_value(JsonRpcNotification::new(method, params))?;
        self.shared.transport.send(message).await
    }

    /// Liveness check.
    pub async fn ping(&self) -> Result<()> {
        self.request(METHOD_PING, None).await.map(|_| ())
    }

    /// List every tool the server offers, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let page: ListToolsResult =
                serde_json::from_value(self.request(METHOD_TOOLS_LIST, params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() && Some(&next) != cursor.as_ref() => {
                    cursor = Some(next)
                }
                _ => break,
            }
        }
        Ok(tools)
    }

    /// Invoke a tool by name.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let value = self
            .request(METHOD_TOOLS_CALL, Some(serde_json::to_value(params)?))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Close the transport and fail every pending request. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.shared.close();
    }
}

async fn run_dispatcher(shared: std::sync::Weak<Shared>, events: EventReceiver) {
    let mut events = UnboundedReceiverStream::new(events);

    while let Some(event) = events.next().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Message(data) => match IncomingMessage::decode(&data) {
                Ok(message) => shared.dispatch(message),
                Err(e) => shared.report(e),
            },
            TransportEvent::Error(e) => {
                log::warn!("event stream error: {}", e);
            }
            TransportEvent::Closed => {
                log::debug!("event stream ended");
                shared.close();
                return;
            }
        }
    }

    // Every sender is gone: the transport can no longer deliver anything.
    if let Some(shared) = shared.upgrade() {
        shared.close();
    }
}
