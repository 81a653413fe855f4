//! A connection to one tool server: transport + protocol client + tool cache.
//!
//! A [`Connection`] belongs to a single user request. It is opened on first
//! use, caches the server's tool list for its own lifetime, and is closed when
//! dropped, so every exit path of the request tears it down exactly once.

use crate::client::{ClientOptions, ProtocolClient};
use crate::protocol::{CallToolResult, InitializeResult, ToolDescriptor};
use crate::transport::{EventReceiver, SseTransport, Transport, TransportConfig};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// An initialized session with a tool server.
pub struct Connection {
    client: Arc<ProtocolClient>,
    server: InitializeResult,
    tools: OnceCell<Vec<ToolDescriptor>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("protocol_version", &self.server.protocol_version)
            .field("closed", &self.client.is_closed())
            .field("tools_cached", &self.tools.initialized())
            .finish()
    }
}

impl Connection {
    /// Open the event stream, learn the endpoint and run the handshake.
    pub async fn open(transport: TransportConfig, options: ClientOptions) -> Result<Self> {
        let (transport, events) = SseTransport::start(transport).await?;
        Self::from_transport(Arc::new(transport), events, options).await
    }

    /// Handshake over an already-started transport.
    pub async fn from_transport(
        transport: Arc<dyn Transport>,
        events: EventReceiver,
        options: ClientOptions,
    ) -> Result<Self> {
        let client = ProtocolClient::new(transport, events, options);
        let server = client.initialize().await?;
        Ok(Self {
            client: Arc::new(client),
            server,
            tools: OnceCell::new(),
        })
    }

    pub fn client(&self) -> &Arc<ProtocolClient> {
        &self.client
    }

    /// Negotiated protocol version
    pub fn protocol_version(&self) -> &str {
        &self.server.protocol_version
    }

    /// Capabilities the server declared in the handshake
    pub fn server_capabilities(&self) -> &Value {
        &self.server.capabilities
    }

    pub fn server(&self) -> &InitializeResult {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// The server's tools, fetched on first call and cached after that.
    ///
    /// A failed fetch is not cached; the next call tries again.
    pub async fn tools(&self) -> Result<&[ToolDescriptor]> {
        let tools = self
            .tools
            .get_or_try_init(|| async {
                let tools = self.client.list_tools().await?;
                log::debug!("discovered {} tool(s)", tools.len());
                Ok::<_, crate::Error>(tools)
            })
            .await?;
        Ok(tools.as_slice())
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        self.client.call_tool(name, arguments).await
    }

    /// Close the connection. Idempotent; also runs on drop.
    pub fn close(&self) {
        self.client.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.client.close();
    }
}

/// Opens a fresh [`Connection`] for each request.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection>;
}

/// Connects to a tool server over Server-Sent Events.
#[derive(Debug, Clone)]
pub struct SseConnector {
    transport: TransportConfig,
    client: ClientOptions,
}

impl SseConnector {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            client: ClientOptions::default(),
        }
    }

    pub fn with_client_options(mut self, options: ClientOptions) -> Self {
        self.client = options;
        self
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn connect(&self) -> Result<Connection> {
        log::debug!("connecting to tool server at {}", self.transport.url);
        Connection::open(self.transport.clone(), self.client.clone()).await
    }
}
