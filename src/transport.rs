//! Transport: one long-lived event stream in, one POST per message out.
//!
//! ```text
//!  client                                  server
//!    │ GET  /sse  (Accept: text/event-stream) │
//!    │ ─────────────────────────────────────▶ │
//!    │ ◀── event: endpoint                    │   callback URL, sent once
//!    │       data: /messages?session_id=…     │
//!    │                                        │
//!    │ POST /messages?session_id=…  {json}    │
//!    │ ─────────────────────────────────────▶ │
//!    │ ◀── event: message                     │   responses / notifications
//!    │       data: {json}                     │
//! ```
//!
//! [`SseTransport::start`] returns the transport together with the receiving
//! half of a channel. Every `message` frame is forwarded into that channel in
//! the order the parser flushed it; the protocol client is the only reader.

use crate::sse::{FrameStream, response_frames};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

/// Something that happened on the inbound stream.
#[derive(Debug)]
pub enum TransportEvent {
    /// Payload of one `message` frame
    Message(String),
    /// The stream failed; a `Closed` event follows
    Error(Error),
    /// The stream ended
    Closed,
}

/// Receiving half handed to the protocol client.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Outbound half of a connection.
///
/// [`SseTransport`] is the production implementation. Tests script a server
/// by implementing this over in-memory channels.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one JSON message to the server.
    async fn send(&self, message: Value) -> Result<()>;

    /// Tear the connection down. Must be idempotent.
    fn close(&self);
}

/// Called once when a transport is closed.
pub type CloseObserver = Arc<dyn Fn() + Send + Sync>;

/// Settings for [`SseTransport`].
#[derive(Clone, Default)]
pub struct TransportConfig {
    /// URL of the event stream
    pub url: String,
    /// Extra headers sent on both the stream request and every POST
    pub headers: Vec<(String, String)>,
    /// TCP connect timeout; the stream itself is never timed out
    pub connect_timeout: Option<Duration>,
    /// Observer invoked exactly once when the transport closes
    pub on_close: Option<CloseObserver>,
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("url", &self.url)
            .field("headers", &format!("{} headers", self.headers.len()))
            .field("connect_timeout", &self.connect_timeout)
            .field("on_close", &self.on_close.as_ref().map(|_| "<observer>"))
            .finish()
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_on_close(mut self, observer: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(observer));
        self
    }
}

/// Server-Sent Events transport with a POST back-channel.
pub struct SseTransport {
    http: reqwest::Client,
    stream_url: Url,
    endpoint: Url,
    headers: Vec<(String, String)>,
    closed: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    on_close: Mutex<Option<CloseObserver>>,
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("stream_url", &self.stream_url.as_str())
            .field("endpoint", &self.endpoint.as_str())
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its endpoint.
    ///
    /// Fails with [`Error::Connect`] when the stream cannot be opened, ends
    /// before an `endpoint` event, or announces an endpoint on another origin.
    /// Nothing is ever POSTed before this returns `Ok`.
    pub async fn start(config: TransportConfig) -> Result<(Self, EventReceiver)> {
        let stream_url = Url::parse(&config.url)?;

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        let mut request = http
            .get(stream_url.clone())
            .header(ACCEPT, "text/event-stream");
        for (key, value) in &config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::connect(format!("failed to open event stream: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::connect(format!(
                "event stream returned HTTP {}",
                response.status()
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        // Aborts the reader if this future is dropped while waiting below.
        let reader = ReaderGuard(Some(tokio::spawn(read_stream(
            response_frames(response),
            stream_url.clone(),
            endpoint_tx,
            events_tx,
        ))));

        let endpoint = match endpoint_rx.await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::connect(
                    "event stream ended before announcing an endpoint",
                ));
            }
        };

        log::debug!("tool server endpoint resolved: {}", endpoint);

        let (closed, _) = watch::channel(false);
        let transport = Self {
            http,
            stream_url,
            endpoint,
            headers: config.headers,
            closed,
            reader: Mutex::new(reader.disarm()),
            on_close: Mutex::new(config.on_close),
        };
        Ok((transport, events_rx))
    }

    /// URL the event stream was opened on.
    pub fn stream_url(&self) -> &Url {
        &self.stream_url
    }

    /// Callback URL learned from the `endpoint` event.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, message: Value) -> Result<()> {
        let closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(Error::Closed);
        }

        let mut request = self.http.post(self.endpoint.clone()).json(&message);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let post = async {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|e| {
                    log::warn!("Failed to read error response body: {}", e);
                    String::new()
                });
                return Err(Error::transport(status.as_u16(), body));
            }
            Ok(())
        };

        tokio::select! {
            result = post => result,
            _ = wait_closed(closed) => Err(Error::Closed),
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);

        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
            log::debug!("event stream closed: {}", self.stream_url);
        }

        let observer = self
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(observer) = observer {
            observer();
        }
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owns the reader task until the transport takes it over.
struct ReaderGuard(Option<JoinHandle<()>>);

impl ReaderGuard {
    fn disarm(mut self) -> Option<JoinHandle<()>> {
        self.0.take()
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if let Some(reader) = self.0.take() {
            reader.abort();
            log::debug!("event stream abandoned before an endpoint was announced");
        }
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Resolve the announced endpoint against the stream URL and enforce same-origin.
fn resolve_endpoint(stream_url: &Url, announced: &str) -> Result<Url> {
    let endpoint = stream_url
        .join(announced.trim())
        .map_err(|e| Error::connect(format!("invalid endpoint '{}': {}", announced, e)))?;

    if endpoint.origin() != stream_url.origin() {
        return Err(Error::connect(format!(
            "endpoint origin {} does not match stream origin {}",
            endpoint.origin().ascii_serialization(),
            stream_url.origin().ascii_serialization()
        )));
    }
    Ok(endpoint)
}

async fn read_stream(
    mut frames: FrameStream,
    stream_url: Url,
    endpoint_tx: oneshot::Sender<Result<Url>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut endpoint_tx = Some(endpoint_tx);

    while let Some(item) = frames.next().await {
        let frame = match item {
            Ok(frame) => frame,
            Err(e) => match endpoint_tx.take() {
                Some(tx) => {
                    let _ = tx.send(Err(Error::connect(format!("event stream failed: {}", e))));
                    return;
                }
                None => {
                    let _ = events.send(TransportEvent::Error(e));
                    break;
                }
            },
        };

        match frame.event.as_str() {
            "endpoint" => match endpoint_tx.take() {
                Some(tx) => {
                    let resolved = resolve_endpoint(&stream_url, &frame.data);
                    let rejected = resolved.is_err();
                    // nobody waiting means start() was abandoned
                    if tx.send(resolved).is_err() || rejected {
                        return;
                    }
                }
                None => log::warn!("ignoring repeated endpoint event: {}", frame.data),
            },
            "message" => {
                if endpoint_tx.is_some() {
                    log::warn!("dropping message received before the endpoint event");
                    continue;
                }
                if events.send(TransportEvent::Message(frame.data)).is_err() {
                    return;
                }
            }
            other => log::debug!("ignoring '{}' event", other),
        }
    }

    if endpoint_tx.is_none() {
        let _ = events.send(TransportEvent::Closed);
    }
}
