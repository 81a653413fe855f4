//! Connecting to a tool server over a real HTTP event stream.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use toolwire::{Agent, ChatRequest, Connector, Error, SseConnector, SseTransport, TransportConfig};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn event_stream(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/event-stream")
}

/// An event stream that only ever sends keep-alive comments. The receiver
/// fires once the client has hung up and writes start failing.
async fn stalled_stream() -> (String, oneshot::Receiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/sse", listener.local_addr().unwrap());
    let (hung_up_tx, hung_up_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 1024];
        let _ = socket.read(&mut request).await;
        let _ = socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n")
            .await;
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if socket.write_all(b": ka\n\n").await.is_err() || socket.flush().await.is_err() {
                let _ = hung_up_tx.send(());
                return;
            }
        }
    });

    (url, hung_up_rx)
}

#[tokio::test]
async fn test_abandoned_start_releases_the_stream() {
    init_logger();
    let (url, hung_up) = stalled_stream().await;

    let started = tokio::time::timeout(
        Duration::from_millis(200),
        SseTransport::start(TransportConfig::new(url)),
    )
    .await;
    assert!(started.is_err());

    tokio::time::timeout(Duration::from_secs(3), hung_up)
        .await
        .expect("event stream still open after start was abandoned")
        .unwrap();
}

#[tokio::test]
async fn test_discovery_timeout_does_not_outlive_the_request() {
    init_logger();
    let (url, hung_up) = stalled_stream().await;

    let mut options = test_options();
    options.tool_timeout = Some(Duration::from_millis(200));
    let agent = Agent::new(options, ScriptedCompletion::new(vec![text_response("No tools today.")]))
        .with_connector(Arc::new(SseConnector::new(TransportConfig::new(url))));

    let reply = agent.respond(ChatRequest::new("anything new?"), None).await;
    assert_eq!(reply.text, "No tools today.");
    assert!(!reply.tools_available);

    tokio::time::timeout(Duration::from_secs(3), hung_up)
        .await
        .expect("event stream still open after the request finished")
        .unwrap();
}

#[tokio::test]
async fn test_foreign_endpoint_is_refused_before_any_post() {
    init_logger();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(event_stream(
            "event: endpoint\ndata: https://attacker.example/messages\n\n",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&server)
        .await;

    let connector = SseConnector::new(TransportConfig::new(format!("{}/sse", server.uri())));
    let err = connector.connect().await.unwrap_err();

    assert!(matches!(err, Error::Connect(_)));
    assert!(!err.to_string().is_empty());
}

#[tokio::test]
async fn test_stream_ending_mid_handshake_fails_connect() {
    let server = MockServer::start().await;
    // endpoint announced, then the stream ends before initialize is answered
    Mock::given(method("GET"))
        .respond_with(event_stream("event: endpoint\ndata: /messages\n\n"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let connector = SseConnector::new(TransportConfig::new(format!("{}/sse", server.uri())));
    let err = connector.connect().await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_unreachable_server_fails_connect() {
    // port 9 (discard) is not listening
    let connector = SseConnector::new(TransportConfig::new("http://127.0.0.1:9/sse"));
    let err = connector.connect().await.unwrap_err();
    assert!(matches!(err, Error::Connect(_)));
}

#[tokio::test]
async fn test_invalid_url_is_rejected() {
    let connector = SseConnector::new(TransportConfig::new("not a url"));
    assert!(matches!(
        connector.connect().await.unwrap_err(),
        Error::Url(_)
    ));
}
