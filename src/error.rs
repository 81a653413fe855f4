//! The crate-wide error type

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between the model, the tool server and us
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The event stream could not be opened, or announced an unusable endpoint
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The server rejected an outbound message
    #[error("Transport error (HTTP {status}): {body}")]
    Transport { status: u16, body: String },

    /// The server negotiated a protocol version we do not speak
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// The connection is closed; either the operation was attempted after
    /// close, or a pending request was settled by the close
    #[error("Connection closed")]
    Closed,

    /// The peer sent something the protocol does not allow
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server answered a request with a JSON-RPC error object
    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Operation not valid in the client's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Rejected by a builder or missing from the environment
    #[error("Configuration error: {0}")]
    Config(String),

    /// The completion service answered with an error status
    #[error("Completion service error: {0}")]
    Api(String),

    /// A response stream broke off or carried garbage
    #[error("Stream error: {0}")]
    Stream(String),

    /// A tool ran and failed, or does not exist
    #[error("Tool failed: {0}")]
    ToolExecution(String),

    /// A deadline passed
    #[error("Timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn connect(msg: impl Into<String>) -> Self {
        Error::Connect(msg.into())
    }

    /// A POST the server refused
    pub fn transport(status: u16, body: impl Into<String>) -> Self {
        Error::Transport {
            status,
            body: body.into(),
        }
    }

    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn api(msg: impl Into<String>) -> Self {
        Error::Api(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    pub fn tool(msg: impl Into<String>) -> Self {
        Error::ToolExecution(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Whether this error ends the current tool round.
    ///
    /// Fatal errors mean the connection can no longer be trusted: the loop
    /// closes it and answers with its fallback message. Everything else is a
    /// per-invocation failure that gets reported back to the model.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Http(_)
                | Error::Connect(_)
                | Error::Transport { .. }
                | Error::Closed
                | Error::ProtocolViolation(_)
                | Error::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_connect() {
        let err = Error::connect("cross-origin endpoint");
        assert!(matches!(err, Error::Connect(_)));
        assert_eq!(err.to_string(), "Connection failed: cross-origin endpoint");
    }

    #[test]
    fn test_error_transport_carries_status_and_body() {
        let err = Error::transport(503, "overloaded");
        match &err {
            Error::Transport { status, body } => {
                assert_eq!(*status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.to_string(), "Transport error (HTTP 503): overloaded");
    }

    #[test]
    fn test_error_rpc() {
        let err = Error::Rpc {
            code: -32601,
            message: "Method not found".to_string(),
            data: None,
        };
        assert_eq!(err.to_string(), "RPC error -32601: Method not found");
    }

    #[test]
    fn test_display_of_leaf_errors() {
        assert_eq!(
            Error::tool("Tool not found: lookup").to_string(),
            "Tool failed: Tool not found: lookup"
        );
        assert_eq!(Error::timeout().to_string(), "Timed out");
        assert_eq!(Error::other("plain").to_string(), "plain");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Closed.is_fatal());
        assert!(Error::transport(500, "").is_fatal());
        assert!(Error::protocol_violation("unknown id").is_fatal());
        assert!(Error::timeout().is_fatal());

        assert!(!Error::tool("boom").is_fatal());
        assert!(
            !Error::Rpc {
                code: -32602,
                message: "Unknown tool".to_string(),
                data: None,
            }
            .is_fatal()
        );
        assert!(!Error::UnsupportedVersion("9999-01-01".to_string()).is_fatal());
    }

    #[test]
    fn test_malformed_payload_converts() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{\"jsonrpc\":")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Json(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_from_url() {
        let url_err = url::Url::parse("not a url").unwrap_err();
        let err: Error = url_err.into();
        assert!(matches!(err, Error::Url(_)));
    }
}
