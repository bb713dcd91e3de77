//! Error types
//!
//! Typed errors for the hub connection, outbound invocations, inbound
//! payload validation and marker rendering. None of them are fatal: the worst
//! outcome is a stale marker set until the next tick or reconnect.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors establishing or keeping a hub connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Hub URL could not be turned into a WebSocket endpoint
    #[error("Invalid hub URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Negotiate request failed at the HTTP level
    #[error("Negotiation with '{url}' failed: {source}")]
    Negotiate {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Hub answered the negotiate request with an error or garbage
    #[error("Hub rejected negotiation: {0}")]
    NegotiateRejected(String),

    /// Hub does not offer a WebSocket transport
    #[error("Hub at '{0}' does not offer a WebSocket transport")]
    NoWebSocketTransport(String),

    /// WebSocket connect or I/O error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Handshake response carried an error
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// No handshake response within the configured timeout
    #[error("Timeout waiting for hub handshake ({0}). Check that the hub is running.")]
    HandshakeTimeout(String),

    /// Hub closed the connection
    #[error("Hub closed the connection{}", .0.as_ref().map(|e| format!(": {}", e)).unwrap_or_default())]
    Closed(Option<String>),
}

impl ConnectionError {
    /// Whether reconnecting has a chance of succeeding
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectionError::InvalidUrl { .. } | ConnectionError::NoWebSocketTransport(_)
        )
    }
}

/// Errors from outbound invocations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No live connection to send on
    #[error("Not connected to the hub")]
    NotConnected,

    /// Connection dropped before the hub completed the invocation
    #[error("Connection lost before the hub answered")]
    ConnectionLost,

    /// Hub completed the invocation with an error
    #[error("Hub rejected invocation: {0}")]
    Rejected(String),

    /// Arguments could not be serialized
    #[error("Failed to encode invocation: {0}")]
    Encode(String),
}

/// Inbound point payload failed validation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MalformedPayload {
    #[error("Point has an empty id")]
    EmptyId,

    #[error("Point '{id}' has a non-finite coordinate ({lat}, {lng})")]
    NonFinite { id: String, lat: f64, lng: f64 },

    #[error("Point '{id}' latitude {lat} is outside [-90, 90]")]
    LatitudeOutOfRange { id: String, lat: f64 },

    #[error("Point '{id}' longitude {lng} is outside [-180, 180]")]
    LongitudeOutOfRange { id: String, lng: f64 },

    /// Arguments did not have the expected shape at all
    #[error("Could not decode {target} arguments: {details}")]
    Decode { target: String, details: String },
}

/// Rendering surface rejected a marker operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("Surface rejected marker '{id}': {reason}")]
    Rejected { id: String, reason: String },

    #[error("Surface does not know marker handle {0}")]
    UnknownHandle(u64),
}

/// Hub frame could not be decoded
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame has no numeric 'type' field")]
    MissingType,
}
