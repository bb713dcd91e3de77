//! Hub protocol message types
//!
//! JSON hub protocol (version 1) as spoken by SignalR-style hubs. Every
//! message is a JSON object terminated by the ASCII record separator
//! (`0x1E`); one WebSocket text frame may carry several messages.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConnectionError, MalformedPayload, ProtocolError};
use crate::models::PointPayload;

/// Terminates every hub message
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Protocol name sent in the handshake
pub const PROTOCOL_NAME: &str = "json";

/// Protocol version sent in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Hub targets the client listens for
pub mod targets {
    pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
    pub const SEND_STATE_CHANGE: &str = "SendStateChange";
    pub const INITIALIZE_STATE: &str = "InitializeState";
    pub const REMOVE_POINT: &str = "RemovePoint";

    /// Hub method invoked by `send_message`
    pub const SEND_MESSAGE: &str = "SendMessage";
}

const TYPE_INVOCATION: u64 = 1;
const TYPE_COMPLETION: u64 = 3;
const TYPE_PING: u64 = 6;
const TYPE_CLOSE: u64 = 7;

/// Hub's answer to the handshake; empty on success
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

/// Encoded handshake request, separator included
pub fn handshake_request() -> String {
    let mut text = serde_json::json!({
        "protocol": PROTOCOL_NAME,
        "version": PROTOCOL_VERSION,
    })
    .to_string();
    text.push(RECORD_SEPARATOR);
    text
}

/// Split a text frame into individual messages
pub fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|frame| !frame.is_empty())
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvocationWire {
    #[serde(rename = "type")]
    kind: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    target: String,
    #[serde(default)]
    arguments: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionWire {
    invocation_id: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseWire {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

/// Messages exchanged with the hub
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Call a method on the other side
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    /// Result of an invocation that carried an id
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    /// Keep-alive
    Ping,
    /// Hub is closing the connection
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Message type the client does not act on (stream items, cancels)
    Other(u64),
}

impl HubMessage {
    /// Encode to JSON text with the trailing separator
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let value = match self {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => serde_json::to_value(InvocationWire {
                kind: TYPE_INVOCATION,
                invocation_id: invocation_id.clone(),
                target: target.clone(),
                arguments: arguments.clone(),
            })?,
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let mut value = serde_json::json!({
                    "type": TYPE_COMPLETION,
                    "invocationId": invocation_id,
                });
                if let Some(result) = result {
                    value["result"] = result.clone();
                }
                if let Some(error) = error {
                    value["error"] = Value::String(error.clone());
                }
                value
            }
            HubMessage::Ping => serde_json::json!({ "type": TYPE_PING }),
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                let mut value = serde_json::json!({
                    "type": TYPE_CLOSE,
                    "allowReconnect": allow_reconnect,
                });
                if let Some(error) = error {
                    value["error"] = Value::String(error.clone());
                }
                value
            }
            HubMessage::Other(kind) => serde_json::json!({ "type": kind }),
        };

        let mut text = serde_json::to_string(&value)?;
        text.push(RECORD_SEPARATOR);
        Ok(text)
    }

    /// Decode one message (without separator)
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(frame)?;
        let kind = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::MissingType)?;

        let message = match kind {
            TYPE_INVOCATION => {
                let wire: InvocationWire = serde_json::from_value(value)?;
                HubMessage::Invocation {
                    invocation_id: wire.invocation_id,
                    target: wire.target,
                    arguments: wire.arguments,
                }
            }
            TYPE_COMPLETION => {
                let wire: CompletionWire = serde_json::from_value(value)?;
                HubMessage::Completion {
                    invocation_id: wire.invocation_id,
                    result: wire.result,
                    error: wire.error,
                }
            }
            TYPE_PING => HubMessage::Ping,
            TYPE_CLOSE => {
                let wire: CloseWire = serde_json::from_value(value)?;
                HubMessage::Close {
                    error: wire.error,
                    allow_reconnect: wire.allow_reconnect,
                }
            }
            other => HubMessage::Other(other),
        };

        Ok(message)
    }
}

/// Inbound hub events the client understands
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Free text
    ReceiveMessage(String),
    /// One point changed
    SendStateChange(PointPayload),
    /// Full initial state; each entry decoded independently
    InitializeState(Vec<Result<PointPayload, MalformedPayload>>),
    /// A point went away
    RemovePoint(String),
}

impl ServerEvent {
    /// Map an invocation to an event
    ///
    /// Returns `Ok(None)` for targets the client does not listen to.
    pub fn decode(target: &str, arguments: Vec<Value>) -> Result<Option<Self>, MalformedPayload> {
        let decode_err = |details: String| MalformedPayload::Decode {
            target: target.to_string(),
            details,
        };
        let first = || {
            arguments
                .first()
                .cloned()
                .ok_or_else(|| decode_err("missing argument".to_string()))
        };

        let event = match target {
            targets::RECEIVE_MESSAGE => match first()? {
                Value::String(text) => ServerEvent::ReceiveMessage(text),
                other => return Err(decode_err(format!("expected a string, got {}", other))),
            },
            targets::SEND_STATE_CHANGE => {
                let payload = serde_json::from_value(first()?).map_err(|e| decode_err(e.to_string()))?;
                ServerEvent::SendStateChange(payload)
            }
            targets::INITIALIZE_STATE => match first()? {
                Value::Array(items) => ServerEvent::InitializeState(
                    items
                        .into_iter()
                        .map(|item| {
                            serde_json::from_value(item).map_err(|e| decode_err(e.to_string()))
                        })
                        .collect(),
                ),
                other => return Err(decode_err(format!("expected an array, got {}", other))),
            },
            targets::REMOVE_POINT => match first()? {
                Value::String(id) => ServerEvent::RemovePoint(id),
                other => return Err(decode_err(format!("expected a string id, got {}", other))),
            },
            _ => return Ok(None),
        };

        Ok(Some(event))
    }
}

/// One transport entry of a negotiate response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

/// Body of `POST {hub}/negotiate`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub connection_token: Option<String>,
    #[serde(default)]
    pub negotiate_version: u32,
    #[serde(default)]
    pub available_transports: Vec<AvailableTransport>,
    /// Redirect to another hub endpoint
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl NegotiateResponse {
    pub fn supports_websockets(&self) -> bool {
        self.available_transports.iter().any(|t| {
            t.transport == "WebSockets" && t.transfer_formats.iter().any(|f| f == "Text")
        })
    }

    /// Token to pass as `id` on the WebSocket URL
    pub fn websocket_id(&self) -> Option<&str> {
        if self.negotiate_version >= 1 {
            self.connection_token.as_deref()
        } else {
            self.connection_id.as_deref()
        }
    }
}

/// Parse a hub URL (http, https, ws or wss)
pub fn parse_hub_url(url: &str) -> Result<Url, ConnectionError> {
    let parsed = Url::parse(url).map_err(|e| ConnectionError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(parsed),
        other => Err(ConnectionError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

/// `{hub}/negotiate?negotiateVersion=1`, keeping any existing query
pub fn negotiate_url(hub: &Url) -> Url {
    let mut url = hub.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push("negotiate");
    }
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    url
}

/// WebSocket endpoint for a hub URL
pub fn websocket_url(
    hub: &Url,
    connection_token: Option<&str>,
    access_token: Option<&str>,
) -> Result<Url, ConnectionError> {
    let mut url = hub.clone();
    let scheme = match hub.scheme() {
        "http" | "ws" => "ws",
        _ => "wss",
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::InvalidUrl {
            url: hub.to_string(),
            reason: format!("cannot switch scheme to {}", scheme),
        })?;

    if let Some(token) = connection_token {
        url.query_pairs_mut().append_pair("id", token);
    }
    if let Some(token) = access_token {
        url.query_pairs_mut().append_pair("access_token", token);
    }

    Ok(url)
}
