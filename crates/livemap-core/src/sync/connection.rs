//! Persistent hub connection
//!
//! Maintains a long-lived WebSocket connection to the hub. Once the first
//! connection is established the task reconnects on its own with exponential
//! backoff; the client only observes the resulting state transitions.
//!
//! ## Lifecycle
//!
//! 1. Negotiate (unless skipped) to obtain a connection token
//! 2. Open the WebSocket and exchange the protocol handshake
//! 3. Forward inbound invocations, answer outbound ones, send keep-alives
//! 4. On loss: `reconnecting` -> backoff -> back to 1, until shutdown or
//!    the attempt budget runs out

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::protocol::{self, HandshakeResponse, HubMessage, NegotiateResponse, ServerEvent};
use crate::dispatcher::{ConnectionState, ErrorInfo};
use crate::error::{ConnectionError, MalformedPayload, SendError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Redirects followed during negotiation before giving up
const MAX_NEGOTIATE_REDIRECTS: usize = 5;

/// Commands sent to the connection task
#[derive(Debug)]
pub enum TransportCommand {
    /// Invoke a hub method and report the hub's completion
    Invoke {
        target: String,
        arguments: Vec<Value>,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    /// Close the connection and stop the task
    Shutdown,
}

/// Events emitted by the connection task
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Hub invoked one of the client targets
    Inbound(ServerEvent),
    /// Hub invoked a client target with arguments that did not decode
    Malformed(MalformedPayload),
    /// Connection state changed (reconnecting, reconnected, closed)
    StateChanged(ConnectionState),
}

/// Link status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Not connected, not trying
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Connected and handshaken
    Connected,
    /// Lost the connection, trying again
    Reconnecting,
}

/// Client side of a transport
pub struct TransportHandle {
    /// Send commands to the transport
    pub command_tx: mpsc::Sender<TransportCommand>,
    /// Receive events from the transport
    pub event_rx: mpsc::Receiver<TransportEvent>,
    /// Watch link status
    pub status_rx: watch::Receiver<LinkStatus>,
    /// Id the hub assigned during negotiation
    pub connection_id: Option<String>,
}

/// Transport side of a transport
pub struct TransportEnd {
    pub command_rx: mpsc::Receiver<TransportCommand>,
    pub event_tx: mpsc::Sender<TransportEvent>,
    pub status_tx: watch::Sender<LinkStatus>,
}

impl TransportEnd {
    fn set_status(&self, status: LinkStatus) {
        let _ = self.status_tx.send(status);
    }

    async fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event).await;
    }

    async fn publish(&self, status: LinkStatus, state: ConnectionState) {
        self.set_status(status);
        self.emit(TransportEvent::StateChanged(state)).await;
    }
}

/// Create a connected pair of transport channels
///
/// `HubConnection` uses this internally; other transports (and tests) can
/// drive a `SyncClient` through the `TransportEnd`.
pub fn transport_pair(buffer: usize) -> (TransportHandle, TransportEnd) {
    let (command_tx, command_rx) = mpsc::channel(buffer);
    let (event_tx, event_rx) = mpsc::channel(buffer);
    let (status_tx, status_rx) = watch::channel(LinkStatus::Disconnected);

    (
        TransportHandle {
            command_tx,
            event_rx,
            status_rx,
            connection_id: None,
        },
        TransportEnd {
            command_rx,
            event_tx,
            status_tx,
        },
    )
}

/// Configuration for the hub connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Hub URL (http/https negotiates, ws/wss connects directly)
    pub url: String,
    /// Connect straight to the WebSocket endpoint
    pub skip_negotiation: bool,
    /// How long to wait for the handshake response
    pub handshake_timeout: Duration,
    /// Interval between client pings
    pub keep_alive_interval: Duration,
    /// Connection is considered lost after this long without a message
    pub server_timeout: Duration,
    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
    /// Give up after this many failed reconnect attempts (None = never)
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            skip_negotiation: false,
            handshake_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: None,
        }
    }
}

/// Exponential backoff between reconnect attempts
#[derive(Debug)]
pub(crate) struct Backoff {
    current: Duration,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base,
            base,
            max,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// An open, handshaken WebSocket
struct Session {
    stream: WsStream,
    connection_id: Option<String>,
    /// Messages that arrived in the same frame as the handshake response
    leftover: Vec<String>,
}

/// Where to open the WebSocket
struct Endpoint {
    url: String,
    connection_id: Option<String>,
}

/// Why a session ended
enum SessionEnd {
    /// Client asked to stop
    Shutdown,
    /// Connection dropped; reconnect
    Lost(ConnectionError),
    /// Hub closed the connection and does not want a reconnect
    Refused(Option<String>),
}

/// Entry point for hub connections
pub struct HubConnection;

impl HubConnection {
    /// Connect to the hub and spawn the connection task
    ///
    /// Fails if the first connection cannot be established; after that,
    /// losses are handled by the task's reconnect policy.
    pub async fn connect(config: ConnectionConfig) -> Result<TransportHandle, ConnectionError> {
        let (mut handle, end) = transport_pair(64);

        end.set_status(LinkStatus::Connecting);
        info!("Connecting to hub {}", config.url);

        let session = match open_session(&config).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Hub connection failed: {}", e);
                end.set_status(LinkStatus::Disconnected);
                return Err(e);
            }
        };

        info!(
            "Connected to hub {} (connection id: {})",
            config.url,
            session.connection_id.as_deref().unwrap_or("none")
        );
        handle.connection_id = session.connection_id.clone();
        end.set_status(LinkStatus::Connected);

        tokio::spawn(connection_task(config, session, end));

        Ok(handle)
    }
}

/// Main connection loop with reconnection
async fn connection_task(config: ConnectionConfig, first: Session, mut end: TransportEnd) {
    let mut backoff = Backoff::new(config.initial_reconnect_delay, config.max_reconnect_delay);
    let mut session = first;

    loop {
        let lost = match run_session(&config, session, &mut end).await {
            SessionEnd::Shutdown => {
                info!("Hub connection closed");
                end.publish(LinkStatus::Disconnected, ConnectionState::closed(None))
                    .await;
                return;
            }
            SessionEnd::Refused(error) => {
                warn!("Hub closed the connection without reconnect: {:?}", error);
                end.publish(
                    LinkStatus::Disconnected,
                    ConnectionState::closed(error.map(ErrorInfo::new)),
                )
                .await;
                return;
            }
            SessionEnd::Lost(error) => error,
        };

        warn!("Hub connection lost: {}", lost);
        end.publish(
            LinkStatus::Reconnecting,
            ConnectionState::reconnecting(Some(ErrorInfo::new(lost.to_string()))),
        )
        .await;

        match reconnect(&config, &mut backoff, &mut end, lost).await {
            Ok(Some(next)) => {
                backoff.reset();
                info!("Reconnected to hub {}", config.url);
                end.publish(
                    LinkStatus::Connected,
                    ConnectionState::connected(next.connection_id.clone()),
                )
                .await;
                session = next;
            }
            Ok(None) => {
                info!("Hub connection closed while reconnecting");
                end.publish(LinkStatus::Disconnected, ConnectionState::closed(None))
                    .await;
                return;
            }
            Err(last) => {
                warn!("Giving up on hub {}: {}", config.url, last);
                end.publish(
                    LinkStatus::Disconnected,
                    ConnectionState::closed(Some(ErrorInfo::new(last.to_string()))),
                )
                .await;
                return;
            }
        }
    }
}

/// Retry until a session opens (`Ok(Some)`), shutdown (`Ok(None)`) or the
/// attempt budget is spent (`Err` with the last failure)
async fn reconnect(
    config: &ConnectionConfig,
    backoff: &mut Backoff,
    end: &mut TransportEnd,
    mut last_error: ConnectionError,
) -> Result<Option<Session>, ConnectionError> {
    let mut attempts: u32 = 0;

    loop {
        if !last_error.is_retryable() {
            return Err(last_error);
        }
        if config.max_reconnect_attempts.is_some_and(|max| attempts >= max) {
            return Err(last_error);
        }

        let delay = backoff.next_delay();
        debug!("Reconnecting in {:?}", delay);

        // Wait before reconnecting, but check for shutdown command
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = reject_until_shutdown(&mut end.command_rx) => return Ok(None),
        }

        attempts += 1;
        tokio::select! {
            result = open_session(config) => match result {
                Ok(session) => return Ok(Some(session)),
                Err(e) => {
                    debug!("Reconnect attempt {} failed: {}", attempts, e);
                    last_error = e;
                }
            },
            _ = reject_until_shutdown(&mut end.command_rx) => return Ok(None),
        }
    }
}

/// Fail invocations while the link is down; returns on shutdown
async fn reject_until_shutdown(command_rx: &mut mpsc::Receiver<TransportCommand>) {
    loop {
        match command_rx.recv().await {
            Some(TransportCommand::Invoke { reply, .. }) => {
                let _ = reply.send(Err(SendError::NotConnected));
            }
            Some(TransportCommand::Shutdown) | None => return,
        }
    }
}

/// Negotiate, connect and handshake
async fn open_session(config: &ConnectionConfig) -> Result<Session, ConnectionError> {
    let endpoint = resolve_endpoint(config).await?;
    debug!("Opening WebSocket {}", endpoint.url);

    let (mut stream, _response) = connect_async(endpoint.url.as_str()).await?;
    let leftover = handshake(&mut stream, config.handshake_timeout, &config.url).await?;

    Ok(Session {
        stream,
        connection_id: endpoint.connection_id,
        leftover,
    })
}

/// Work out the WebSocket URL, negotiating if needed
async fn resolve_endpoint(config: &ConnectionConfig) -> Result<Endpoint, ConnectionError> {
    let mut hub = protocol::parse_hub_url(&config.url)?;

    if config.skip_negotiation || matches!(hub.scheme(), "ws" | "wss") {
        return Ok(Endpoint {
            url: protocol::websocket_url(&hub, None, None)?.to_string(),
            connection_id: None,
        });
    }

    let client = reqwest::Client::new();
    let mut access_token: Option<String> = None;

    for _ in 0..=MAX_NEGOTIATE_REDIRECTS {
        let mut response = negotiate(&client, &hub, access_token.as_deref()).await?;

        if let Some(error) = response.error.take() {
            return Err(ConnectionError::NegotiateRejected(error));
        }

        if let Some(redirect) = response.url.take() {
            debug!("Negotiation redirected to {}", redirect);
            hub = protocol::parse_hub_url(&redirect)?;
            access_token = response.access_token.take();
            continue;
        }

        if !response.supports_websockets() {
            return Err(ConnectionError::NoWebSocketTransport(hub.to_string()));
        }

        let url = protocol::websocket_url(&hub, response.websocket_id(), access_token.as_deref())?;
        return Ok(Endpoint {
            url: url.to_string(),
            connection_id: response.connection_id,
        });
    }

    Err(ConnectionError::NegotiateRejected(format!(
        "more than {} negotiate redirects",
        MAX_NEGOTIATE_REDIRECTS
    )))
}

async fn negotiate(
    client: &reqwest::Client,
    hub: &reqwest::Url,
    access_token: Option<&str>,
) -> Result<NegotiateResponse, ConnectionError> {
    let url = protocol::negotiate_url(hub);
    let negotiate_err = |source| ConnectionError::Negotiate {
        url: url.to_string(),
        source,
    };

    let mut request = client.post(url.clone());
    if let Some(token) = access_token {
        request = request.bearer_auth(token);
    }

    let body = request
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(negotiate_err)?
        .text()
        .await
        .map_err(negotiate_err)?;

    serde_json::from_str(&body).map_err(|e| {
        ConnectionError::NegotiateRejected(format!("invalid negotiate response: {}", e))
    })
}

/// Exchange the protocol handshake
///
/// Returns any hub messages that arrived in the same frame as the response.
async fn handshake(
    stream: &mut WsStream,
    timeout: Duration,
    url: &str,
) -> Result<Vec<String>, ConnectionError> {
    stream
        .send(Message::Text(protocol::handshake_request()))
        .await?;

    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let mut frames = protocol::split_frames(&text);
                        let Some(first) = frames.next() else {
                            continue;
                        };

                        let response: HandshakeResponse = serde_json::from_str(first).map_err(|e| {
                            ConnectionError::Handshake(format!("invalid handshake response: {}", e))
                        })?;
                        if let Some(error) = response.error {
                            return Err(ConnectionError::Handshake(error));
                        }

                        return Ok(frames.map(String::from).collect());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(ConnectionError::Closed(frame.map(|f| f.reason.to_string())));
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(ConnectionError::Closed(None)),
                    _ => {}
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(ConnectionError::HandshakeTimeout(url.to_string()));
            }
        }
    }
}

/// Pending invocations waiting for a completion
type Pending = HashMap<String, oneshot::Sender<Result<(), SendError>>>;

/// Run one session until it ends
async fn run_session(config: &ConnectionConfig, session: Session, end: &mut TransportEnd) -> SessionEnd {
    let Session {
        stream, leftover, ..
    } = session;
    let (mut write, mut read) = stream.split();
    let mut pending = Pending::new();
    let mut next_invocation_id: u64 = 0;

    let mut outcome = None;
    for frame in &leftover {
        if let Some(ended) = handle_frame(frame, &mut pending, end).await {
            outcome = Some(ended);
            break;
        }
    }

    let mut keep_alive = tokio::time::interval_at(
        tokio::time::Instant::now() + config.keep_alive_interval,
        config.keep_alive_interval,
    );
    let mut last_received = tokio::time::Instant::now();

    let outcome = match outcome {
        Some(ended) => ended,
        None => loop {
            tokio::select! {
                cmd = end.command_rx.recv() => {
                    match cmd {
                        Some(TransportCommand::Invoke { target, arguments, reply }) => {
                            next_invocation_id += 1;
                            let invocation_id = next_invocation_id.to_string();
                            let message = HubMessage::Invocation {
                                invocation_id: Some(invocation_id.clone()),
                                target,
                                arguments,
                            };

                            let text = match message.encode() {
                                Ok(text) => text,
                                Err(e) => {
                                    let _ = reply.send(Err(SendError::Encode(e.to_string())));
                                    continue;
                                }
                            };

                            if let Err(e) = write.send(Message::Text(text)).await {
                                let _ = reply.send(Err(SendError::ConnectionLost));
                                break SessionEnd::Lost(e.into());
                            }
                            pending.insert(invocation_id, reply);
                        }
                        Some(TransportCommand::Shutdown) | None => {
                            write.close().await.ok();
                            break SessionEnd::Shutdown;
                        }
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_received = tokio::time::Instant::now();
                            let mut ended = None;
                            for frame in protocol::split_frames(&text) {
                                if let Some(e) = handle_frame(frame, &mut pending, end).await {
                                    ended = Some(e);
                                    break;
                                }
                            }
                            if let Some(ended) = ended {
                                write.close().await.ok();
                                break ended;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break SessionEnd::Lost(ConnectionError::Closed(
                                frame.map(|f| f.reason.to_string()),
                            ));
                        }
                        Some(Err(e)) => break SessionEnd::Lost(e.into()),
                        None => break SessionEnd::Lost(ConnectionError::Closed(None)),
                        // Transport-level ping/pong and binary frames
                        _ => last_received = tokio::time::Instant::now(),
                    }
                }

                _ = keep_alive.tick() => {
                    if last_received.elapsed() > config.server_timeout {
                        break SessionEnd::Lost(ConnectionError::Closed(Some(format!(
                            "no message from hub for {:?}",
                            config.server_timeout
                        ))));
                    }

                    let ping = HubMessage::Ping.encode().unwrap_or_default();
                    if let Err(e) = write.send(Message::Text(ping)).await {
                        break SessionEnd::Lost(e.into());
                    }
                }
            }
        },
    };

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(SendError::ConnectionLost));
    }

    outcome
}

/// Act on one hub message; returns how the session ends if it does
async fn handle_frame(frame: &str, pending: &mut Pending, end: &TransportEnd) -> Option<SessionEnd> {
    let message = match HubMessage::decode(frame) {
        Ok(message) => message,
        Err(e) => {
            warn!("Failed to decode hub message: {}", e);
            return None;
        }
    };

    match message {
        HubMessage::Invocation {
            target, arguments, ..
        } => {
            debug!("Hub invoked {}", target);
            match ServerEvent::decode(&target, arguments) {
                Ok(Some(event)) => end.emit(TransportEvent::Inbound(event)).await,
                Ok(None) => debug!("Ignoring unknown hub target '{}'", target),
                Err(e) => {
                    warn!("Malformed {} payload: {}", target, e);
                    end.emit(TransportEvent::Malformed(e)).await;
                }
            }
        }
        HubMessage::Completion {
            invocation_id,
            error,
            ..
        } => match pending.remove(&invocation_id) {
            Some(reply) => {
                let _ = reply.send(match error {
                    Some(error) => Err(SendError::Rejected(error)),
                    None => Ok(()),
                });
            }
            None => debug!("Completion for unknown invocation {}", invocation_id),
        },
        HubMessage::Ping => {}
        HubMessage::Close {
            error,
            allow_reconnect,
        } => {
            return Some(if allow_reconnect {
                SessionEnd::Lost(ConnectionError::Closed(error))
            } else {
                SessionEnd::Refused(error)
            });
        }
        HubMessage::Other(kind) => debug!("Ignoring hub message type {}", kind),
    }

    None
}
