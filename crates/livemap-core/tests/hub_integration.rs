//! End-to-end tests against an in-process hub.
//!
//! The hub speaks the JSON hub protocol over a real WebSocket and answers
//! negotiate requests over plain HTTP on the same port, so these tests cover
//! negotiation, handshake, initial state, invocations with completions,
//! reconnects, liveness and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use livemap_core::{
    Category, Config, ConnectionError, ConnectionState, EventKind, LinkStatus, MemorySurface,
    Point, SendError, SyncClient, SyncEvent,
};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, Copy, PartialEq)]
enum HubMode {
    Normal,
    /// Drop the first connection right after sending the initial state
    DropFirst,
    /// Answer the handshake with an error
    RejectHandshake,
    /// Drop the first connection, then hang up on every later one before the upgrade
    RefuseReconnect,
    /// Drop the first connection, then never answer later handshakes
    StallReconnect,
    /// Send a Close message forbidding reconnects right after the initial state
    CloseNoReconnect,
    /// Complete the handshake, then never send anything
    Silent,
}

type Log = Arc<Mutex<Vec<String>>>;

struct TestHub {
    port: u16,
    invocations: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    connections: Arc<AtomicUsize>,
    /// Negotiate request lines and WebSocket upgrade paths, in arrival order
    requests: Log,
}

impl TestHub {
    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/viewport", self.port)
    }

    fn http_url(&self) -> String {
        format!("http://127.0.0.1:{}/viewport", self.port)
    }

    fn invocations(&self) -> Vec<(String, Vec<Value>)> {
        self.invocations.lock().unwrap().clone()
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn frame(value: Value) -> Message {
    Message::Text(format!("{}\u{1e}", value))
}

/// Start a hub on a free port
async fn start_hub(mode: HubMode, initial: Value) -> TestHub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let invocations = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));
    let requests: Log = Arc::new(Mutex::new(Vec::new()));

    let hub = TestHub {
        port,
        invocations: Arc::clone(&invocations),
        connections: Arc::clone(&connections),
        requests: Arc::clone(&requests),
    };

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if is_negotiate(&stream).await {
                let body = json!({
                    "negotiateVersion": 1,
                    "connectionId": "conn-1",
                    "connectionToken": "tok-1",
                    "availableTransports": [
                        {"transport": "WebSockets", "transferFormats": ["Text", "Binary"]},
                    ],
                });
                tokio::spawn(answer_negotiate(stream, body, Arc::clone(&requests)));
                continue;
            }

            let n = connections.fetch_add(1, Ordering::SeqCst);
            if mode == HubMode::RefuseReconnect && n > 0 {
                drop(stream);
                continue;
            }

            tokio::spawn(serve(
                stream,
                mode,
                n,
                initial.clone(),
                Arc::clone(&invocations),
                Arc::clone(&requests),
            ));
        }
    });

    hub
}

/// Start an endpoint whose negotiate always redirects to `target`
async fn start_redirector(target: String, access_token: &str) -> (String, Log) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let requests: Log = Arc::new(Mutex::new(Vec::new()));
    let body = json!({"url": target, "accessToken": access_token});

    let log = Arc::clone(&requests);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(answer_negotiate(stream, body.clone(), Arc::clone(&log)));
        }
    });

    (format!("http://127.0.0.1:{}/viewport", port), requests)
}

/// Negotiate is a POST; WebSocket upgrades are GETs
async fn is_negotiate(stream: &TcpStream) -> bool {
    let mut head = [0u8; 4];
    let peeked = stream.peek(&mut head).await;
    matches!(peeked, Ok(4)) && &head == b"POST"
}

/// Read one HTTP request, log its request line and bearer token, reply with `body`
async fn answer_negotiate(mut stream: TcpStream, body: Value, requests: Log) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let request_line = head.lines().next().unwrap_or_default().to_string();
    let auth = head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("authorization")
            .then(|| value.trim().to_string())
    });
    requests.lock().unwrap().push(match auth {
        Some(auth) => format!("{} [{}]", request_line, auth),
        None => request_line,
    });

    let body = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    stream.shutdown().await.ok();
}

async fn serve(
    stream: TcpStream,
    mode: HubMode,
    n: usize,
    initial: Value,
    invocations: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    requests: Log,
) {
    let record_path = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        requests.lock().unwrap().push(format!("GET {}", request.uri()));
        Ok(response)
    };
    let Ok(mut ws) = accept_hdr_async(stream, record_path).await else {
        return;
    };

    let Some(Ok(Message::Text(handshake))) = ws.next().await else {
        return;
    };
    assert!(handshake.contains("\"protocol\":\"json\""));

    if mode == HubMode::RejectHandshake {
        ws.send(frame(json!({"error": "Requested protocol 'json' is not available."})))
            .await
            .unwrap();
        return;
    }

    if mode == HubMode::StallReconnect && n > 0 {
        while let Some(Ok(_)) = ws.next().await {}
        return;
    }

    ws.send(frame(json!({}))).await.unwrap();

    if mode == HubMode::Silent {
        while let Some(Ok(_)) = ws.next().await {}
        return;
    }

    ws.send(frame(json!({
        "type": 1,
        "target": "InitializeState",
        "arguments": [initial],
    })))
    .await
    .unwrap();

    let drops_first = matches!(
        mode,
        HubMode::DropFirst | HubMode::RefuseReconnect | HubMode::StallReconnect
    );
    if drops_first && n == 0 {
        return;
    }

    if mode == HubMode::CloseNoReconnect {
        ws.send(frame(json!({
            "type": 7,
            "error": "hub shutting down",
            "allowReconnect": false,
        })))
        .await
        .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
        return;
    }

    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else {
            continue;
        };

        for raw in text.split('\u{1e}').filter(|s| !s.is_empty()) {
            let message: Value = serde_json::from_str(raw).unwrap();
            if message["type"] != 1 {
                continue;
            }

            let target = message["target"].as_str().unwrap_or_default().to_string();
            let arguments = message["arguments"].as_array().cloned().unwrap_or_default();
            invocations
                .lock()
                .unwrap()
                .push((target.clone(), arguments.clone()));

            // Broadcast state changes back, as the real hub does
            if target == "SendStateChange" {
                ws.send(frame(json!({
                    "type": 1,
                    "target": "SendStateChange",
                    "arguments": arguments,
                })))
                .await
                .unwrap();
            }

            if let Some(id) = message.get("invocationId") {
                ws.send(frame(json!({"type": 3, "invocationId": id})))
                    .await
                    .unwrap();
            }
        }
    }
}

fn test_config(url: String) -> Config {
    Config {
        hub_url: url,
        initial_reconnect_delay_ms: 50,
        max_reconnect_delay_ms: 200,
        ..Default::default()
    }
}

fn record(client: &SyncClient, kind: EventKind) -> UnboundedReceiver<SyncEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    // Subscriptions are never unsubscribed in these tests
    let _sub = client.on(kind, move |event| {
        tx.send(event.clone())?;
        Ok(())
    });
    rx
}

async fn next(rx: &mut UnboundedReceiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip connection states until one matches
async fn wait_for_state(
    rx: &mut UnboundedReceiver<SyncEvent>,
    matches: impl Fn(&ConnectionState) -> bool,
) -> ConnectionState {
    loop {
        let SyncEvent::ConnectionState(state) = next(rx).await else {
            panic!("expected connection-state event");
        };
        if matches(&state) {
            return state;
        }
    }
}

fn initial_points() -> Value {
    json!([
        {"imei": "dev-3", "lat": 48.85, "lng": 2.35, "c": "R"},
        {"imei": "dev-1", "lat": 51.5, "lng": -0.12, "c": "G"},
        {"imei": "dev-2", "lat": 40.71, "lng": -74.0, "c": "R"},
    ])
}

#[tokio::test]
async fn test_full_session() {
    let hub = start_hub(HubMode::Normal, initial_points()).await;
    let mut client = SyncClient::new(test_config(hub.url()));
    let mut init_rx = record(&client, EventKind::Initialize);
    let mut state_rx = record(&client, EventKind::ConnectionState);

    client.connect().await.unwrap();
    assert!(client.is_connected());

    let SyncEvent::ConnectionState(state) = next(&mut state_rx).await else {
        panic!("expected connection-state event");
    };
    assert!(state.connected);

    let SyncEvent::Initialize(points) = next(&mut init_rx).await else {
        panic!("expected initialize event");
    };
    let ids: Vec<&str> = points.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["dev-3", "dev-1", "dev-2"]);
    assert_eq!(client.point_count(), 3);

    let surface = MemorySurface::new();
    client.start_refresh(Box::new(surface.clone()), Duration::from_secs(60));
    let report = client.tick_now().unwrap();
    assert_eq!(report.added, 3);
    assert_eq!(surface.marker_count(), 3);

    client.send_message("hello hub").await.unwrap();
    assert_eq!(
        hub.invocations(),
        vec![("SendMessage".to_string(), vec![json!("hello hub")])]
    );

    client.close().await;
    assert_eq!(client.status(), LinkStatus::Disconnected);
    assert_eq!(surface.marker_count(), 0);

    let SyncEvent::ConnectionState(last) = next(&mut state_rx).await else {
        panic!("expected connection-state event");
    };
    assert!(!last.connected);
    assert!(last.error.is_none());
}

#[tokio::test]
async fn test_state_change_round_trip() {
    let hub = start_hub(HubMode::Normal, json!([])).await;
    let mut client = SyncClient::new(test_config(hub.url()));
    let mut change_rx = record(&client, EventKind::StateChange);

    client.connect().await.unwrap();

    let point = Point::new("dev-7", -33.86, 151.21, Category::Green);
    client.send_state_change(&point).await.unwrap();

    // Hub broadcasts the change back to every client
    assert_eq!(next(&mut change_rx).await, SyncEvent::StateChange(point.clone()));
    assert_eq!(client.points().get("dev-7"), Some(&point));

    let invocations = hub.invocations();
    assert_eq!(invocations[0].0, "SendStateChange");
    assert_eq!(
        invocations[0].1,
        vec![json!({"imei": "dev-7", "lat": -33.86, "lng": 151.21, "c": "G"})]
    );

    client.disconnect().await;
    assert_eq!(
        client.send_message("too late").await,
        Err(livemap_core::SendError::NotConnected)
    );
}

#[tokio::test]
async fn test_reconnects_after_drop() {
    let hub = start_hub(HubMode::DropFirst, initial_points()).await;
    let mut client = SyncClient::new(test_config(hub.url()));
    let mut init_rx = record(&client, EventKind::Initialize);
    let mut state_rx = record(&client, EventKind::ConnectionState);

    client.connect().await.unwrap();

    // Initial state arrives once per connection
    next(&mut init_rx).await;
    next(&mut init_rx).await;
    assert_eq!(hub.connections.load(Ordering::SeqCst), 2);

    let mut saw_reconnecting = false;
    loop {
        let SyncEvent::ConnectionState(state) = next(&mut state_rx).await else {
            panic!("expected connection-state event");
        };
        if state.reconnecting {
            saw_reconnecting = true;
        } else if saw_reconnecting && state.connected {
            break;
        }
    }

    assert!(client.is_connected());
    assert_eq!(client.point_count(), 3);

    client.disconnect().await;
}

#[tokio::test]
async fn test_handshake_rejected() {
    let hub = start_hub(HubMode::RejectHandshake, json!([])).await;
    let mut client = SyncClient::new(test_config(hub.url()));
    let mut state_rx = record(&client, EventKind::ConnectionState);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ConnectionError::Handshake(_)));

    let SyncEvent::ConnectionState(state) = next(&mut state_rx).await else {
        panic!("expected connection-state event");
    };
    assert!(!state.connected);
    assert!(state.error.is_some());
}

#[tokio::test]
async fn test_connect_to_closed_port() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut client = SyncClient::new(test_config(format!("ws://127.0.0.1:{}/viewport", port)));
    assert!(client.connect().await.is_err());
    assert_eq!(client.status(), LinkStatus::Disconnected);
}

#[tokio::test]
async fn test_negotiate_follows_redirect() {
    let hub = start_hub(HubMode::Normal, initial_points()).await;
    let (redirector_url, redirector_requests) = start_redirector(hub.http_url(), "secret").await;

    let mut client = SyncClient::new(test_config(redirector_url));
    let mut init_rx = record(&client, EventKind::Initialize);

    client.connect().await.unwrap();
    assert_eq!(client.connection_id(), Some("conn-1"));
    next(&mut init_rx).await;

    let redirected = redirector_requests.lock().unwrap().clone();
    assert_eq!(redirected.len(), 1);
    assert!(redirected[0].starts_with("POST /viewport/negotiate?negotiateVersion=1 "));

    // The redirect's access token goes to the new negotiate and the WebSocket
    let requests = hub.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].starts_with("POST /viewport/negotiate?negotiateVersion=1 "));
    assert!(requests[0].ends_with("[Bearer secret]"));
    assert_eq!(requests[1], "GET /viewport?id=tok-1&access_token=secret");

    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_during_backoff() {
    let hub = start_hub(HubMode::DropFirst, initial_points()).await;
    let config = Config {
        initial_reconnect_delay_ms: 10_000,
        max_reconnect_delay_ms: 10_000,
        ..test_config(hub.url())
    };
    let mut client = SyncClient::new(config);
    let mut state_rx = record(&client, EventKind::ConnectionState);

    client.connect().await.unwrap();
    wait_for_state(&mut state_rx, |s| s.reconnecting).await;
    assert_eq!(client.status(), LinkStatus::Reconnecting);

    let started = Instant::now();
    client.disconnect().await;
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(
        next(&mut state_rx).await,
        SyncEvent::ConnectionState(ConnectionState::closed(None))
    );
    assert!(state_rx.try_recv().is_err());
    assert_eq!(client.status(), LinkStatus::Disconnected);
    assert_eq!(hub.connections(), 1);
}

#[tokio::test]
async fn test_disconnect_during_reconnect_attempt() {
    let hub = start_hub(HubMode::StallReconnect, initial_points()).await;
    let mut client = SyncClient::new(test_config(hub.url()));
    let mut state_rx = record(&client, EventKind::ConnectionState);

    client.connect().await.unwrap();
    wait_for_state(&mut state_rx, |s| s.reconnecting).await;

    // Second connection is open and waiting on a handshake that never comes
    timeout(Duration::from_secs(3), async {
        while hub.connections() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no reconnect attempt");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    client.disconnect().await;
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(
        next(&mut state_rx).await,
        SyncEvent::ConnectionState(ConnectionState::closed(None))
    );
    assert_eq!(client.status(), LinkStatus::Disconnected);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let hub = start_hub(HubMode::RefuseReconnect, initial_points()).await;
    let config = Config {
        max_reconnect_attempts: Some(2),
        ..test_config(hub.url())
    };
    let mut client = SyncClient::new(config);
    let mut state_rx = record(&client, EventKind::ConnectionState);

    client.connect().await.unwrap();
    wait_for_state(&mut state_rx, |s| s.reconnecting).await;

    let last = wait_for_state(&mut state_rx, |s| !s.reconnecting).await;
    assert!(!last.connected);
    assert!(last.error.is_some());
    assert_eq!(client.status(), LinkStatus::Disconnected);

    // First connection plus two refused attempts
    assert_eq!(hub.connections(), 3);
    assert_eq!(
        client.send_message("anyone?").await,
        Err(SendError::NotConnected)
    );

    // Transport already reported closed
    client.disconnect().await;
    assert!(state_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_hub_close_without_reconnect() {
    let hub = start_hub(HubMode::CloseNoReconnect, initial_points()).await;
    let mut client = SyncClient::new(test_config(hub.url()));
    let mut state_rx = record(&client, EventKind::ConnectionState);

    client.connect().await.unwrap();
    assert_eq!(
        next(&mut state_rx).await,
        SyncEvent::ConnectionState(ConnectionState::connected(None))
    );

    let SyncEvent::ConnectionState(closed) = next(&mut state_rx).await else {
        panic!("expected connection-state event");
    };
    assert!(!closed.connected);
    assert!(!closed.reconnecting);
    assert_eq!(closed.error.map(|e| e.message).as_deref(), Some("hub shutting down"));
    assert_eq!(client.status(), LinkStatus::Disconnected);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hub.connections(), 1);
    assert!(state_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_silent_hub_times_out() {
    let hub = start_hub(HubMode::Silent, json!([])).await;
    let config = Config {
        keep_alive_interval_secs: 1,
        server_timeout_secs: 1,
        ..test_config(hub.url())
    };
    let mut client = SyncClient::new(config);
    let mut state_rx = record(&client, EventKind::ConnectionState);

    client.connect().await.unwrap();

    // No completion ever arrives; the invocation fails when the link is declared lost
    let sent = timeout(Duration::from_secs(5), client.send_message("anyone there?"))
        .await
        .expect("invocation never completed");
    assert_eq!(sent, Err(SendError::ConnectionLost));

    let lost = wait_for_state(&mut state_rx, |s| s.reconnecting).await;
    let error = lost.error.expect("reconnecting without an error");
    assert!(error.message.contains("no message from hub"));

    client.disconnect().await;
    assert_eq!(client.status(), LinkStatus::Disconnected);
}
