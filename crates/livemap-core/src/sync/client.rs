//! Sync client
//!
//! Owns the point store, the event dispatcher and the reconciliation loop,
//! and wires them to a hub transport. Inbound hub events are applied in
//! arrival order by a pump task; the reconciliation loop renders whatever
//! the store holds at each tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{
    HubConnection, LinkStatus, TransportCommand, TransportEvent, TransportHandle,
};
use super::protocol::{targets, ServerEvent};
use crate::config::Config;
use crate::dispatcher::{ConnectionState, ErrorInfo, EventDispatcher, EventKind, SyncEvent, Subscription};
use crate::error::{ConnectionError, SendError};
use crate::models::Point;
use crate::render::{ReconciliationLoop, Reconciler, RenderSurface, TickReport};
use crate::stats::{StatsSnapshot, SyncStats};
use crate::store::{PointStore, Snapshot};

/// How long `disconnect` waits for the transport to wind down
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn lock(store: &Mutex<PointStore>) -> MutexGuard<'_, PointStore> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A live transport plus the task pumping its events
struct Link {
    command_tx: mpsc::Sender<TransportCommand>,
    status_rx: watch::Receiver<LinkStatus>,
    connection_id: Option<String>,
    /// Set on disconnect; the pump drops inbound events once it is set
    closing: Arc<AtomicBool>,
    pump: JoinHandle<Option<ConnectionState>>,
}

/// Real-time point sync client
pub struct SyncClient {
    config: Config,
    client_id: String,
    store: Arc<Mutex<PointStore>>,
    dispatcher: EventDispatcher,
    stats: Arc<SyncStats>,
    refresh: Option<ReconciliationLoop>,
    link: Option<Link>,
}

impl SyncClient {
    pub fn new(config: Config) -> Self {
        let client_id = format!("livemap-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

        Self {
            config,
            client_id,
            store: Arc::new(Mutex::new(PointStore::new())),
            dispatcher: EventDispatcher::new(),
            stats: Arc::new(SyncStats::new()),
            refresh: None,
            link: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Identifier used for this client in logs
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connect to the configured hub
    ///
    /// The outcome is also published as a `connection-state` event.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.link.is_some() {
            self.disconnect().await;
        }

        info!("Client {} connecting to {}", self.client_id, self.config.hub_url);

        match HubConnection::connect(self.config.connection_config()).await {
            Ok(handle) => {
                self.attach(handle).await;
                Ok(())
            }
            Err(e) => {
                self.dispatcher
                    .publish(&SyncEvent::ConnectionState(ConnectionState::closed(Some(
                        ErrorInfo::new(e.to_string()),
                    ))));
                Err(e)
            }
        }
    }

    /// Start consuming events from an already established transport
    ///
    /// A previous transport is disconnected first, so its final state is
    /// published before anything from the new one. `connected` is published
    /// here when the new transport is already up.
    pub async fn attach(&mut self, handle: TransportHandle) {
        self.disconnect().await;

        if *handle.status_rx.borrow() == LinkStatus::Connected {
            // Transport events stay queued until the pump starts
            self.dispatcher
                .publish(&SyncEvent::ConnectionState(ConnectionState::connected(
                    handle.connection_id.clone(),
                )));
        }

        let TransportHandle {
            command_tx,
            event_rx,
            status_rx,
            connection_id,
        } = handle;

        let closing = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(pump_events(
            event_rx,
            Arc::clone(&closing),
            Arc::clone(&self.store),
            self.dispatcher.clone(),
            Arc::clone(&self.stats),
        ));

        self.link = Some(Link {
            command_tx,
            status_rx,
            connection_id,
            closing,
            pump,
        });
    }

    /// Close the transport
    ///
    /// No inbound event is applied after this is called. Safe to call when
    /// not connected or more than once.
    pub async fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };

        link.closing.store(true, Ordering::Release);
        let _ = link.command_tx.send(TransportCommand::Shutdown).await;
        drop(link.command_tx);

        let mut pump = link.pump;
        let last_state = match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut pump).await {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                warn!("Event pump failed: {}", e);
                None
            }
            Err(_) => {
                warn!("Transport did not shut down within {:?}", DISCONNECT_TIMEOUT);
                pump.abort();
                None
            }
        };

        let closed = ConnectionState::closed(None);
        let already_closed = last_state.is_some_and(|s| !s.connected && !s.reconnecting);
        if !already_closed {
            self.dispatcher.publish(&SyncEvent::ConnectionState(closed));
        }

        info!("Client {} disconnected", self.client_id);
    }

    /// Broadcast free text through the hub
    pub async fn send_message(&self, text: &str) -> Result<(), SendError> {
        self.invoke(targets::SEND_MESSAGE, vec![Value::String(text.to_string())])
            .await
    }

    /// Publish a point change through the hub
    pub async fn send_state_change(&self, point: &Point) -> Result<(), SendError> {
        let payload = serde_json::to_value(point.to_payload())
            .map_err(|e| SendError::Encode(e.to_string()))?;
        self.invoke(targets::SEND_STATE_CHANGE, vec![payload]).await
    }

    async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<(), SendError> {
        let link = self.link.as_ref().ok_or(SendError::NotConnected)?;
        if *link.status_rx.borrow() != LinkStatus::Connected {
            return Err(SendError::NotConnected);
        }

        let (reply, reply_rx) = oneshot::channel();
        link.command_tx
            .send(TransportCommand::Invoke {
                target: target.to_string(),
                arguments,
                reply,
            })
            .await
            .map_err(|_| SendError::NotConnected)?;

        debug!("Invoked {}", target);
        reply_rx.await.map_err(|_| SendError::ConnectionLost)?
    }

    /// Start rendering the store onto `surface` every `interval`
    ///
    /// Replaces a running loop; markers drawn by the old loop are removed.
    pub fn start_refresh(&mut self, surface: Box<dyn RenderSurface>, interval: Duration) {
        if let Some(mut old) = self.refresh.take() {
            old.stop();
            old.clear();
        }

        let mut refresh = ReconciliationLoop::new(
            Arc::clone(&self.store),
            Reconciler::new(surface, self.config.render_strategy),
            self.dispatcher.clone(),
            Arc::clone(&self.stats),
            self.config.point_ttl(),
        );
        refresh.start(interval);
        self.refresh = Some(refresh);
    }

    /// Stop the reconciliation timer, leaving drawn markers in place
    pub fn stop_refresh(&mut self) {
        if let Some(refresh) = self.refresh.as_mut() {
            refresh.stop();
        }
    }

    /// Reconcile immediately; `None` if rendering was never started
    pub fn tick_now(&self) -> Option<TickReport> {
        self.refresh.as_ref().map(|r| r.tick_now())
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh.as_ref().is_some_and(|r| r.is_running())
    }

    /// Stop rendering, remove drawn markers and disconnect
    pub async fn close(&mut self) {
        if let Some(mut refresh) = self.refresh.take() {
            refresh.stop();
            refresh.clear();
        }
        self.disconnect().await;
    }

    /// Register a listener for one event kind
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.on(kind, callback)
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Current points
    pub fn points(&self) -> Snapshot {
        lock(&self.store).snapshot()
    }

    pub fn point_count(&self) -> usize {
        lock(&self.store).len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn status(&self) -> LinkStatus {
        self.link
            .as_ref()
            .map(|l| *l.status_rx.borrow())
            .unwrap_or(LinkStatus::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.status() == LinkStatus::Connected
    }

    /// Id the hub assigned on negotiation
    pub fn connection_id(&self) -> Option<&str> {
        self.link.as_ref().and_then(|l| l.connection_id.as_deref())
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.closing.store(true, Ordering::Release);
            let _ = link.command_tx.try_send(TransportCommand::Shutdown);
        }
    }
}

/// Apply transport events until the transport goes away
///
/// Returns the last connection state it forwarded.
async fn pump_events(
    mut event_rx: mpsc::Receiver<TransportEvent>,
    closing: Arc<AtomicBool>,
    store: Arc<Mutex<PointStore>>,
    dispatcher: EventDispatcher,
    stats: Arc<SyncStats>,
) -> Option<ConnectionState> {
    let mut last_state = None;

    while let Some(event) = event_rx.recv().await {
        match event {
            TransportEvent::StateChanged(state) => {
                dispatcher.publish(&SyncEvent::ConnectionState(state.clone()));
                last_state = Some(state);
            }
            _ if closing.load(Ordering::Acquire) => {
                debug!("Dropping inbound event received after disconnect");
            }
            TransportEvent::Inbound(event) => {
                stats.record_inbound();
                apply_server_event(event, &store, &dispatcher, &stats);
            }
            TransportEvent::Malformed(e) => {
                warn!("Dropping malformed hub event: {}", e);
                stats.record_malformed(1);
            }
        }
    }

    debug!("Event pump stopped");
    last_state
}

/// Apply one hub event to the store and publish the matching sync event
fn apply_server_event(
    event: ServerEvent,
    store: &Mutex<PointStore>,
    dispatcher: &EventDispatcher,
    stats: &SyncStats,
) {
    match event {
        ServerEvent::ReceiveMessage(text) => {
            dispatcher.publish(&SyncEvent::Message(text));
        }
        ServerEvent::SendStateChange(payload) => match payload.validate() {
            Ok(point) => {
                lock(store).upsert(point.clone());
                dispatcher.publish(&SyncEvent::StateChange(point));
            }
            Err(e) => {
                warn!("Dropping malformed state change: {}", e);
                stats.record_malformed(1);
            }
        },
        ServerEvent::InitializeState(entries) => {
            let total = entries.len();
            let points: Vec<Point> = entries
                .into_iter()
                .filter_map(|entry| match entry.and_then(|p| p.validate()) {
                    Ok(point) => Some(point),
                    Err(e) => {
                        warn!("Dropping malformed point in initial state: {}", e);
                        None
                    }
                })
                .collect();

            let dropped = total - points.len();
            if dropped > 0 {
                stats.record_malformed(dropped as u64);
            }

            lock(store).upsert_many(points.iter().cloned());
            info!("Initial state: {} points ({} dropped)", points.len(), dropped);
            dispatcher.publish(&SyncEvent::Initialize(points));
        }
        ServerEvent::RemovePoint(id) => {
            let removed = lock(store).remove(&id);
            if removed.is_some() {
                dispatcher.publish(&SyncEvent::Removed(id));
            } else {
                debug!("Remove for unknown point '{}'", id);
            }
        }
    }
}
