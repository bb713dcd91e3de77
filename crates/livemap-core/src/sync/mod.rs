//! Hub synchronization
//!
//! Keeps the point store in step with a SignalR-style hub over a persistent
//! WebSocket connection.
//!
//! ## Protocol
//!
//! Uses the JSON hub protocol:
//! 1. Negotiate a connection token over HTTP (optional)
//! 2. Open the WebSocket and exchange the handshake
//! 3. Receive `InitializeState`, `SendStateChange`, `ReceiveMessage` and
//!    `RemovePoint` invocations
//! 4. Invoke `SendMessage` / `SendStateChange` and await their completions
//!
//! ## Usage
//!
//! ```ignore
//! let mut client = SyncClient::new(Config::load()?);
//! client.on(EventKind::StateChange, |event| { println!("{:?}", event); Ok(()) });
//! client.connect().await?;
//! client.start_refresh(Box::new(MemorySurface::new()), Duration::from_secs(2));
//! ```

mod client;
mod connection;
pub mod protocol;

pub use client::SyncClient;
pub use connection::{
    transport_pair, ConnectionConfig, HubConnection, LinkStatus, TransportCommand, TransportEnd,
    TransportEvent, TransportHandle,
};
pub use protocol::ServerEvent;
