//! livemap core library
//!
//! Real-time point synchronization for map viewers: keeps a set of
//! geographic points in sync with a hub over WebSocket and periodically
//! reconciles it against a rendering surface.
//!
//! # Architecture
//!
//! - **Point Store**: id -> point mapping, the single source of truth
//! - **Event Dispatcher**: typed publish/subscribe for observers
//! - **Reconciliation Loop**: renders store snapshots at a fixed cadence
//! - **Hub connection**: negotiate, handshake, reconnect with backoff
//!
//! Inbound hub events mutate the store; rendering never blocks on the
//! network and the network never waits on rendering.
//!
//! # Quick Start
//!
//! ```text
//! let mut client = SyncClient::new(Config::load()?);
//! client.connect().await?;
//! client.start_refresh(Box::new(MemorySurface::new()), client.config().refresh_interval());
//!
//! client.send_state_change(&Point::new("dev-1", 51.5, -0.1, Category::Red)).await?;
//! ```
//!
//! # Modules
//!
//! - `sync`: Hub connection and the `SyncClient` (main entry point)
//! - `store`: Point store with copy-on-write snapshots
//! - `dispatcher`: Event kinds, payloads and subscriptions
//! - `render`: Surface trait and reconciliation loop
//! - `models`: Points, categories and marker styles
//! - `config`: Application configuration

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod render;
pub mod stats;
pub mod store;
pub mod sync;

pub use config::Config;
pub use dispatcher::{ConnectionState, EventDispatcher, EventKind, Subscription, SyncEvent};
pub use error::{ConnectionError, MalformedPayload, RenderError, SendError};
pub use models::{Category, LatLng, MarkerStyle, Point, PointPayload};
pub use render::{Marker, MarkerHandle, MemorySurface, RenderStrategy, RenderSurface, TickReport};
pub use stats::StatsSnapshot;
pub use store::{PointStore, Snapshot};
pub use sync::{LinkStatus, SyncClient};
