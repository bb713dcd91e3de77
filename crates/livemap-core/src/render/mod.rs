//! Marker reconciliation
//!
//! Bridges the point store to a rendering surface on a fixed cadence,
//! independent of how fast updates arrive.
//!
//! ## Strategies
//!
//! - **Full rebuild**: every tick removes all markers this reconciler drew
//!   and draws one marker per point. Simple, O(N) churn per tick.
//! - **Incremental**: every tick diffs the previous rendered set against the
//!   snapshot and only adds, updates or removes what changed.
//!
//! The reconciler only ever removes handles it created itself; it never asks
//! the surface what else is drawn.

mod reconciler;
mod refresh;
mod surface;

pub use reconciler::{Reconciler, RenderStrategy, TickReport};
pub use refresh::ReconciliationLoop;
pub use surface::{Marker, MarkerHandle, MemorySurface, RenderSurface, SurfaceCall};
