//! Rendering surface contract
//!
//! The surface draws and removes markers and owns no sync state.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::error::RenderError;
use crate::models::{LatLng, MarkerStyle, Point};

/// Opaque id of a marker drawn on a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MarkerHandle(pub u64);

impl fmt::Display for MarkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What to draw for one point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    pub id: String,
    pub position: LatLng,
    pub style: MarkerStyle,
}

impl Marker {
    pub fn from_point(point: &Point) -> Self {
        Self {
            id: point.id.clone(),
            position: point.position,
            style: point.style(),
        }
    }
}

/// Something that can draw markers
pub trait RenderSurface: Send {
    fn add_marker(&mut self, marker: &Marker) -> Result<MarkerHandle, RenderError>;

    fn update_marker(&mut self, handle: MarkerHandle, marker: &Marker) -> Result<(), RenderError>;

    fn remove_marker(&mut self, handle: MarkerHandle) -> Result<(), RenderError>;
}

/// A call made against a `MemorySurface`
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceCall {
    Add(Marker),
    Update(MarkerHandle, Marker),
    Remove(MarkerHandle),
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_handle: u64,
    markers: BTreeMap<MarkerHandle, Marker>,
    calls: Vec<SurfaceCall>,
    rejected_ids: HashSet<String>,
    fail_removals: bool,
}

/// In-memory surface
///
/// Keeps the drawn markers in a table and records every call. Clones share
/// the same table, so a caller can hand one clone to a reconciler and
/// inspect the other.
#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reject add/update calls for markers with this id
    pub fn reject_id(&self, id: impl Into<String>) {
        self.lock().rejected_ids.insert(id.into());
    }

    /// Make every remove call fail (or succeed again)
    pub fn fail_removals(&self, fail: bool) {
        self.lock().fail_removals = fail;
    }

    /// Markers currently drawn, in handle order
    pub fn markers(&self) -> Vec<Marker> {
        self.lock().markers.values().cloned().collect()
    }

    pub fn marker_count(&self) -> usize {
        self.lock().markers.len()
    }

    /// All calls made so far
    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.lock().calls.clone()
    }

    /// Drain the recorded calls
    pub fn take_calls(&self) -> Vec<SurfaceCall> {
        std::mem::take(&mut self.lock().calls)
    }
}

impl RenderSurface for MemorySurface {
    fn add_marker(&mut self, marker: &Marker) -> Result<MarkerHandle, RenderError> {
        let mut inner = self.lock();
        inner.calls.push(SurfaceCall::Add(marker.clone()));

        if inner.rejected_ids.contains(&marker.id) {
            return Err(RenderError::Rejected {
                id: marker.id.clone(),
                reason: "rejected by surface".to_string(),
            });
        }

        inner.next_handle += 1;
        let handle = MarkerHandle(inner.next_handle);
        inner.markers.insert(handle, marker.clone());
        Ok(handle)
    }

    fn update_marker(&mut self, handle: MarkerHandle, marker: &Marker) -> Result<(), RenderError> {
        let mut inner = self.lock();
        inner.calls.push(SurfaceCall::Update(handle, marker.clone()));

        if inner.rejected_ids.contains(&marker.id) {
            return Err(RenderError::Rejected {
                id: marker.id.clone(),
                reason: "rejected by surface".to_string(),
            });
        }

        match inner.markers.get_mut(&handle) {
            Some(existing) => {
                *existing = marker.clone();
                Ok(())
            }
            None => Err(RenderError::UnknownHandle(handle.0)),
        }
    }

    fn remove_marker(&mut self, handle: MarkerHandle) -> Result<(), RenderError> {
        let mut inner = self.lock();
        inner.calls.push(SurfaceCall::Remove(handle));

        if inner.fail_removals {
            return Err(RenderError::Rejected {
                id: handle.to_string(),
                reason: "removal failed".to_string(),
            });
        }

        inner
            .markers
            .remove(&handle)
            .map(|_| ())
            .ok_or(RenderError::UnknownHandle(handle.0))
    }
}
