//! Point store
//!
//! In-memory mapping from point id to the latest known `Point`. The store is
//! the single source of truth for "currently known points"; everything else
//! works from snapshots.
//!
//! Snapshots share the underlying map (`Arc`) and the store copies it only
//! when it is mutated while a snapshot is still alive, so taking a snapshot
//! per reconciliation tick is cheap.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::Point;

/// Immutable view of the store at one instant
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    points: Arc<BTreeMap<String, Point>>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Point> {
        self.points.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.points.contains_key(id)
    }

    /// Points in id order
    pub fn iter(&self) -> impl Iterator<Item = &Point> {
        self.points.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.points.keys().map(String::as_str)
    }
}

/// Mapping from point id to its latest state
#[derive(Debug, Default)]
pub struct PointStore {
    points: Arc<BTreeMap<String, Point>>,
    /// When each id was last written, for TTL eviction
    last_seen: HashMap<String, Instant>,
}

impl PointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `point.id`
    ///
    /// Returns true if the id was not tracked before.
    pub fn upsert(&mut self, point: Point) -> bool {
        self.upsert_at(point, Instant::now())
    }

    /// Insert or replace, recording `seen_at` as the last-seen instant
    pub fn upsert_at(&mut self, point: Point, seen_at: Instant) -> bool {
        self.last_seen.insert(point.id.clone(), seen_at);
        Arc::make_mut(&mut self.points)
            .insert(point.id.clone(), point)
            .is_none()
    }

    /// Apply `upsert` to each point in order; returns how many ids were new
    pub fn upsert_many<I>(&mut self, points: I) -> usize
    where
        I: IntoIterator<Item = Point>,
    {
        let now = Instant::now();
        let mut new_ids = 0;
        for point in points {
            if self.upsert_at(point, now) {
                new_ids += 1;
            }
        }
        new_ids
    }

    /// Remove a point
    pub fn remove(&mut self, id: &str) -> Option<Point> {
        if !self.points.contains_key(id) {
            return None;
        }
        self.last_seen.remove(id);
        Arc::make_mut(&mut self.points).remove(id)
    }

    /// Remove every point not written within `ttl` of `now`
    ///
    /// Returns the evicted ids in id order.
    pub fn evict_stale(&mut self, ttl: Duration, now: Instant) -> Vec<String> {
        let stale: Vec<String> = self
            .points
            .keys()
            .filter(|id| {
                self.last_seen
                    .get(id.as_str())
                    .map(|seen| now.saturating_duration_since(*seen) > ttl)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        for id in &stale {
            self.remove(id);
        }

        stale
    }

    pub fn get(&self, id: &str) -> Option<&Point> {
        self.points.get(id)
    }

    /// Number of tracked points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Immutable copy of the current mapping
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            points: Arc::clone(&self.points),
        }
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
        Arc::make_mut(&mut self.points).clear();
    }
}
