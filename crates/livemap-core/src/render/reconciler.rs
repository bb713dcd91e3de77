//! Snapshot -> surface reconciliation

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::surface::{Marker, MarkerHandle, RenderSurface};
use crate::models::Point;
use crate::store::Snapshot;

/// How a tick brings the surface in line with the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderStrategy {
    /// Remove everything drawn, then draw every point
    #[default]
    FullRebuild,
    /// Only add, update or remove what changed since the last tick
    Incremental,
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Surface calls that failed; the tick carried on regardless
    pub failed: usize,
}

impl TickReport {
    /// Number of surface calls that succeeded
    pub fn render_calls(&self) -> usize {
        self.added + self.updated + self.removed
    }
}

#[derive(Debug, Clone)]
struct Rendered {
    handle: MarkerHandle,
    point: Point,
}

/// Tracks what it drew on a surface and reconciles it against snapshots
pub struct Reconciler {
    surface: Box<dyn RenderSurface>,
    strategy: RenderStrategy,
    /// Rendered marker set, keyed by point id
    rendered: HashMap<String, Rendered>,
    /// Markers whose removal failed; retried on the next tick
    orphans: Vec<MarkerHandle>,
}

impl Reconciler {
    pub fn new(surface: Box<dyn RenderSurface>, strategy: RenderStrategy) -> Self {
        Self {
            surface,
            strategy,
            rendered: HashMap::new(),
            orphans: Vec::new(),
        }
    }

    pub fn strategy(&self) -> RenderStrategy {
        self.strategy
    }

    /// Ids currently drawn by this reconciler, sorted
    pub fn rendered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rendered.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn rendered_count(&self) -> usize {
        self.rendered.len()
    }

    /// Bring the surface in line with `snapshot`
    pub fn tick(&mut self, snapshot: &Snapshot) -> TickReport {
        let mut report = TickReport::default();
        self.retry_orphans(&mut report);

        match self.strategy {
            RenderStrategy::FullRebuild => self.full_rebuild(snapshot, &mut report),
            RenderStrategy::Incremental => self.incremental(snapshot, &mut report),
        }

        debug!(
            "Tick: added={} updated={} removed={} unchanged={} failed={}",
            report.added, report.updated, report.removed, report.unchanged, report.failed
        );
        report
    }

    /// Remove every marker this reconciler drew
    pub fn clear(&mut self) -> TickReport {
        let mut report = TickReport::default();
        self.retry_orphans(&mut report);

        for (_, rendered) in self.rendered.drain() {
            match self.surface.remove_marker(rendered.handle) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!("Failed to remove marker '{}': {}", rendered.point.id, e);
                    report.failed += 1;
                    self.orphans.push(rendered.handle);
                }
            }
        }

        report
    }

    fn retry_orphans(&mut self, report: &mut TickReport) {
        let orphans = std::mem::take(&mut self.orphans);
        for handle in orphans {
            match self.surface.remove_marker(handle) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!("Failed to remove marker {}: {}", handle, e);
                    report.failed += 1;
                    self.orphans.push(handle);
                }
            }
        }
    }

    fn full_rebuild(&mut self, snapshot: &Snapshot, report: &mut TickReport) {
        let cleared = self.clear();
        report.removed += cleared.removed;
        report.failed += cleared.failed;

        for point in snapshot.iter() {
            self.draw(point, report);
        }
    }

    fn incremental(&mut self, snapshot: &Snapshot, report: &mut TickReport) {
        let gone: Vec<String> = self
            .rendered
            .keys()
            .filter(|id| !snapshot.contains(id))
            .cloned()
            .collect();

        for id in gone {
            let Some(rendered) = self.rendered.get(&id) else {
                continue;
            };
            match self.surface.remove_marker(rendered.handle) {
                Ok(()) => {
                    self.rendered.remove(&id);
                    report.removed += 1;
                }
                // Stays tracked, so the next tick tries again
                Err(e) => {
                    warn!("Failed to remove marker '{}': {}", id, e);
                    report.failed += 1;
                }
            }
        }

        for point in snapshot.iter() {
            match self.rendered.get_mut(&point.id) {
                Some(rendered) if rendered.point == *point => report.unchanged += 1,
                Some(rendered) => {
                    match self
                        .surface
                        .update_marker(rendered.handle, &Marker::from_point(point))
                    {
                        Ok(()) => {
                            rendered.point = point.clone();
                            report.updated += 1;
                        }
                        Err(e) => {
                            warn!("Failed to update marker '{}': {}", point.id, e);
                            report.failed += 1;
                        }
                    }
                }
                None => self.draw(point, report),
            }
        }
    }

    fn draw(&mut self, point: &Point, report: &mut TickReport) {
        match self.surface.add_marker(&Marker::from_point(point)) {
            Ok(handle) => {
                self.rendered.insert(
                    point.id.clone(),
                    Rendered {
                        handle,
                        point: point.clone(),
                    },
                );
                report.added += 1;
            }
            Err(e) => {
                warn!("Failed to draw marker '{}': {}", point.id, e);
                report.failed += 1;
            }
        }
    }
}
