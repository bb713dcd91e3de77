//! Periodic reconciliation task

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::reconciler::{Reconciler, TickReport};
use crate::dispatcher::{EventDispatcher, SyncEvent};
use crate::stats::SyncStats;
use crate::store::PointStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Shared {
    store: Arc<Mutex<PointStore>>,
    reconciler: Mutex<Reconciler>,
    dispatcher: EventDispatcher,
    stats: Arc<SyncStats>,
    point_ttl: Option<Duration>,
    /// Bumped by every start/stop; a tick from an older generation is a no-op
    generation: AtomicU64,
}

impl Shared {
    /// Run one tick, unless `expected` is set and no longer current
    fn run_tick(&self, expected: Option<u64>) -> Option<TickReport> {
        let current = || self.generation.load(Ordering::Acquire);
        if expected.is_some_and(|g| g != current()) {
            return None;
        }

        let (snapshot, evicted) = {
            let mut store = lock(&self.store);
            let evicted = match self.point_ttl {
                Some(ttl) => store.evict_stale(ttl, Instant::now()),
                None => Vec::new(),
            };
            (store.snapshot(), evicted)
        };

        if !evicted.is_empty() {
            debug!("Evicted {} stale points", evicted.len());
            self.stats.record_evicted(evicted.len() as u64);
            for id in evicted {
                self.dispatcher.publish(&SyncEvent::Removed(id));
            }
        }

        let mut reconciler = lock(&self.reconciler);
        // stop() may have run while we were evicting
        if expected.is_some_and(|g| g != current()) {
            return None;
        }

        let report = reconciler.tick(&snapshot);
        self.stats.record_tick(report.failed as u64);
        Some(report)
    }
}

/// Repeating timer that reconciles the store against a surface
pub struct ReconciliationLoop {
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl ReconciliationLoop {
    pub fn new(
        store: Arc<Mutex<PointStore>>,
        reconciler: Reconciler,
        dispatcher: EventDispatcher,
        stats: Arc<SyncStats>,
        point_ttl: Option<Duration>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                reconciler: Mutex::new(reconciler),
                dispatcher,
                stats,
                point_ttl,
                generation: AtomicU64::new(0),
            }),
            task: None,
        }
    }

    /// Start ticking every `interval`; restarts if already running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, interval: Duration) {
        self.stop();

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let shared = Arc::clone(&self.shared);
        info!("Starting refresh every {:?}", interval);

        self.task = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if shared.run_tick(Some(generation)).is_none() {
                    break;
                }
            }
        }));
    }

    /// Cancel the timer
    ///
    /// Idempotent. Waits for an in-flight tick, so the surface sees no calls
    /// from this loop once `stop` returns.
    pub fn stop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        drop(lock(&self.shared.reconciler));

        if let Some(task) = self.task.take() {
            task.abort();
            info!("Refresh stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Run one tick immediately, regardless of the timer
    pub fn tick_now(&self) -> TickReport {
        self.shared.run_tick(None).unwrap_or_default()
    }

    /// Remove every marker this loop drew
    pub fn clear(&self) -> TickReport {
        lock(&self.shared.reconciler).clear()
    }

    /// Ids currently drawn by this loop
    pub fn rendered_ids(&self) -> Vec<String> {
        lock(&self.shared.reconciler).rendered_ids()
    }
}

impl Drop for ReconciliationLoop {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::EventKind;
    use crate::models::{Category, Point};
    use crate::render::{MemorySurface, RenderStrategy};

    fn setup(ttl: Option<Duration>) -> (ReconciliationLoop, Arc<Mutex<PointStore>>, MemorySurface, EventDispatcher) {
        let store = Arc::new(Mutex::new(PointStore::new()));
        let surface = MemorySurface::new();
        let dispatcher = EventDispatcher::new();
        let refresh = ReconciliationLoop::new(
            Arc::clone(&store),
            Reconciler::new(Box::new(surface.clone()), RenderStrategy::FullRebuild),
            dispatcher.clone(),
            Arc::new(SyncStats::new()),
            ttl,
        );
        (refresh, store, surface, dispatcher)
    }

    #[tokio::test]
    async fn test_ticks_render_store() {
        let (mut refresh, store, surface, _) = setup(None);
        store
            .lock()
            .unwrap()
            .upsert(Point::new("a", 1.0, 1.0, Category::Red));

        refresh.start(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(70)).await;
        refresh.stop();

        assert_eq!(surface.marker_count(), 1);
        assert!(!surface.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_twice_and_no_calls_after_stop() {
        let (mut refresh, store, surface, _) = setup(None);
        store
            .lock()
            .unwrap()
            .upsert(Point::new("a", 1.0, 1.0, Category::Red));

        refresh.start(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(35)).await;

        refresh.stop();
        refresh.stop();
        assert!(!refresh.is_running());

        let calls_at_stop = surface.calls().len();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(surface.calls().len(), calls_at_stop);
    }

    #[tokio::test]
    async fn test_stop_when_never_started() {
        let (mut refresh, _, _, _) = setup(None);
        refresh.stop();
        assert!(!refresh.is_running());
    }

    #[tokio::test]
    async fn test_tick_now_and_clear() {
        let (refresh, store, surface, _) = setup(None);
        {
            let mut store = store.lock().unwrap();
            store.upsert(Point::new("a", 1.0, 1.0, Category::Red));
            store.upsert(Point::new("b", 2.0, 2.0, Category::Green));
        }

        let report = refresh.tick_now();
        assert_eq!(report.added, 2);
        assert_eq!(refresh.rendered_ids(), vec!["a".to_string(), "b".to_string()]);

        let report = refresh.clear();
        assert_eq!(report.removed, 2);
        assert_eq!(surface.marker_count(), 0);
    }

    #[tokio::test]
    async fn test_ttl_eviction_publishes_removed() {
        let (refresh, store, surface, dispatcher) = setup(Some(Duration::from_secs(30)));
        let removed = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&removed);
        let _sub = dispatcher.on(EventKind::Removed, move |event| {
            if let SyncEvent::Removed(id) = event {
                r.lock().unwrap().push(id.clone());
            }
            Ok(())
        });

        {
            let mut store = store.lock().unwrap();
            let long_ago = Instant::now()
                .checked_sub(Duration::from_secs(120))
                .expect("monotonic clock too close to its origin");
            store.upsert_at(Point::new("stale", 1.0, 1.0, Category::Red), long_ago);
            store.upsert(Point::new("live", 2.0, 2.0, Category::Red));
        }

        let report = refresh.tick_now();

        assert_eq!(report.added, 1);
        assert_eq!(*removed.lock().unwrap(), vec!["stale".to_string()]);
        assert_eq!(surface.marker_count(), 1);
        assert!(store.lock().unwrap().get("stale").is_none());
        assert!(store.lock().unwrap().get("live").is_some());
    }
}
