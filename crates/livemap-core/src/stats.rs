//! Sync counters
//!
//! Lock-free counters shared between the inbound pump and the
//! reconciliation loop. Read them through `SyncStats::snapshot()`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct SyncStats {
    inbound_events: AtomicU64,
    malformed_payloads: AtomicU64,
    ticks: AtomicU64,
    render_failures: AtomicU64,
    evicted_points: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub inbound_events: u64,
    pub malformed_payloads: u64,
    pub ticks: u64,
    pub render_failures: u64,
    pub evicted_points: u64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_inbound(&self) {
        self.inbound_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self, count: u64) {
        self.malformed_payloads.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_tick(&self, failures: u64) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.render_failures.fetch_add(failures, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: u64) {
        self.evicted_points.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            inbound_events: self.inbound_events.load(Ordering::Relaxed),
            malformed_payloads: self.malformed_payloads.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            render_failures: self.render_failures.load(Ordering::Relaxed),
            evicted_points: self.evicted_points.load(Ordering::Relaxed),
        }
    }
}
