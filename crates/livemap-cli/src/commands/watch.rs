//! Watch command handler
//!
//! Connects to the hub, renders the live point set into an in-memory surface
//! and prints events plus a per-interval summary until interrupted.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use livemap_core::render::SurfaceCall;
use livemap_core::{
    Config, EventKind, MemorySurface, RenderStrategy, Subscription, SyncClient, TickReport,
};

use crate::output::Output;

/// Overrides given on the command line
#[derive(Debug, Default)]
pub struct WatchOptions {
    pub url: Option<String>,
    pub interval_ms: Option<u64>,
    pub incremental: bool,
}

impl WatchOptions {
    fn apply(self, config: &mut Config) {
        if let Some(url) = self.url {
            config.hub_url = url;
        }
        if let Some(ms) = self.interval_ms {
            config.refresh_interval_ms = ms.max(1);
        }
        if self.incremental {
            config.render_strategy = RenderStrategy::Incremental;
        }
    }
}

/// Tally surface calls made since the last summary
fn summarize(calls: &[SurfaceCall], failed: u64) -> TickReport {
    let mut report = TickReport {
        failed: failed as usize,
        ..Default::default()
    };
    for call in calls {
        match call {
            SurfaceCall::Add(_) => report.added += 1,
            SurfaceCall::Update(..) => report.updated += 1,
            SurfaceCall::Remove(_) => report.removed += 1,
        }
    }
    report
}

/// Print every sync event; nothing is registered in quiet mode
fn subscribe_output(client: &SyncClient, output: Output) -> Vec<Subscription> {
    if output.is_quiet() {
        return Vec::new();
    }

    EventKind::ALL
        .iter()
        .map(|&kind| {
            client.on(kind, move |event| {
                output.event(event);
                Ok(())
            })
        })
        .collect()
}

/// Watch the hub until Ctrl-C
pub async fn watch(mut config: Config, options: WatchOptions, output: Output) -> Result<()> {
    options.apply(&mut config);
    let interval = config.refresh_interval();
    let url = config.hub_url.clone();

    let mut client = SyncClient::new(config);
    let _subscriptions = subscribe_output(&client, output);

    output.message(&format!("Connecting to {}...", url));
    client
        .connect()
        .await
        .with_context(|| format!("Failed to connect to hub at {}", url))?;

    let surface = MemorySurface::new();
    client.start_refresh(Box::new(surface.clone()), interval);
    info!("Watching {} every {:?}", url, interval);

    // Summaries land between reconciliation ticks
    let mut display =
        tokio::time::interval_at(tokio::time::Instant::now() + interval + interval / 2, interval);
    let mut failures_seen = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = display.tick() => {
                let failures = client.stats().render_failures;
                let report = summarize(&surface.take_calls(), failures - failures_seen);
                failures_seen = failures;
                output.tick(&report, &surface.markers(), client.point_count());
            }
        }
    }

    output.message("Stopping...");
    let stats = client.stats();
    client.close().await;

    output.success(&format!(
        "Stopped after {} ticks ({} inbound events, {} malformed)",
        stats.ticks, stats.inbound_events, stats.malformed_payloads
    ));
    Ok(())
}
