//! Send and push command handlers

use anyhow::{Context, Result};

use livemap_core::{Category, Config, Point, SyncClient};

use crate::output::Output;

/// Connect to the configured hub
async fn connected_client(config: Config) -> Result<SyncClient> {
    let url = config.hub_url.clone();
    let mut client = SyncClient::new(config);
    client
        .connect()
        .await
        .with_context(|| format!("Failed to connect to hub at {}", url))?;
    Ok(client)
}

/// Broadcast a text message through the hub
pub async fn send(config: Config, text: String, output: &Output) -> Result<()> {
    let mut client = connected_client(config).await?;

    let result = client.send_message(&text).await;
    client.disconnect().await;
    result.context("Hub did not accept the message")?;

    output.success("Message sent");
    Ok(())
}

/// Publish a point update through the hub
pub async fn push(
    config: Config,
    id: String,
    lat: f64,
    lng: f64,
    category: Category,
    output: &Output,
) -> Result<()> {
    // Same checks the hub's other clients apply on receipt
    let point = Point::new(id, lat, lng, category)
        .to_payload()
        .validate()
        .context("Invalid point")?;

    let mut client = connected_client(config).await?;

    let result = client.send_state_change(&point).await;
    client.disconnect().await;
    result.context("Hub did not accept the state change")?;

    output.success(&format!(
        "Pushed {} at ({}, {}) [{}]",
        point.id, point.position.lat, point.position.lng, point.category
    ));
    Ok(())
}
