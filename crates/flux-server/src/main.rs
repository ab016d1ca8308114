//! Flux irrigation broker
//!
//! Main entry point: loads the add-on options, resolves the device rosters,
//! and runs the broker against the hub's event stream until Ctrl-C.

mod collaborators;
mod roster;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flux_broker::Broker;
use flux_hub::{EventStream, Hub, HubClient, ReconnectConfig, WsClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(60);

fn init_tracing(level: &str) {
    let default = format!("{level},hyper=warn,reqwest=warn,tungstenite=warn");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let options_path = std::env::args().nth(1).map(PathBuf::from);
    let config = flux_config::load_config(options_path.as_deref()).context("loading options")?;
    init_tracing(&config.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Flux broker");

    let token = config
        .hub_token
        .clone()
        .context("no hub token: set hub_token or SUPERVISOR_TOKEN")?;
    let client = HubClient::new(&config.hub_url, Some(token.clone()))?;
    if !client.wait_for_healthy(HEALTH_TIMEOUT).await {
        warn!(url = %config.hub_url, "Hub not healthy yet, continuing");
    }
    let hub: Arc<dyn Hub> = Arc::new(client);

    let ws_url = config.websocket_url();
    let ws = WsClient::new(&ws_url, &token);
    let roster = roster::resolve(&config, &ws).await?;

    let broker = Broker::new(
        hub.clone(),
        roster,
        collaborators::hub_collaborators(hub),
        config.timings,
        config.use_12_hour_format,
    );
    if let Err(e) = broker.build().await {
        warn!(error = %e, "Initial state read failed; waiting for the event stream");
    }

    let cancel = CancellationToken::new();
    let signals = EventStream::spawn(
        ws_url,
        token,
        ReconnectConfig {
            initial_delay: config.timings.reconnect_initial_delay(),
            max_delay: config.timings.reconnect_max_delay(),
        },
        cancel.clone(),
    );

    info!(?broker, "Flux broker is running");

    tokio::select! {
        _ = broker.run(signals) => {
            warn!("Event stream closed");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down...");
        }
    }

    cancel.cancel();
    broker.shutdown().await;
    Ok(())
}
