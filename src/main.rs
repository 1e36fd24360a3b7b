use anyhow::{ensure, Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

mod api;
mod client;
mod config;
mod engine;
mod models;

use crate::client::PresenceClient;
use crate::config::{FetchMode, PollerConfig};
use crate::engine::Poller;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into()))
        .with_ansi(true)
        .init();

    let config_path =
        std::env::var("PRESENCE_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let config_content = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read {}", config_path))?;
    let config: PollerConfig = serde_json::from_str(&config_content)
        .with_context(|| "Failed to parse config")?;
    ensure!(
        config.fetch_mode != FetchMode::PerSubject || !config.subjects.is_empty(),
        "per_subject fetch mode needs at least one subject id"
    );

    let api_key = std::env::var(&config.api_key_env)
        .with_context(|| format!("Missing API key environment variable {}", config.api_key_env))?;

    let client = PresenceClient::new(&config, api_key)?;
    let poller = Arc::new(Poller::new(config.clone(), client));

    let api_state = api::ApiState {
        state: poller.state.clone(),
        stale_after_secs: config.stale_after_secs,
    };
    let api_port = config.api_port;
    tokio::spawn(async move {
        api::start_server(api_port, api_state).await;
    });

    poller.start().await;

    signal::ctrl_c().await?;
    info!("Shutdown signal received. Stopping presence poller...");
    poller.stop().await;

    Ok(())
}
