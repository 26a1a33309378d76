mod alert;
mod api;
mod broker;
mod config;
mod conn;
mod control;
mod dispatch;
mod feed;
mod session;
mod state;
mod store;
mod ui;

use anyhow::Result;
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ui::UiEvent;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    let mut session = session::start(cfg).await?;

    // Headless host: log every event the page updaters would have drawn.
    // `session.commands` is where an embedding UI would feed user actions.
    while let Some(event) = session.events.recv().await {
        match event {
            UiEvent::Sensor(s) => info!(
                temperature = s.temperature,
                humidity = s.humidity,
                ph = s.ph,
                "sensor update"
            ),
            UiEvent::History(rows) => info!(rows = rows.len(), "history update"),
            UiEvent::Forecast(days) => info!(days = days.len(), "forecast update"),
            UiEvent::DeviceState { device, status } => info!(%device, status, "device status"),
            UiEvent::TimerChanged { device, timer } => {
                info!(%device, set = timer.is_some(), "timer changed")
            }
            UiEvent::Notification(rec) => info!(message = %rec.message, "notification"),
            UiEvent::Notice(msg) => info!(%msg, "notice"),
            UiEvent::ConnectionLost { transport } => {
                warn!(%transport, "connection lost, retries exhausted")
            }
            UiEvent::ConnectionRestored { transport } => info!(%transport, "connection restored"),
        }
    }

    Ok(())
}
