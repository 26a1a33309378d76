//! Session assembly: one call builds the store, both transports, the
//! dispatcher, and the controller, then hands the host a command sender
//! and an event receiver.  Everything else runs on spawned tasks.

use anyhow::Result;
use rumqttc::{AsyncClient, MqttOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::alert::Notifier;
use crate::api::ApiClient;
use crate::broker;
use crate::config::Config;
use crate::control::{self, Controller};
use crate::dispatch::{Dispatcher, Envelope};
use crate::feed;
use crate::state::{Device, SessionState};
use crate::store::Store;
use crate::ui::{SessionCommand, UiEvent, UiSender};

/// Fallback sweep cadence: re-runs the threshold check against the last
/// snapshot even when the feed goes quiet.  The cooldown still applies.
const ALERT_RECHECK_INTERVAL: Duration = Duration::from_secs(30);

const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);

pub struct Session {
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    pub events: mpsc::UnboundedReceiver<UiEvent>,
}

pub async fn start(cfg: Config) -> Result<Session> {
    let store = Store::connect(&cfg.store.database_url).await?;
    store.migrate().await?;

    let notifier = Arc::new(Mutex::new(
        Notifier::load(store.clone(), cfg.alert.cooldown()).await?,
    ));
    {
        let n = notifier.lock().await;
        info!(
            persisted = n.records().len(),
            unread = n.unread_count(),
            "notifications reloaded"
        );
    }
    let state = SessionState::shared();
    let (ui, events) = UiSender::channel();
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<SessionCommand>();

    let api = ApiClient::new(&cfg.api.base_url);

    // Broker coordinates come from the server; the config file is only the
    // fallback when that fetch fails.
    let (host, port, username, password) = match api.mqtt_config().await {
        Ok(mc) => (mc.host, mc.port, mc.username, mc.password),
        Err(e) => {
            warn!("mqtt-config fetch failed, using configured fallback: {e:#}");
            (
                cfg.broker.host.clone(),
                cfg.broker.port,
                cfg.broker.username.clone(),
                cfg.broker.password.clone(),
            )
        }
    };

    let client_id = format!("farmfeed-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(MQTT_KEEP_ALIVE);
    if !username.is_empty() {
        options.set_credentials(username, password);
    }
    let (mqtt, eventloop) = AsyncClient::new(options, 20);

    let dispatcher = Arc::new(Mutex::new(Dispatcher::new(
        state.clone(),
        ui.clone(),
        Arc::clone(&notifier),
    )));

    let feed_wake = Arc::new(Notify::new());
    let broker_wake = Arc::new(Notify::new());

    tokio::spawn(feed::run(
        cfg.feed.url.clone(),
        Arc::clone(&dispatcher),
        state.clone(),
        ui.clone(),
        cfg.feed.reconnect(),
        Arc::clone(&feed_wake),
    ));
    tokio::spawn(broker::run(
        mqtt.clone(),
        eventloop,
        state.clone(),
        ui.clone(),
        cfg.broker.reconnect(),
        Arc::clone(&broker_wake),
    ));

    let controller = Controller::new(api.clone(), mqtt, state.clone(), ui, Arc::clone(&notifier));

    // Seed every device's timer without holding up startup.
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller.load_timers().await;
        });
    }

    tokio::spawn(control::poll_loop(
        controller.clone(),
        state,
        Arc::clone(&feed_wake),
        Arc::clone(&broker_wake),
    ));

    // Periodic wake: the headless stand-in for the page's visibility
    // handler.  Open transports are not waiting on these, so the nudge
    // only reaches ones stuck in backoff or parked after giving up.
    {
        let feed_wake = Arc::clone(&feed_wake);
        let broker_wake = Arc::clone(&broker_wake);
        let wake_interval = cfg.feed.wake_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(wake_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                feed_wake.notify_waiters();
                broker_wake.notify_waiters();
            }
        });
    }

    // Alert fallback tick.
    {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ALERT_RECHECK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = dispatcher.lock().await.recheck_alerts().await {
                    warn!("alert recheck failed: {e:#}");
                }
            }
        });
    }

    // Command routing.
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            route(cmd, &api, &controller, &dispatcher, &notifier, &feed_wake, &broker_wake).await;
        }
        info!("command sender dropped, session keeps running");
    });

    Ok(Session {
        commands: cmd_tx,
        events,
    })
}

async fn route(
    cmd: SessionCommand,
    api: &ApiClient,
    controller: &Controller,
    dispatcher: &Arc<Mutex<Dispatcher>>,
    notifier: &Arc<Mutex<Notifier>>,
    feed_wake: &Arc<Notify>,
    broker_wake: &Arc<Notify>,
) {
    match cmd {
        // Manual retry nudges every transport; the FSMs ignore the wake
        // wherever the connection is already open.
        SessionCommand::Retry => {
            feed_wake.notify_waiters();
            broker_wake.notify_waiters();
        }
        // Visibility additionally pulls a fresh snapshot and fresh device
        // statuses right away rather than waiting for the next push.
        SessionCommand::Visible => {
            feed_wake.notify_waiters();
            broker_wake.notify_waiters();
            for device in Device::ALL {
                if let Err(e) = controller.request_status(device).await {
                    warn!(%device, "status request failed: {e:#}");
                }
            }
            match api.latest_data().await {
                Ok(snap) => {
                    let env = Envelope {
                        latest: Some(snap),
                        ..Envelope::default()
                    };
                    if let Err(e) = dispatcher.lock().await.handle(env).await {
                        warn!("visibility refresh dispatch failed: {e:#}");
                    }
                }
                Err(e) => warn!("visibility refresh fetch failed: {e:#}"),
            }
        }
        SessionCommand::ControlDevice { device, status } => {
            if let Err(e) = controller.control_device(device, status).await {
                warn!(%device, "control command failed: {e:#}");
            }
        }
        SessionCommand::SetTimer { device, req } => {
            if let Err(e) = controller.set_timer(device, req).await {
                warn!(%device, "set-timer failed: {e:#}");
            }
        }
        SessionCommand::ClearTimer { device } => {
            if let Err(e) = controller.clear_timer(device).await {
                warn!(%device, "clear-timer failed: {e:#}");
            }
        }
        SessionCommand::BeginEdit { device } => controller.begin_edit(device).await,
        SessionCommand::EndEdit { device } => controller.end_edit(device).await,
        SessionCommand::SetHistoryFilter { active } => {
            dispatcher.lock().await.set_history_filter(active).await;
        }
        SessionCommand::MarkNotificationsRead => {
            if let Err(e) = notifier.lock().await.mark_all_read().await {
                warn!("mark notifications read failed: {e:#}");
            }
        }
        SessionCommand::SetTemperatureThreshold { value } => {
            if let Err(e) = notifier.lock().await.set_temperature_threshold(value).await {
                warn!("threshold update failed: {e:#}");
            }
        }
    }
}
