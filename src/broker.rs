//! MQTT side of the session: device status subscriptions and the
//! reconnect loop around the rumqttc event loop.
//!
//! Topics:
//! - `iot/device/status/{device}`         device -> client status
//! - `iot/device/control/{device}`        client -> device command
//! - `iot/device/status_request/{device}` client asks for a status echo

use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::conn::{ConnAction, ConnEvent, Reconnect};
use crate::state::{Device, SharedState};
use crate::ui::{Transport, UiEvent, UiSender};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

pub const STATUS_SUBSCRIPTION: &str = "iot/device/status/#";

pub fn control_topic(device: Device) -> String {
    format!("iot/device/control/{device}")
}

pub fn status_request_topic(device: Device) -> String {
    format!("iot/device/status_request/{device}")
}

/// Extract the device from "iot/device/status/<device>".
pub fn extract_status_device(topic: &str) -> Option<Device> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 4 && parts[0] == "iot" && parts[1] == "device" && parts[2] == "status" {
        Device::parse(parts[3])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Incoming status message.  `type: "request_status"` marks the echo of
/// our own request and must be ignored to avoid a feedback loop.
#[derive(Debug, Deserialize)]
pub struct StatusMsg {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub status: Option<bool>,
}

impl StatusMsg {
    pub fn is_status_request(&self) -> bool {
        self.kind.as_deref() == Some("request_status")
    }
}

#[derive(Debug, Serialize)]
struct ControlMsg<'a> {
    status: bool,
    timestamp: &'a str,
}

#[derive(Debug, Serialize)]
struct StatusRequestMsg<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    timestamp: &'a str,
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

pub fn control_payload(status: bool) -> Vec<u8> {
    serde_json::to_vec(&ControlMsg {
        status,
        timestamp: &now_rfc3339(),
    })
    .unwrap_or_default()
}

pub fn status_request_payload() -> Vec<u8> {
    serde_json::to_vec(&StatusRequestMsg {
        kind: "request_status",
        timestamp: &now_rfc3339(),
    })
    .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Incoming publish handling
// ---------------------------------------------------------------------------

/// Apply one status publish to the session.  Returns the device whose
/// status changed, if any.
pub async fn handle_status_publish(
    topic: &str,
    payload: &[u8],
    state: &SharedState,
    ui: &UiSender,
) -> Option<Device> {
    let Some(device) = extract_status_device(topic) else {
        debug!(topic, "unhandled broker topic");
        return None;
    };

    let msg: StatusMsg = match serde_json::from_slice(payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(topic, "bad status json: {e}");
            ui.notice(format!("Lỗi khi xử lý dữ liệu từ server ({device})"));
            return None;
        }
    };

    if msg.is_status_request() {
        // Our own status request echoed back through the shared topic tree.
        debug!(%device, "ignoring request_status echo");
        return None;
    }

    let status = msg.status?;
    state.write().await.device_mut(device).status = status;
    ui.send(UiEvent::DeviceState { device, status });
    Some(device)
}

// ---------------------------------------------------------------------------
// Event loop task
// ---------------------------------------------------------------------------

/// Drive the rumqttc event loop with the shared reconnect state machine.
/// Intended to be `tokio::spawn`-ed from main.
pub async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    state: SharedState,
    ui: UiSender,
    mut fsm: Reconnect,
    wake: Arc<Notify>,
) {
    let mut was_lost = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("broker connected");
                fsm.on_event(ConnEvent::Opened);
                state.write().await.broker_state = fsm.state();

                if was_lost {
                    was_lost = false;
                    ui.send(UiEvent::ConnectionRestored {
                        transport: Transport::Broker,
                    });
                }

                if let Err(e) = client.subscribe(STATUS_SUBSCRIPTION, QoS::AtLeastOnce).await {
                    error!("broker subscribe failed: {e}");
                }
                // Ask every device for a fresh status echo after (re)connect.
                for device in Device::ALL {
                    if let Err(e) = client
                        .publish(
                            status_request_topic(device),
                            QoS::AtLeastOnce,
                            false,
                            status_request_payload(),
                        )
                        .await
                    {
                        error!(%device, "status request publish failed: {e}");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                handle_status_publish(&p.topic, &p.payload, &state, &ui).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("broker sent disconnect");
                apply(
                    &mut fsm,
                    ConnEvent::Closed,
                    &state,
                    &ui,
                    &wake,
                    &mut was_lost,
                )
                .await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("broker error: {e}");
                apply(
                    &mut fsm,
                    ConnEvent::Errored,
                    &state,
                    &ui,
                    &wake,
                    &mut was_lost,
                )
                .await;
            }
        }
    }
}

/// Run one FSM transition and honour the resulting action: wait out the
/// backoff delay (interruptible by a wake) or park until woken.
async fn apply(
    fsm: &mut Reconnect,
    event: ConnEvent,
    state: &SharedState,
    ui: &UiSender,
    wake: &Arc<Notify>,
    was_lost: &mut bool,
) {
    let mut action = fsm.on_event(event);
    loop {
        state.write().await.broker_state = fsm.state();
        match action {
            ConnAction::None => return,
            ConnAction::Reconnect { delay } => {
                if delay.is_zero() {
                    return;
                }
                debug!(?delay, "broker backoff");
                tokio::select! {
                    _ = sleep(delay) => return,
                    _ = wake.notified() => {
                        action = fsm.on_event(ConnEvent::Wake);
                    }
                }
            }
            ConnAction::GiveUp => {
                if !*was_lost {
                    *was_lost = true;
                    ui.send(UiEvent::ConnectionLost {
                        transport: Transport::Broker,
                    });
                }
                // Parked until a manual retry / visibility wake arrives.
                wake.notified().await;
                action = fsm.on_event(ConnEvent::Wake);
            }
        }
    }
}

/// Publish a control command.  The caller is responsible for the
/// connection-state check; this only does the wire work.
pub async fn publish_control(client: &AsyncClient, device: Device, status: bool) -> Result<()> {
    client
        .publish(
            control_topic(device),
            QoS::AtLeastOnce,
            false,
            control_payload(status),
        )
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
