//! The seam between the session and whatever renders it.
//!
//! The browser page handed the feed client a set of updater callbacks
//! (chart, table, notifications, device state).  Here that becomes a
//! [`UiEvent`] channel the host consumes, and a [`SessionCommand`] channel
//! for user actions flowing the other way.

use tokio::sync::mpsc;
use tracing::warn;

use crate::alert::NotificationRecord;
use crate::state::{DailyForecast, Device, HistoryRow, SensorSnapshot, TimerWindow};

// ---------------------------------------------------------------------------
// Events (session -> host)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Accepted (non-duplicate) sensor snapshot.
    Sensor(SensorSnapshot),
    /// History table rows, newest server payload.
    History(Vec<HistoryRow>),
    /// 5-day forecast, applied unconditionally.
    Forecast(Vec<DailyForecast>),
    /// Broker-confirmed device status.
    DeviceState { device: Device, status: bool },
    /// Timer window changed (set, cleared, or reconciled from the server).
    TimerChanged {
        device: Device,
        timer: Option<TimerWindow>,
    },
    /// A new notification was appended.
    Notification(NotificationRecord),
    /// Transient notice (decode failure, HTTP error, rejected command).
    Notice(String),
    /// Persistent, user-dismissible banner: a transport gave up retrying.
    ConnectionLost { transport: Transport },
    ConnectionRestored { transport: Transport },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Feed,
    Broker,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Feed => f.write_str("feed"),
            Transport::Broker => f.write_str("broker"),
        }
    }
}

// ---------------------------------------------------------------------------
// Commands (host -> session)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Manual retry from the connection-error banner.
    Retry,
    /// The page became visible again (or the host's equivalent).
    Visible,
    ControlDevice { device: Device, status: bool },
    SetTimer { device: Device, req: TimerRequest },
    ClearTimer { device: Device },
    /// User focused a device's timer inputs: suppress server refreshes.
    BeginEdit { device: Device },
    /// User left the inputs: refreshes resume after a short grace period.
    EndEdit { device: Device },
    SetHistoryFilter { active: bool },
    MarkNotificationsRead,
    /// Persist a new temperature alert threshold (°C).
    SetTemperatureThreshold { value: f64 },
}

/// Raw timer form input, validated by the controller before submission.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerRequest {
    pub on_date: String,  // YYYY-MM-DD
    pub on_time: String,  // HH:MM
    pub off_date: String, // YYYY-MM-DD
    pub off_time: String, // HH:MM
    pub daily: bool,
}

// ---------------------------------------------------------------------------
// Sender wrapper
// ---------------------------------------------------------------------------

/// Cloneable handle the session uses to push events at the host.  A closed
/// receiver only means the host went away; the session keeps running.
#[derive(Clone)]
pub struct UiSender {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl UiSender {
    pub fn channel() -> (UiSender, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (UiSender { tx }, rx)
    }

    pub fn send(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            warn!("ui receiver dropped, event discarded");
        }
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.send(UiEvent::Notice(message.into()));
    }
}
