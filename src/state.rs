use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::macros::offset;
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::RwLock;

use crate::conn::ConnState;

/// Near-equality tolerance for floating-point sensor fields.
pub const SENSOR_EPSILON: f64 = 0.1;

/// Local offset the deployment runs in (Asia/Ho_Chi_Minh, no DST).
/// Timer fields and notification labels are interpreted here.
pub const VN_UTC_OFFSET: UtcOffset = offset!(+7);

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SessionState>>;

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Light,
    Roof,
    Pump,
    Fan,
}

impl Device {
    pub const ALL: [Device; 4] = [Device::Light, Device::Roof, Device::Pump, Device::Fan];

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Light => "light",
            Device::Roof => "roof",
            Device::Pump => "pump",
            Device::Fan => "fan",
        }
    }

    /// Display name used in notification text.
    pub fn name_vi(&self) -> &'static str {
        match self {
            Device::Light => "Đèn",
            Device::Roof => "Mái che",
            Device::Pump => "Máy bơm",
            Device::Fan => "Quạt",
        }
    }

    pub fn parse(s: &str) -> Option<Device> {
        match s {
            "light" => Some(Device::Light),
            "roof" => Some(Device::Roof),
            "pump" => Some(Device::Pump),
            "fan" => Some(Device::Fan),
            _ => None,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Sensor snapshot
// ---------------------------------------------------------------------------

/// The most recently accepted full sensor reading.  Replaced wholesale on
/// each accepted update; never merged field-by-field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSnapshot {
    pub temperature: f64,
    pub humidity: f64,
    pub nitrogen: i64,
    pub phosphorus: i64,
    pub potassium: i64,
    pub ph: f64,
    pub rainfall: f64,
    pub monthly_rainfall: f64,
}

impl SensorSnapshot {
    /// Near-equality: |Δ| < 0.1 for float fields, exact for NPK integers.
    /// Updates that compare equal are dropped to suppress redundant UI churn.
    pub fn approx_eq(&self, other: &SensorSnapshot) -> bool {
        (self.temperature - other.temperature).abs() < SENSOR_EPSILON
            && (self.humidity - other.humidity).abs() < SENSOR_EPSILON
            && self.nitrogen == other.nitrogen
            && self.phosphorus == other.phosphorus
            && self.potassium == other.potassium
            && (self.ph - other.ph).abs() < SENSOR_EPSILON
            && (self.rainfall - other.rainfall).abs() < SENSOR_EPSILON
            && (self.monthly_rainfall - other.monthly_rainfall).abs() < SENSOR_EPSILON
    }
}

// ---------------------------------------------------------------------------
// Device settings & timers
// ---------------------------------------------------------------------------

/// A timer window as stored by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerWindow {
    #[serde(with = "time::serde::rfc3339")]
    pub on_datetime: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub off_datetime: OffsetDateTime,
    #[serde(default)]
    pub daily: bool,
    #[serde(default)]
    pub enabled: bool,
}

/// Per-device on/off status plus the optional timer window.  Broker status
/// messages are authoritative; local user actions wait for the echo.
#[derive(Debug, Clone, Default)]
pub struct DeviceSetting {
    pub status: bool,
    pub timer: Option<TimerWindow>,
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// All mutable client-session state, constructed once in main and shared
/// with the transport tasks.  Mutated only from async callback handlers, so
/// the RwLock sees no contention worth speaking of.
pub struct SessionState {
    pub feed_state: ConnState,
    pub broker_state: ConnState,
    pub last_snapshot: Option<SensorSnapshot>,
    pub devices: HashMap<Device, DeviceSetting>,
    /// While a user time filter is active, incoming history arrays are
    /// parked here instead of being forwarded (newest wins).
    pub history_filtered: bool,
    pub deferred_history: Option<Vec<HistoryRow>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            feed_state: ConnState::Connecting,
            broker_state: ConnState::Connecting,
            last_snapshot: None,
            devices: Device::ALL
                .iter()
                .map(|d| (*d, DeviceSetting::default()))
                .collect(),
            history_filtered: false,
            deferred_history: None,
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(SessionState::new()))
    }

    pub fn device(&self, device: Device) -> &DeviceSetting {
        // The map is seeded with every variant in new().
        &self.devices[&device]
    }

    pub fn device_mut(&mut self, device: Device) -> &mut DeviceSetting {
        self.devices.entry(device).or_default()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Feed payload rows
// ---------------------------------------------------------------------------

/// One row of the history table.  Field values may be missing or
/// non-numeric upstream, hence the options; the timestamp is forwarded
/// verbatim since formatting is a display concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub timestamp: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub rainfall: Option<f64>,
    #[serde(default)]
    pub nitrogen: Option<f64>,
    #[serde(default)]
    pub phosphorus: Option<f64>,
    #[serde(default)]
    pub potassium: Option<f64>,
    #[serde(default)]
    pub ph: Option<f64>,
}

/// One day of the 5-day weather forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyForecast {
    pub date: String,
    pub temperature: f64,
    pub humidity: f64,
    pub rainfall: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
}

// ===========================================================================
// Tests
// ===========================================================================
