//! Threshold alerting and the bounded notification list.
//!
//! Sweeps run only on accepted sensor updates (plus a periodic fallback
//! tick) and are rate-limited by a cooldown persisted across restarts, so
//! a reading stuck out of range cannot produce an alert storm.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::debug;

use crate::state::{SensorSnapshot, VN_UTC_OFFSET};
use crate::store::{Store, KEY_NOTIFICATIONS, KEY_NOTIFICATION_COUNT};

/// Maximum number of notifications retained; oldest evicted first.
pub const MAX_NOTIFICATIONS: usize = 20;

/// Minimum time between threshold sweeps.
pub const ALERT_COOLDOWN: Duration = Duration::from_secs(2 * 60);

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    #[default]
    Sensor,
    Timer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub message: String,
    pub timestamp: String,
    #[serde(rename = "type", default)]
    pub kind: NotificationKind,
    #[serde(default)]
    pub read: bool,
}

// ---------------------------------------------------------------------------
// Threshold sweep (pure)
// ---------------------------------------------------------------------------

/// Evaluate one snapshot against the alert thresholds.  Humidity and pH
/// bounds are fixed; the temperature threshold is user-configurable.
pub fn threshold_messages(snap: &SensorSnapshot, temperature_threshold: f64) -> Vec<String> {
    let mut messages = Vec::new();

    if snap.temperature > temperature_threshold {
        messages.push(format!(
            "Nhiệt độ cao: {}°C (Vượt ngưỡng {}°C)",
            snap.temperature, temperature_threshold
        ));
    }
    if snap.humidity < 60.0 {
        messages.push(format!(
            "Độ ẩm thấp: {}% (Dưới ngưỡng 60%)",
            snap.humidity
        ));
    }
    if snap.ph < 5.5 || snap.ph > 7.5 {
        messages.push(format!(
            "pH không phù hợp: {} (Ngoài khoảng 5.5-7.5)",
            snap.ph
        ));
    }

    messages
}

pub fn now_epoch_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Wall-clock label in local (Vietnam) time for the notification list.
fn time_label(at: OffsetDateTime) -> String {
    let fmt = format_description!("[hour]:[minute]:[second]");
    at.to_offset(VN_UTC_OFFSET).format(&fmt).unwrap_or_default()
}

fn now_label() -> String {
    time_label(OffsetDateTime::now_utc())
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Owns the in-memory notification list and keeps the store in sync after
/// every mutation.
pub struct Notifier {
    store: Store,
    records: Vec<NotificationRecord>,
    count: usize,
    cooldown_ms: i64,
}

impl Notifier {
    /// Reload persisted notifications; a corrupt blob resets the list
    /// rather than failing startup.
    pub async fn load(store: Store, cooldown: Duration) -> Result<Self> {
        let records: Vec<NotificationRecord> = store
            .get_json(KEY_NOTIFICATIONS)
            .await
            .unwrap_or_default()
            .unwrap_or_default();
        let count = store
            .get(KEY_NOTIFICATION_COUNT)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(records.len());

        Ok(Self {
            store,
            records,
            count,
            cooldown_ms: cooldown.as_millis() as i64,
        })
    }

    pub fn records(&self) -> &[NotificationRecord] {
        &self.records
    }

    pub fn unread_count(&self) -> usize {
        self.records.iter().filter(|n| !n.read).count()
    }

    /// Run a threshold sweep for an accepted snapshot.  Returns the newly
    /// appended records (empty while the cooldown is active or when every
    /// message is a duplicate).
    pub async fn check_sensor(
        &mut self,
        snap: &SensorSnapshot,
        now_ms: i64,
    ) -> Result<Vec<NotificationRecord>> {
        if let Some(last) = self.store.last_alert_time().await? {
            let since = now_ms - last;
            if since < self.cooldown_ms {
                debug!(remaining_ms = self.cooldown_ms - since, "alert cooldown active, skipping sweep");
                return Ok(Vec::new());
            }
        }

        let threshold = self.store.temperature_threshold().await?;
        let messages = threshold_messages(snap, threshold);

        // The cooldown clock restarts whenever the sweep fires, duplicates
        // included, matching the page behaviour.
        if !messages.is_empty() {
            self.store.set_last_alert_time(now_ms).await?;
        }

        let mut appended = Vec::new();
        for message in messages {
            if let Some(rec) = self.push(message, NotificationKind::Sensor) {
                appended.push(rec);
            }
        }
        if !appended.is_empty() {
            self.persist().await?;
        }
        Ok(appended)
    }

    /// Timer-event notifications bypass the cooldown entirely.
    pub async fn push_timer(&mut self, message: String) -> Result<Option<NotificationRecord>> {
        let rec = self.push(message, NotificationKind::Timer);
        if rec.is_some() {
            self.persist().await?;
        }
        Ok(rec)
    }

    /// Persist a new temperature threshold; the next sweep picks it up.
    pub async fn set_temperature_threshold(&self, threshold: f64) -> Result<()> {
        self.store.set_temperature_threshold(threshold).await
    }

    pub async fn mark_all_read(&mut self) -> Result<()> {
        for rec in &mut self.records {
            rec.read = true;
        }
        self.persist().await
    }

    fn is_duplicate(&self, message: &str) -> bool {
        self.records.iter().any(|n| n.message == message)
    }

    fn push(&mut self, message: String, kind: NotificationKind) -> Option<NotificationRecord> {
        if self.is_duplicate(&message) {
            return None;
        }
        let rec = NotificationRecord {
            message,
            timestamp: now_label(),
            kind,
            read: false,
        };
        self.records.push(rec.clone());
        if self.records.len() > MAX_NOTIFICATIONS {
            let excess = self.records.len() - MAX_NOTIFICATIONS;
            self.records.drain(..excess);
        }
        self.count = (self.count + 1).min(MAX_NOTIFICATIONS);
        Some(rec)
    }

    async fn persist(&self) -> Result<()> {
        self.store.put_json(KEY_NOTIFICATIONS, &self.records).await?;
        self.store
            .put(KEY_NOTIFICATION_COUNT, &self.count.to_string())
            .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
