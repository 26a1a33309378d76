//! Routes decoded feed envelopes to the display updaters, applying the
//! sensor de-duplication rule and the history-filter deferral.

use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::alert::{now_epoch_ms, Notifier};
use crate::state::{DailyForecast, HistoryRow, SensorSnapshot, SharedState};
use crate::ui::{UiEvent, UiSender};

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// One JSON envelope pushed over `/ws`.  Every field is optional; the
/// server sends whichever sections changed.
#[derive(Debug, Default, Deserialize)]
pub struct Envelope {
    pub latest: Option<SensorSnapshot>,
    pub history: Option<Vec<HistoryRow>>,
    pub forecast_5days: Option<Vec<DailyForecast>>,
}

impl Envelope {
    pub fn decode(raw: &str) -> Result<Envelope, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    state: SharedState,
    ui: UiSender,
    notifier: Arc<Mutex<Notifier>>,
}

impl Dispatcher {
    pub fn new(state: SharedState, ui: UiSender, notifier: Arc<Mutex<Notifier>>) -> Self {
        Self {
            state,
            ui,
            notifier,
        }
    }

    pub async fn handle(&mut self, env: Envelope) -> Result<()> {
        self.handle_at(env, now_epoch_ms()).await
    }

    /// Same as [`handle`](Self::handle) with an injected clock.
    pub async fn handle_at(&mut self, env: Envelope, now_ms: i64) -> Result<()> {
        if let Some(latest) = env.latest {
            self.handle_sensor(latest, now_ms).await?;
        }

        if let Some(rows) = env.history {
            let mut st = self.state.write().await;
            if st.history_filtered {
                // User is looking at a filtered slice; park the update
                // (newest wins) until the filter clears.
                st.deferred_history = Some(rows);
            } else {
                drop(st);
                self.ui.send(UiEvent::History(rows));
            }
        }

        if let Some(forecast) = env.forecast_5days {
            // Forecasts are independent of sensor/history state.
            self.ui.send(UiEvent::Forecast(forecast));
        }

        Ok(())
    }

    async fn handle_sensor(&mut self, latest: SensorSnapshot, now_ms: i64) -> Result<()> {
        {
            let st = self.state.read().await;
            if let Some(prev) = &st.last_snapshot {
                if prev.approx_eq(&latest) {
                    // Identical within tolerance: no UI write, no alert check.
                    debug!("duplicate sensor snapshot dropped");
                    return Ok(());
                }
            }
        }

        self.state.write().await.last_snapshot = Some(latest.clone());
        self.ui.send(UiEvent::Sensor(latest.clone()));

        let appended = self.notifier.lock().await.check_sensor(&latest, now_ms).await?;
        for rec in appended {
            self.ui.send(UiEvent::Notification(rec));
        }
        Ok(())
    }

    /// Toggle the user history filter.  Clearing it flushes any deferred
    /// history payload.
    pub async fn set_history_filter(&mut self, active: bool) {
        let deferred = {
            let mut st = self.state.write().await;
            st.history_filtered = active;
            if active {
                None
            } else {
                st.deferred_history.take()
            }
        };
        if let Some(rows) = deferred {
            self.ui.send(UiEvent::History(rows));
        }
    }

    /// Fallback alert tick: re-run the threshold sweep against the last
    /// accepted snapshot.  The cooldown inside the notifier still applies.
    pub async fn recheck_alerts(&mut self) -> Result<()> {
        let snap = self.state.read().await.last_snapshot.clone();
        if let Some(snap) = snap {
            let appended = self
                .notifier
                .lock()
                .await
                .check_sensor(&snap, now_epoch_ms())
                .await?;
            for rec in appended {
                self.ui.send(UiEvent::Notification(rec));
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::ALERT_COOLDOWN;
    use crate::state::SessionState;
    use crate::store::Store;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn test_dispatcher() -> (Dispatcher, UnboundedReceiver<UiEvent>) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let notifier = Arc::new(Mutex::new(
            Notifier::load(store, ALERT_COOLDOWN).await.unwrap(),
        ));
        let (ui, rx) = UiSender::channel();
        (Dispatcher::new(SessionState::shared(), ui, notifier), rx)
    }

    fn snap(temp: f64) -> SensorSnapshot {
        SensorSnapshot {
            temperature: temp,
            humidity: 65.0,
            ph: 6.5,
            ..SensorSnapshot::default()
        }
    }

    fn latest(temp: f64) -> Envelope {
        Envelope {
            latest: Some(snap(temp)),
            ..Envelope::default()
        }
    }

    fn history_rows(n: usize) -> Vec<HistoryRow> {
        (0..n)
            .map(|i| HistoryRow {
                timestamp: format!("2025-06-01T12:0{i}:00"),
                temperature: Some(25.0),
                humidity: Some(70.0),
                rainfall: None,
                nitrogen: None,
                phosphorus: None,
                potassium: None,
                ph: Some(6.5),
            })
            .collect()
    }

    // -- envelope decoding ---------------------------------------------------

    #[test]
    fn decode_full_envelope() {
        let raw = r#"{
            "latest": {"temperature": 25.0, "humidity": 70.0, "ph": 6.5},
            "history": [{"timestamp": "2025-06-01T12:00:00"}],
            "forecast_5days": [
                {"date": "2025-06-01", "temperature": 30.1, "humidity": 80.0, "rainfall": 2.5}
            ]
        }"#;
        let env = Envelope::decode(raw).unwrap();
        assert!(env.latest.is_some());
        assert_eq!(env.history.unwrap().len(), 1);
        assert_eq!(env.forecast_5days.unwrap().len(), 1);
    }

    #[test]
    fn decode_empty_envelope() {
        let env = Envelope::decode("{}").unwrap();
        assert!(env.latest.is_none());
        assert!(env.history.is_none());
    }

    #[test]
    fn decode_malformed_payload_errors() {
        assert!(Envelope::decode("{latest").is_err());
        assert!(Envelope::decode(r#"{"latest": 42}"#).is_err());
    }

    // -- sensor dedup ---------------------------------------------------------

    #[tokio::test]
    async fn first_snapshot_is_forwarded() {
        let (mut d, mut rx) = test_dispatcher().await;
        d.handle_at(latest(25.0), 1_000).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), UiEvent::Sensor(_)));
    }

    #[tokio::test]
    async fn near_equal_snapshot_dropped_without_alert_check() {
        let (mut d, mut rx) = test_dispatcher().await;
        // Accepted, in range (threshold 26.0): no alert, no cooldown started.
        d.handle_at(latest(25.95), 1_000).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), UiEvent::Sensor(_)));

        // Within 0.1 of the last snapshot but above the alert threshold.
        // Were the alert check run, it would append a notification.
        d.handle_at(latest(26.04), 2_000).await.unwrap();
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn changed_snapshot_replaces_wholesale_and_alerts() {
        let (mut d, mut rx) = test_dispatcher().await;
        d.handle_at(latest(25.0), 1_000).await.unwrap();
        let _ = rx.try_recv();

        d.handle_at(latest(27.0), 200_000).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), UiEvent::Sensor(s) if s.temperature == 27.0));
        match rx.try_recv().unwrap() {
            UiEvent::Notification(rec) => {
                assert_eq!(rec.message, "Nhiệt độ cao: 27°C (Vượt ngưỡng 26°C)");
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    // -- history filter deferral ----------------------------------------------

    #[tokio::test]
    async fn history_forwarded_when_unfiltered() {
        let (mut d, mut rx) = test_dispatcher().await;
        let env = Envelope {
            history: Some(history_rows(3)),
            ..Envelope::default()
        };
        d.handle_at(env, 1_000).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), UiEvent::History(rows) if rows.len() == 3));
    }

    #[tokio::test]
    async fn history_deferred_while_filtered_then_flushed() {
        let (mut d, mut rx) = test_dispatcher().await;
        d.set_history_filter(true).await;

        let env = Envelope {
            history: Some(history_rows(2)),
            ..Envelope::default()
        };
        d.handle_at(env, 1_000).await.unwrap();
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);

        d.set_history_filter(false).await;
        assert!(matches!(rx.try_recv().unwrap(), UiEvent::History(rows) if rows.len() == 2));
    }

    #[tokio::test]
    async fn deferred_history_newest_wins() {
        let (mut d, mut rx) = test_dispatcher().await;
        d.set_history_filter(true).await;

        for n in [2usize, 5] {
            let env = Envelope {
                history: Some(history_rows(n)),
                ..Envelope::default()
            };
            d.handle_at(env, 1_000).await.unwrap();
        }

        d.set_history_filter(false).await;
        assert!(matches!(rx.try_recv().unwrap(), UiEvent::History(rows) if rows.len() == 5));
    }

    // -- forecast ----------------------------------------------------------------

    #[tokio::test]
    async fn forecast_applied_even_while_history_filtered() {
        let (mut d, mut rx) = test_dispatcher().await;
        d.set_history_filter(true).await;

        let env = Envelope {
            forecast_5days: Some(vec![DailyForecast {
                date: "2025-06-01".into(),
                temperature: 31.0,
                humidity: 75.0,
                rainfall: 0.0,
                description: String::new(),
                icon: String::new(),
            }]),
            ..Envelope::default()
        };
        d.handle_at(env, 1_000).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), UiEvent::Forecast(_)));
    }
}
