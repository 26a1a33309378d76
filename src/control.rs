//! Device control correlator: on/off commands over the broker, timer
//! set/clear over HTTP, and reconciliation of local state against
//! broker-confirmed status.
//!
//! Local device state is never flipped optimistically — a command is
//! published and the `iot/device/status/{device}` echo is what mutates the
//! session (see `broker::handle_status_publish`).

use anyhow::Result;
use rumqttc::AsyncClient;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::alert::Notifier;
use crate::api::ApiClient;
use crate::broker;
use crate::conn::ConnState;
use crate::state::{Device, SharedState, TimerWindow, VN_UTC_OFFSET};
use crate::ui::{TimerRequest, UiEvent, UiSender};

/// Grace period after the user leaves a timer input before server-driven
/// refreshes may touch that device's timer display again.
pub const EDIT_GRACE: Duration = Duration::from_secs(2);

/// How long after a successful set-timer before the confirming re-read.
pub const RECONCILE_DELAY: Duration = Duration::from_secs(1);

/// Timer poll cadence (also the broker liveness fallback).
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Edit guard
// ---------------------------------------------------------------------------

/// Tracks whether a device's timer inputs are being edited.  While editing,
/// and for [`EDIT_GRACE`] after the last blur, server refreshes for that
/// device are suppressed so they cannot overwrite in-progress input.
#[derive(Debug, Default)]
pub struct EditGuard {
    editing: bool,
    grace_until: Option<Instant>,
}

impl EditGuard {
    pub fn begin(&mut self) {
        self.editing = true;
        self.grace_until = None;
    }

    pub fn end(&mut self, now: Instant) {
        self.editing = false;
        self.grace_until = Some(now + EDIT_GRACE);
    }

    pub fn suppressed(&self, now: Instant) -> bool {
        self.editing || self.grace_until.is_some_and(|until| now < until)
    }
}

// ---------------------------------------------------------------------------
// Timer input validation
// ---------------------------------------------------------------------------

fn parse_local(date: &str, time: &str) -> Option<PrimitiveDateTime> {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]");
    PrimitiveDateTime::parse(&format!("{date} {time}"), &fmt).ok()
}

/// Validate raw timer form input against the current wall clock.  Error
/// strings are user-facing.
pub fn validate_timer(req: &TimerRequest, now: PrimitiveDateTime) -> Result<(), String> {
    if req.on_time.is_empty() || req.off_time.is_empty() {
        return Err("Vui lòng nhập đầy đủ thời gian bật và tắt".into());
    }

    let on = parse_local(&req.on_date, &req.on_time)
        .ok_or_else(|| "Thời gian bật không hợp lệ".to_string())?;
    let off = parse_local(&req.off_date, &req.off_time)
        .ok_or_else(|| "Thời gian tắt không hợp lệ".to_string())?;

    if on < now {
        return Err("Không thể chọn thời gian bật trong quá khứ".into());
    }
    if off < now {
        return Err("Không thể chọn thời gian tắt trong quá khứ".into());
    }
    if req.off_date < req.on_date {
        return Err("Ngày tắt phải bằng hoặc sau ngày bật".into());
    }
    if req.on_date == req.off_date && req.on_time >= req.off_time {
        return Err("Nếu cùng ngày, thời gian tắt phải sau thời gian bật".into());
    }
    Ok(())
}

fn now_vn() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc().to_offset(VN_UTC_OFFSET);
    PrimitiveDateTime::new(now.date(), now.time())
}

/// Roll a daily timer forward a whole number of days until its off time is
/// in the future again.
pub fn roll_daily(timer: &TimerWindow, now: OffsetDateTime) -> TimerWindow {
    let mut rolled = timer.clone();
    while rolled.off_datetime < now {
        rolled.on_datetime += time::Duration::days(1);
        rolled.off_datetime += time::Duration::days(1);
    }
    rolled
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Controller {
    api: ApiClient,
    mqtt: AsyncClient,
    state: SharedState,
    ui: UiSender,
    notifier: Arc<Mutex<Notifier>>,
    guards: Arc<Mutex<HashMap<Device, EditGuard>>>,
}

impl Controller {
    pub fn new(
        api: ApiClient,
        mqtt: AsyncClient,
        state: SharedState,
        ui: UiSender,
        notifier: Arc<Mutex<Notifier>>,
    ) -> Self {
        Self {
            api,
            mqtt,
            state,
            ui,
            notifier,
            guards: Arc::new(Mutex::new(
                Device::ALL.iter().map(|d| (*d, EditGuard::default())).collect(),
            )),
        }
    }

    // ----------------------------
    // On/off commands
    // ----------------------------

    /// Publish an on/off command.  Returns whether anything was published:
    /// with the broker not open the command is blocked outright (alert, no
    /// retry) rather than queued.
    pub async fn control_device(&self, device: Device, status: bool) -> Result<bool> {
        if self.state.read().await.broker_state != ConnState::Open {
            warn!(%device, "control blocked: broker not connected");
            self.ui
                .notice("Không thể kết nối đến MQTT broker. Vui lòng thử lại sau.");
            return Ok(false);
        }

        info!(%device, status, "publishing control command");
        broker::publish_control(&self.mqtt, device, status).await?;
        // No optimistic flip: the status topic echo updates the session.
        Ok(true)
    }

    pub async fn request_status(&self, device: Device) -> Result<bool> {
        if self.state.read().await.broker_state != ConnState::Open {
            return Ok(false);
        }
        self.mqtt
            .publish(
                broker::status_request_topic(device),
                rumqttc::QoS::AtLeastOnce,
                false,
                broker::status_request_payload(),
            )
            .await?;
        Ok(true)
    }

    // ----------------------------
    // Edit guard
    // ----------------------------

    pub async fn begin_edit(&self, device: Device) {
        self.guards.lock().await.entry(device).or_default().begin();
        debug!(%device, "timer refreshes locked (user editing)");
    }

    pub async fn end_edit(&self, device: Device) {
        self.guards
            .lock()
            .await
            .entry(device)
            .or_default()
            .end(Instant::now());
    }

    async fn refresh_suppressed(&self, device: Device) -> bool {
        self.guards
            .lock()
            .await
            .get(&device)
            .is_some_and(|g| g.suppressed(Instant::now()))
    }

    // ----------------------------
    // Timers
    // ----------------------------

    /// Validate and submit a timer, then schedule the confirming re-read.
    /// Failures surface as notices; nothing retries automatically.
    pub async fn set_timer(&self, device: Device, req: TimerRequest) -> Result<()> {
        if let Err(msg) = validate_timer(&req, now_vn()) {
            self.ui.notice(msg);
            return Ok(());
        }

        if let Err(e) = self.api.set_timer(device, &req).await {
            warn!(%device, "set-timer failed: {e:#}");
            self.ui.notice("Lỗi kết nối đến server");
            return Ok(());
        }

        let name = device.name_vi();
        self.ui
            .notice(format!("Đã cài đặt hẹn giờ cho {name} thành công"));
        let message = format!(
            "Hẹn giờ {name} BẬT lúc {} {}, TẮT lúc {} {}",
            req.on_time, req.on_date, req.off_time, req.off_date
        );
        if let Some(rec) = self.notifier.lock().await.push_timer(message).await? {
            self.ui.send(UiEvent::Notification(rec));
        }

        // The server may serve a stale read straight after the write;
        // reconcile the displayed window against a delayed re-fetch.
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RECONCILE_DELAY).await;
            if let Err(e) = this.refresh_timer(device, true).await {
                warn!(%device, "post-set reconcile failed: {e:#}");
            }
        });

        Ok(())
    }

    pub async fn clear_timer(&self, device: Device) -> Result<()> {
        if let Err(e) = self.api.clear_timer(device).await {
            warn!(%device, "clear-timer failed: {e:#}");
            self.ui.notice("Lỗi kết nối đến server");
            return Ok(());
        }

        self.apply_timer(device, None).await;
        self.ui.notice("Đã xóa hẹn giờ thành công");
        Ok(())
    }

    /// Fetch the server's timer for one device and reconcile local state.
    /// `force` bypasses the edit guard (startup load, post-set reconcile).
    pub async fn refresh_timer(&self, device: Device, force: bool) -> Result<()> {
        if !force && self.refresh_suppressed(device).await {
            debug!(%device, "skipping timer refresh: user editing");
            return Ok(());
        }

        let timer = self.api.get_timer(device).await?;
        let now = OffsetDateTime::now_utc();

        let next = match timer {
            Some(t) if t.enabled => {
                let expired = t.off_datetime < now;
                match (expired, t.daily) {
                    (true, false) => None,
                    (true, true) => Some(roll_daily(&t, now)),
                    _ => Some(t),
                }
            }
            _ => None,
        };

        self.apply_timer(device, next).await;
        Ok(())
    }

    /// Store the window locally and notify the updaters if it changed.
    async fn apply_timer(&self, device: Device, timer: Option<TimerWindow>) {
        let changed = {
            let mut st = self.state.write().await;
            let slot = &mut st.device_mut(device).timer;
            if *slot == timer {
                false
            } else {
                *slot = timer.clone();
                true
            }
        };
        if changed {
            self.ui.send(UiEvent::TimerChanged { device, timer });
        }
    }

    /// Startup: seed every device's timer from the server (edit guard
    /// bypassed, per-device failures logged and skipped).
    pub async fn load_timers(&self) {
        for device in Device::ALL {
            if let Err(e) = self.refresh_timer(device, true).await {
                warn!(%device, "initial timer load failed: {e:#}");
            }
        }
    }

    /// One poll tick: refresh every non-suppressed device.
    pub async fn poll_timers_once(&self) {
        for device in Device::ALL {
            if let Err(e) = self.refresh_timer(device, false).await {
                warn!(%device, "timer poll failed: {e:#}");
            }
        }
    }
}

/// Periodic poll: reconcile timers and nudge the transports back up if
/// either is not open — the deliberate redundancy that recovers from
/// failures the close handlers never saw.
pub async fn poll_loop(
    controller: Controller,
    state: SharedState,
    feed_wake: Arc<Notify>,
    broker_wake: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let (feed_open, broker_open) = {
            let st = state.read().await;
            (
                st.feed_state == ConnState::Open,
                st.broker_state == ConnState::Open,
            )
        };
        if !feed_open {
            feed_wake.notify_waiters();
        }
        if !broker_open {
            debug!("broker not open, skipping timer poll");
            broker_wake.notify_waiters();
            continue;
        }

        controller.poll_timers_once().await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::ALERT_COOLDOWN;
    use crate::conn::ConnState;
    use crate::state::SessionState;
    use crate::store::Store;
    use time::macros::datetime;

    fn req(on: (&str, &str), off: (&str, &str), daily: bool) -> TimerRequest {
        TimerRequest {
            on_date: on.0.into(),
            on_time: on.1.into(),
            off_date: off.0.into(),
            off_time: off.1.into(),
            daily,
        }
    }

    const NOW: PrimitiveDateTime = datetime!(2025-06-01 12:00);

    // -- validate_timer ------------------------------------------------------

    #[test]
    fn valid_same_day_window() {
        let r = req(("2025-06-01", "13:00"), ("2025-06-01", "14:00"), false);
        assert_eq!(validate_timer(&r, NOW), Ok(()));
    }

    #[test]
    fn valid_cross_day_window() {
        let r = req(("2025-06-01", "22:00"), ("2025-06-02", "06:00"), true);
        assert_eq!(validate_timer(&r, NOW), Ok(()));
    }

    #[test]
    fn missing_times_rejected() {
        let r = req(("2025-06-01", ""), ("2025-06-01", "14:00"), false);
        assert_eq!(
            validate_timer(&r, NOW),
            Err("Vui lòng nhập đầy đủ thời gian bật và tắt".into())
        );
    }

    #[test]
    fn on_time_in_past_rejected() {
        let r = req(("2025-06-01", "11:00"), ("2025-06-01", "14:00"), false);
        assert_eq!(
            validate_timer(&r, NOW),
            Err("Không thể chọn thời gian bật trong quá khứ".into())
        );
    }

    #[test]
    fn off_before_on_same_day_rejected() {
        // Both times are still ahead of the clock; ordering is the problem.
        let r = req(("2025-06-01", "15:00"), ("2025-06-01", "13:00"), false);
        assert_eq!(
            validate_timer(&r, NOW),
            Err("Nếu cùng ngày, thời gian tắt phải sau thời gian bật".into())
        );
    }

    #[test]
    fn off_time_in_past_rejected() {
        // On-time is fine, but the off-time is already behind the clock.
        let r = req(("2025-06-01", "13:00"), ("2025-06-01", "11:00"), false);
        assert_eq!(
            validate_timer(&r, NOW),
            Err("Không thể chọn thời gian tắt trong quá khứ".into())
        );
    }

    #[test]
    fn same_day_equal_times_rejected() {
        let r = req(("2025-06-01", "13:00"), ("2025-06-01", "13:00"), false);
        assert_eq!(
            validate_timer(&r, NOW),
            Err("Nếu cùng ngày, thời gian tắt phải sau thời gian bật".into())
        );
    }

    #[test]
    fn off_date_before_on_date_rejected() {
        let r = req(("2025-06-03", "13:00"), ("2025-06-02", "14:00"), false);
        assert_eq!(
            validate_timer(&r, NOW),
            Err("Ngày tắt phải bằng hoặc sau ngày bật".into())
        );
    }

    #[test]
    fn garbage_date_rejected() {
        let r = req(("junk", "13:00"), ("2025-06-01", "14:00"), false);
        assert_eq!(
            validate_timer(&r, NOW),
            Err("Thời gian bật không hợp lệ".into())
        );
    }

    // -- edit guard ----------------------------------------------------------

    #[test]
    fn guard_suppresses_while_editing() {
        let mut g = EditGuard::default();
        assert!(!g.suppressed(Instant::now()));
        g.begin();
        assert!(g.suppressed(Instant::now()));
    }

    #[test]
    fn guard_holds_through_grace_period_then_releases() {
        let mut g = EditGuard::default();
        let t0 = Instant::now();
        g.begin();
        g.end(t0);
        // Inside the grace window.
        assert!(g.suppressed(t0 + Duration::from_millis(500)));
        // Past it.
        assert!(!g.suppressed(t0 + EDIT_GRACE + Duration::from_millis(1)));
    }

    #[test]
    fn refocus_during_grace_relocks() {
        let mut g = EditGuard::default();
        let t0 = Instant::now();
        g.begin();
        g.end(t0);
        g.begin(); // user clicked back in
        assert!(g.suppressed(t0 + EDIT_GRACE + Duration::from_secs(60)));
    }

    // -- roll_daily ----------------------------------------------------------

    #[test]
    fn roll_daily_moves_expired_window_forward() {
        let timer = TimerWindow {
            on_datetime: datetime!(2025-06-01 06:00 +7),
            off_datetime: datetime!(2025-06-01 18:00 +7),
            daily: true,
            enabled: true,
        };
        let now = datetime!(2025-06-01 19:00 +7);
        let rolled = roll_daily(&timer, now);
        assert_eq!(rolled.on_datetime, datetime!(2025-06-02 06:00 +7));
        assert_eq!(rolled.off_datetime, datetime!(2025-06-02 18:00 +7));
    }

    #[test]
    fn roll_daily_catches_up_over_multiple_days() {
        let timer = TimerWindow {
            on_datetime: datetime!(2025-06-01 06:00 +7),
            off_datetime: datetime!(2025-06-01 18:00 +7),
            daily: true,
            enabled: true,
        };
        let now = datetime!(2025-06-05 00:00 +7);
        let rolled = roll_daily(&timer, now);
        assert_eq!(rolled.off_datetime, datetime!(2025-06-05 18:00 +7));
    }

    #[test]
    fn roll_daily_leaves_live_window_alone() {
        let timer = TimerWindow {
            on_datetime: datetime!(2025-06-01 06:00 +7),
            off_datetime: datetime!(2025-06-01 18:00 +7),
            daily: true,
            enabled: true,
        };
        let now = datetime!(2025-06-01 12:00 +7);
        assert_eq!(roll_daily(&timer, now), timer);
    }

    // -- control_device gating -----------------------------------------------

    async fn test_controller(state: SharedState) -> (Controller, tokio::sync::mpsc::UnboundedReceiver<UiEvent>, rumqttc::EventLoop) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let notifier = Arc::new(Mutex::new(
            Notifier::load(store, ALERT_COOLDOWN).await.unwrap(),
        ));
        let (ui, rx) = UiSender::channel();
        // Event loop must stay alive so the client channel remains open.
        let opts = rumqttc::MqttOptions::new("test-ctrl", "127.0.0.1", 1883);
        let (mqtt, el) = AsyncClient::new(opts, 10);
        let api = ApiClient::new("http://127.0.0.1:1");
        (Controller::new(api, mqtt, state, ui, notifier), rx, el)
    }

    #[tokio::test]
    async fn control_blocked_when_broker_not_open() {
        let state = SessionState::shared();
        let (ctrl, mut rx, _el) = test_controller(state.clone()).await;

        // broker_state defaults to Connecting.
        let published = ctrl.control_device(Device::Pump, true).await.unwrap();
        assert!(!published);
        assert!(matches!(rx.try_recv().unwrap(), UiEvent::Notice(_)));
        // No optimistic flip either.
        assert!(!state.read().await.device(Device::Pump).status);
    }

    #[tokio::test]
    async fn control_publishes_when_broker_open() {
        let state = SessionState::shared();
        state.write().await.broker_state = ConnState::Open;
        let (ctrl, mut rx, _el) = test_controller(state.clone()).await;

        let published = ctrl.control_device(Device::Pump, true).await.unwrap();
        assert!(published);
        // Still no local flip: only the status echo mutates the session.
        assert!(!state.read().await.device(Device::Pump).status);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_timer_surfaces_notice_without_http_call() {
        let state = SessionState::shared();
        let (ctrl, mut rx, _el) = test_controller(state).await;

        let r = req(("2025-06-01", ""), ("2025-06-01", "14:00"), false);
        ctrl.set_timer(Device::Fan, r).await.unwrap();

        match rx.try_recv().unwrap() {
            UiEvent::Notice(msg) => {
                assert_eq!(msg, "Vui lòng nhập đầy đủ thời gian bật và tắt")
            }
            other => panic!("expected notice, got {other:?}"),
        }
    }
}
