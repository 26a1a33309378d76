//! HTTP client for the dashboard backend.  Every call site catches its own
//! failure and degrades to an inline error; nothing here retries.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::state::{Device, SensorSnapshot, TimerWindow};
use crate::ui::TimerRequest;

// ---------------------------------------------------------------------------
// Response / request types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub success: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct TimerResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    timer: Option<TimerWindow>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Body of `POST /api/set-timer` — the server expects the form field names.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetTimerBody<'a> {
    device: &'a str,
    on_date: &'a str,
    on_time: &'a str,
    off_date: &'a str,
    off_time: &'a str,
    daily: bool,
}

#[derive(Debug, Serialize)]
struct ClearTimerBody<'a> {
    device: &'a str,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `GET /api/mqtt-config` — broker coordinates and credentials.
    pub async fn mqtt_config(&self) -> Result<MqttConfig> {
        let cfg: MqttConfig = self
            .http
            .get(format!("{}/api/mqtt-config", self.base))
            .send()
            .await
            .context("mqtt-config request failed")?
            .json()
            .await
            .context("mqtt-config response was not valid json")?;
        if !cfg.success {
            bail!("server refused to hand out the mqtt config");
        }
        Ok(cfg)
    }

    /// `GET /api/get-timer/{device}` — `None` when no timer is set.
    pub async fn get_timer(&self, device: Device) -> Result<Option<TimerWindow>> {
        let resp: TimerResponse = self
            .http
            .get(format!("{}/api/get-timer/{}", self.base, device))
            .send()
            .await
            .with_context(|| format!("get-timer request failed for {device}"))?
            .json()
            .await
            .with_context(|| format!("get-timer response invalid for {device}"))?;
        if !resp.success {
            bail!(
                "get-timer failed for {device}: {}",
                resp.message.unwrap_or_else(|| "unknown error".into())
            );
        }
        Ok(resp.timer)
    }

    /// `POST /api/set-timer` — synchronous request/response, no broker.
    pub async fn set_timer(&self, device: Device, req: &TimerRequest) -> Result<()> {
        let body = SetTimerBody {
            device: device.as_str(),
            on_date: &req.on_date,
            on_time: &req.on_time,
            off_date: &req.off_date,
            off_time: &req.off_time,
            daily: req.daily,
        };
        let resp: AckResponse = self
            .http
            .post(format!("{}/api/set-timer", self.base))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("set-timer request failed for {device}"))?
            .json()
            .await
            .with_context(|| format!("set-timer response invalid for {device}"))?;
        if !resp.success {
            bail!(
                "set-timer rejected for {device}: {}",
                resp.message.unwrap_or_else(|| "Cài đặt hẹn giờ thất bại".into())
            );
        }
        Ok(())
    }

    /// `POST /api/clear-timer`.
    pub async fn clear_timer(&self, device: Device) -> Result<()> {
        let resp: AckResponse = self
            .http
            .post(format!("{}/api/clear-timer", self.base))
            .json(&ClearTimerBody {
                device: device.as_str(),
            })
            .send()
            .await
            .with_context(|| format!("clear-timer request failed for {device}"))?
            .json()
            .await
            .with_context(|| format!("clear-timer response invalid for {device}"))?;
        if !resp.success {
            bail!(
                "clear-timer rejected for {device}: {}",
                resp.message.unwrap_or_else(|| "Xóa hẹn giờ thất bại".into())
            );
        }
        Ok(())
    }

    /// `GET /latest-data` — on-demand snapshot outside the push feed.
    pub async fn latest_data(&self) -> Result<SensorSnapshot> {
        self.http
            .get(format!("{}/latest-data", self.base))
            .send()
            .await
            .context("latest-data request failed")?
            .json()
            .await
            .context("latest-data response invalid")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
