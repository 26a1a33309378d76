//! TOML config file loading and validation.
//!
//! Everything has a default, so a missing file or an empty file still
//! yields a usable config pointing at localhost.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::alert::ALERT_COOLDOWN;
use crate::conn::{Reconnect, RetryPolicy};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// WebSocket live feed.
#[derive(Debug, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_url")]
    pub url: String,
    /// Fixed delay between reconnect attempts, in seconds.
    #[serde(default = "default_retry_delay_sec")]
    pub retry_delay_sec: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Periodic wake cadence, in seconds: any transport not currently open
    /// gets a fresh attempt, independent of its backoff timer.
    #[serde(default = "default_wake_interval_sec")]
    pub wake_interval_sec: u64,
}

/// Fallback broker coordinates, used when `GET /api/mqtt-config` fails.
#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// First reconnect delay; doubles on each failure.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct AlertConfig {
    /// Minimum gap between threshold alert batches, in seconds.
    #[serde(default = "default_cooldown_sec")]
    pub cooldown_sec: u64,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_feed_url() -> String {
    "ws://localhost:8000/ws".into()
}

fn default_retry_delay_sec() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    5
}

fn default_wake_interval_sec() -> u64 {
    30
}

fn default_broker_host() -> String {
    "localhost".into()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_api_base_url() -> String {
    "http://localhost:8000".into()
}

fn default_cooldown_sec() -> u64 {
    ALERT_COOLDOWN.as_secs()
}

fn default_database_url() -> String {
    "sqlite:farmfeed.db?mode=rwc".into()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            retry_delay_sec: default_retry_delay_sec(),
            max_attempts: default_max_attempts(),
            wake_interval_sec: default_wake_interval_sec(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            username: String::new(),
            password: String::new(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_sec: default_cooldown_sec(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if !self.feed.url.starts_with("ws://") && !self.feed.url.starts_with("wss://") {
            errors.push(format!(
                "feed.url '{}' must start with ws:// or wss://",
                self.feed.url
            ));
        }
        if self.feed.retry_delay_sec == 0 {
            errors.push("feed.retry_delay_sec must be positive".into());
        }
        if self.feed.max_attempts == 0 {
            errors.push("feed.max_attempts must be positive".into());
        }
        if self.feed.wake_interval_sec == 0 {
            errors.push("feed.wake_interval_sec must be positive".into());
        }

        if self.broker.host.trim().is_empty() {
            errors.push("broker.host is empty".into());
        }
        if self.broker.port == 0 {
            errors.push("broker.port must be positive".into());
        }
        if self.broker.backoff_base_ms == 0 {
            errors.push("broker.backoff_base_ms must be positive".into());
        }
        if self.broker.backoff_cap_ms < self.broker.backoff_base_ms {
            errors.push(format!(
                "broker.backoff_cap_ms ({}) is less than backoff_base_ms ({})",
                self.broker.backoff_cap_ms, self.broker.backoff_base_ms
            ));
        }
        if self.broker.max_attempts == 0 {
            errors.push("broker.max_attempts must be positive".into());
        }

        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            errors.push(format!(
                "api.base_url '{}' must start with http:// or https://",
                self.api.base_url
            ));
        }

        if self.alert.cooldown_sec == 0 {
            errors.push("alert.cooldown_sec must be positive".into());
        }

        if self.store.database_url.trim().is_empty() {
            errors.push("store.database_url is empty".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

impl FeedConfig {
    /// Fresh reconnect state machine for the feed: fixed delay, bounded
    /// attempts.
    pub fn reconnect(&self) -> Reconnect {
        Reconnect::new(
            RetryPolicy::Fixed {
                delay: Duration::from_secs(self.retry_delay_sec),
            },
            self.max_attempts,
        )
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_secs(self.wake_interval_sec)
    }
}

impl BrokerConfig {
    /// Fresh reconnect state machine for the broker: doubling backoff with
    /// a cap, bounded attempts.
    pub fn reconnect(&self) -> Reconnect {
        Reconnect::new(
            RetryPolicy::Doubling {
                base: Duration::from_millis(self.backoff_base_ms),
                cap: Duration::from_millis(self.backoff_cap_ms),
            },
            self.max_attempts,
        )
    }
}

impl AlertConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_sec)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file falls back
/// to defaults; a present-but-broken file is an error.
pub fn load(path: &str) -> Result<Config> {
    let config = match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<Config>(&contents)
            .with_context(|| format!("failed to parse config: {path}"))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path, "no config file, using defaults");
            Config::default()
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnAction, ConnEvent};

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.feed.url, "ws://localhost:8000/ws");
        assert_eq!(config.feed.retry_delay_sec, 5);
        assert_eq!(config.feed.max_attempts, 5);
        assert_eq!(config.feed.wake_interval_sec, 30);
        assert_eq!(config.broker.backoff_base_ms, 1_000);
        assert_eq!(config.broker.backoff_cap_ms, 30_000);
        assert_eq!(config.alert.cooldown_sec, 120);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_config_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
[feed]
url = "wss://farm.example.com/ws"

[broker]
host = "broker.example.com"
port = 8884
username = "admin"
password = "secret"
"#,
        )
        .unwrap();
        assert_eq!(config.feed.url, "wss://farm.example.com/ws");
        assert_eq!(config.feed.retry_delay_sec, 5);
        assert_eq!(config.broker.host, "broker.example.com");
        assert_eq!(config.broker.port, 8884);
        assert_eq!(config.api.base_url, "http://localhost:8000");
        config.validate().unwrap();
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn feed_url_scheme_enforced() {
        let mut cfg = Config::default();
        cfg.feed.url = "http://localhost:8000/ws".into();
        assert_validation_err(&cfg, "must start with ws://");
    }

    #[test]
    fn feed_zero_retry_delay_rejected() {
        let mut cfg = Config::default();
        cfg.feed.retry_delay_sec = 0;
        assert_validation_err(&cfg, "feed.retry_delay_sec must be positive");
    }

    #[test]
    fn feed_zero_wake_interval_rejected() {
        let mut cfg = Config::default();
        cfg.feed.wake_interval_sec = 0;
        assert_validation_err(&cfg, "feed.wake_interval_sec must be positive");
    }

    #[test]
    fn broker_empty_host_rejected() {
        let mut cfg = Config::default();
        cfg.broker.host = " ".into();
        assert_validation_err(&cfg, "broker.host is empty");
    }

    #[test]
    fn broker_cap_below_base_rejected() {
        let mut cfg = Config::default();
        cfg.broker.backoff_base_ms = 5_000;
        cfg.broker.backoff_cap_ms = 1_000;
        assert_validation_err(&cfg, "backoff_cap_ms (1000) is less than backoff_base_ms (5000)");
    }

    #[test]
    fn api_scheme_enforced() {
        let mut cfg = Config::default();
        cfg.api.base_url = "localhost:8000".into();
        assert_validation_err(&cfg, "api.base_url");
    }

    #[test]
    fn zero_cooldown_rejected() {
        let mut cfg = Config::default();
        cfg.alert.cooldown_sec = 0;
        assert_validation_err(&cfg, "alert.cooldown_sec must be positive");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.feed.url = "nope".into();
        cfg.broker.port = 0;
        cfg.store.database_url = "".into();
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("feed.url"), "missing feed error in: {msg}");
        assert!(msg.contains("broker.port"), "missing port error in: {msg}");
        assert!(
            msg.contains("store.database_url"),
            "missing store error in: {msg}"
        );
    }

    // -- Reconnect wiring -------------------------------------------------

    #[test]
    fn feed_reconnect_uses_fixed_delay() {
        let mut fsm = FeedConfig::default().reconnect();
        fsm.on_event(ConnEvent::Opened);
        for _ in 0..3 {
            let action = fsm.on_event(ConnEvent::Errored);
            assert_eq!(
                action,
                ConnAction::Reconnect {
                    delay: Duration::from_secs(5)
                }
            );
        }
    }

    #[test]
    fn broker_reconnect_doubles_up_to_cap() {
        let mut cfg = BrokerConfig::default();
        cfg.max_attempts = 10;
        let mut fsm = cfg.reconnect();
        fsm.on_event(ConnEvent::Opened);

        let mut delays = Vec::new();
        for _ in 0..7 {
            match fsm.on_event(ConnEvent::Errored) {
                ConnAction::Reconnect { delay } => delays.push(delay.as_millis() as u64),
                other => panic!("expected reconnect, got {other:?}"),
            }
        }
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }
}
