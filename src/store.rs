//! Persisted client state: the browser's local storage becomes a small
//! sqlite key-value table.  Every read/write is one statement — atomic per
//! call, last-write-wins, no transaction semantics on top.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

// Storage keys carried over from the page implementation.
pub const KEY_NOTIFICATIONS: &str = "notifications";
pub const KEY_NOTIFICATION_COUNT: &str = "notification_count";
pub const KEY_LAST_ALERT_TIME: &str = "last_alert_time";
pub const KEY_TEMPERATURE_THRESHOLD: &str = "temperature_alert_threshold";

/// Fallback temperature alert threshold (°C) when none is persisted.
pub const DEFAULT_TEMPERATURE_THRESHOLD: f64 = 26.0;

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// db_url examples:
    /// - "sqlite:farmfeed.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
              key   TEXT PRIMARY KEY,
              value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create kv table")?;
        Ok(())
    }

    // ----------------------------
    // Raw key-value access
    // ----------------------------

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("kv get failed for key '{key}'"))
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("kv put failed for key '{key}'"))?;
        Ok(())
    }

    // ----------------------------
    // JSON helpers
    // ----------------------------

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("corrupt json under key '{key}'"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value).context("json serialize failed")?;
        self.put(key, &raw).await
    }

    // ----------------------------
    // Typed accessors
    // ----------------------------

    /// Epoch millis of the last threshold-alert sweep, if any.
    pub async fn last_alert_time(&self) -> Result<Option<i64>> {
        Ok(self.get(KEY_LAST_ALERT_TIME).await?.and_then(|v| v.parse().ok()))
    }

    pub async fn set_last_alert_time(&self, epoch_ms: i64) -> Result<()> {
        self.put(KEY_LAST_ALERT_TIME, &epoch_ms.to_string()).await
    }

    /// Persisted temperature threshold, falling back to the default when
    /// absent or unparseable (mirrors the page's behaviour).
    pub async fn temperature_threshold(&self) -> Result<f64> {
        Ok(self
            .get(KEY_TEMPERATURE_THRESHOLD)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TEMPERATURE_THRESHOLD))
    }

    pub async fn set_temperature_threshold(&self, threshold: f64) -> Result<()> {
        self.put(KEY_TEMPERATURE_THRESHOLD, &threshold.to_string())
            .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let store = test_store().await;
        assert_eq!(store.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = test_store().await;
        store.put("k", "v1").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn put_overwrites_last_write_wins() {
        let store = test_store().await;
        store.put("k", "v1").await.unwrap();
        store.put("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn json_round_trip() {
        let store = test_store().await;
        store.put_json("list", &vec![1, 2, 3]).await.unwrap();
        let back: Option<Vec<i32>> = store.get_json("list").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn corrupt_json_is_an_error_not_a_panic() {
        let store = test_store().await;
        store.put("list", "not json").await.unwrap();
        let back: Result<Option<Vec<i32>>> = store.get_json("list").await;
        assert!(back.is_err());
    }

    #[tokio::test]
    async fn temperature_threshold_defaults() {
        let store = test_store().await;
        assert_eq!(
            store.temperature_threshold().await.unwrap(),
            DEFAULT_TEMPERATURE_THRESHOLD
        );
        store.set_temperature_threshold(30.5).await.unwrap();
        assert_eq!(store.temperature_threshold().await.unwrap(), 30.5);
    }

    #[tokio::test]
    async fn unparseable_threshold_falls_back_to_default() {
        let store = test_store().await;
        store.put(KEY_TEMPERATURE_THRESHOLD, "hot").await.unwrap();
        assert_eq!(
            store.temperature_threshold().await.unwrap(),
            DEFAULT_TEMPERATURE_THRESHOLD
        );
    }

    #[tokio::test]
    async fn last_alert_time_round_trips() {
        let store = test_store().await;
        assert_eq!(store.last_alert_time().await.unwrap(), None);
        store.set_last_alert_time(1_700_000_000_000).await.unwrap();
        assert_eq!(
            store.last_alert_time().await.unwrap(),
            Some(1_700_000_000_000)
        );
    }
}
