//! Level-routed alert delivery.
//!
//! - INFO: log only
//! - LOW: batch buffer, flushed hourly as one combined message
//! - MEDIUM: debounced per key (300s TTL) via the writer-serialised upsert
//! - HIGH / CRITICAL: immediate send
//!
//! Missing bot credentials downgrade delivery to logged dry-runs; the rest
//! of the pipeline is unaffected.

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::AlertLevel;
use crate::store::writer::{DatabaseWriter, Priority};

/// Debounce TTL for MEDIUM alerts (seconds).
const DEFAULT_DEBOUNCE_SEC: f64 = 300.0;
/// LOW-level batch flush interval (seconds).
const BATCH_FLUSH_INTERVAL: f64 = 3600.0;

const DEBOUNCE_UPSERT_SQL: &str =
    "INSERT OR REPLACE INTO alert_debounce (key, last_sent_at, expires_at) VALUES (?1, ?2, ?3)";

pub struct TelegramAlert {
    writer: Arc<DatabaseWriter>,
    read_conn: Mutex<Connection>,
    bot_token: Option<String>,
    chat_id: Option<String>,
    client: reqwest::Client,
    batch_buffer: Mutex<Vec<String>>,
    last_batch_flush: Mutex<f64>,
}

impl TelegramAlert {
    /// Credentials fall back to `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID`.
    pub fn new(
        writer: Arc<DatabaseWriter>,
        read_conn: Connection,
        bot_token: Option<String>,
        chat_id: Option<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            writer,
            read_conn: Mutex::new(read_conn),
            bot_token: bot_token.or_else(|| std::env::var("TELEGRAM_BOT_TOKEN").ok()),
            chat_id: chat_id.or_else(|| std::env::var("TELEGRAM_CHAT_ID").ok()),
            client,
            batch_buffer: Mutex::new(Vec::new()),
            last_batch_flush: Mutex::new(now_ts()),
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!((&self.bot_token, &self.chat_id), (Some(t), Some(c)) if !t.is_empty() && !c.is_empty())
    }

    /// Route one alert by level.
    pub async fn send(&self, level: AlertLevel, message: &str, key: Option<&str>) {
        let formatted = format!("[{}] {}", level.as_str(), message);

        match level {
            AlertLevel::Info => {
                info!(alert = "INFO", "{}", message);
            }
            AlertLevel::Low => {
                self.batch_buffer.lock().push(formatted);
                info!(alert = "LOW", "batched: {}", truncate(message, 80));
                self.try_flush_batch().await;
            }
            AlertLevel::Medium => {
                if let Some(key) = key {
                    let now = now_ts();
                    if !self.debounce_check(key, now) {
                        debug!(alert = "MEDIUM", key, "debounced, skipping");
                        return;
                    }
                    self.debounce_update(key, now, DEFAULT_DEBOUNCE_SEC);
                }
                info!(alert = "MEDIUM", "{}", truncate(message, 100));
                self.deliver(&formatted).await;
            }
            AlertLevel::High | AlertLevel::Critical => {
                info!(alert = level.as_str(), "{}", truncate(message, 100));
                self.deliver(&formatted).await;
            }
        }
    }

    /// Force-flush the LOW batch (hourly timer or shutdown).
    pub async fn flush_batch(&self) {
        let buffered: Vec<String> = {
            let mut buffer = self.batch_buffer.lock();
            if buffer.is_empty() {
                return;
            }
            buffer.drain(..).collect()
        };
        let header = format!("--- {} batched LOW alerts ---\n\n", buffered.len());
        self.deliver(&(header + &buffered.join("\n\n"))).await;
        *self.last_batch_flush.lock() = now_ts();
    }

    pub fn batch_len(&self) -> usize {
        self.batch_buffer.lock().len()
    }

    async fn try_flush_batch(&self) {
        let due = now_ts() - *self.last_batch_flush.lock() >= BATCH_FLUSH_INTERVAL;
        if due {
            self.flush_batch().await;
        }
    }

    /// True when a send is allowed for `key` at time `now`.
    ///
    /// A read failure allows the send: losing a duplicate alert beats
    /// losing a real one.
    pub(crate) fn debounce_check(&self, key: &str, now: f64) -> bool {
        let conn = self.read_conn.lock();
        let row: Result<f64, _> = conn.query_row(
            "SELECT expires_at FROM alert_debounce WHERE key = ?1",
            [key],
            |r| r.get(0),
        );
        match row {
            Ok(expires_at) => now >= expires_at,
            Err(rusqlite::Error::QueryReturnedNoRows) => true,
            Err(e) => {
                warn!(key, error = %e, "debounce lookup failed, allowing send");
                true
            }
        }
    }

    /// Upsert the debounce record through the writer queue.
    pub(crate) fn debounce_update(&self, key: &str, now: f64, ttl: f64) {
        self.writer.enqueue(
            DEBOUNCE_UPSERT_SQL,
            vec![
                Value::from(key.to_string()),
                Value::from(now),
                Value::from(now + ttl),
            ],
            Priority::Normal,
        );
    }

    async fn deliver(&self, message: &str) {
        let (Some(token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            info!("[telegram dry-run] {}", truncate(message, 200));
            return;
        };

        let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "text": message,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });

        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("telegram delivery ok");
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                warn!(%status, body = truncate(&body, 200), "telegram delivery failed");
            }
            Err(e) => warn!(error = %e, "telegram delivery error"),
        }
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
