//! Detection-to-alert latency measurement.
//!
//! Four timestamps per event: detect, analyze start, analyze end, alert
//! sent. Rows land in `alert_latency_log` through the writer queue.

use rusqlite::types::Value;
use std::sync::Arc;
use tracing::info;

use crate::store::writer::{DatabaseWriter, Priority};

const INSERT_LATENCY_SQL: &str = "INSERT INTO alert_latency_log (\
     timestamp, symbol, exchange, event_type, \
     detect_ts, analyze_start_ts, analyze_end_ts, alert_sent_ts, \
     detect_to_alert_ms, analyze_duration_ms, total_duration_ms, \
     alert_level, can_proceed) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";

/// Per-event latency tracker.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    pub symbol: String,
    pub exchange: String,
    pub event_type: &'static str,
    detect_ts: Option<f64>,
    analyze_start_ts: Option<f64>,
    analyze_end_ts: Option<f64>,
    alert_sent_ts: Option<f64>,
    alert_level: Option<String>,
    can_proceed: Option<bool>,
}

impl LatencyTracker {
    pub fn new(symbol: &str, exchange: &str, event_type: &'static str) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            event_type,
            detect_ts: None,
            analyze_start_ts: None,
            analyze_end_ts: None,
            alert_sent_ts: None,
            alert_level: None,
            can_proceed: None,
        }
    }

    pub fn mark_detect(&mut self) -> &mut Self {
        self.detect_ts = Some(now_ts());
        self
    }

    pub fn mark_analyze_start(&mut self) -> &mut Self {
        self.analyze_start_ts = Some(now_ts());
        self
    }

    pub fn mark_analyze_end(&mut self) -> &mut Self {
        self.analyze_end_ts = Some(now_ts());
        self
    }

    pub fn mark_alert_sent(&mut self) -> &mut Self {
        self.alert_sent_ts = Some(now_ts());
        self
    }

    pub fn set_result(&mut self, alert_level: &str, can_proceed: bool) -> &mut Self {
        self.alert_level = Some(alert_level.to_string());
        self.can_proceed = Some(can_proceed);
        self
    }

    pub fn detect_to_alert_ms(&self) -> Option<f64> {
        Some((self.alert_sent_ts? - self.detect_ts?) * 1000.0)
    }

    pub fn analyze_duration_ms(&self) -> Option<f64> {
        Some((self.analyze_end_ts? - self.analyze_start_ts?) * 1000.0)
    }

    /// Queue the row; fire-and-forget.
    pub fn save(&self, writer: &Arc<DatabaseWriter>) {
        writer.enqueue(
            INSERT_LATENCY_SQL,
            vec![
                Value::from(now_ts()),
                Value::from(self.symbol.clone()),
                Value::from(self.exchange.clone()),
                Value::from(self.event_type.to_string()),
                Value::from(self.detect_ts),
                Value::from(self.analyze_start_ts),
                Value::from(self.analyze_end_ts),
                Value::from(self.alert_sent_ts),
                Value::from(self.detect_to_alert_ms()),
                Value::from(self.analyze_duration_ms()),
                Value::from(self.detect_to_alert_ms()),
                Value::from(self.alert_level.clone()),
                Value::from(self.can_proceed.map(|p| p as i64)),
            ],
            Priority::Normal,
        );

        info!(
            symbol = %self.symbol,
            exchange = %self.exchange,
            detect_to_alert_ms = self.detect_to_alert_ms(),
            analyze_ms = self.analyze_duration_ms(),
            "latency recorded"
        );
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
