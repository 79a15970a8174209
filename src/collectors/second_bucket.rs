//! In-memory 1-second OHLCV aggregation.
//!
//! Individual trades are merged into per-(market, second) buckets; completed
//! seconds are flushed to the writer as `trade_snapshot_1s` rows.

use chrono::{TimeZone, Utc};
use rusqlite::types::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::writer::{DatabaseWriter, Priority};

const INSERT_TRADE_1S: &str = "INSERT OR REPLACE INTO trade_snapshot_1s \
     (market, ts, open, high, low, close, volume, volume_krw) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

#[derive(Debug, Clone, Copy)]
struct Bucket {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    volume_krw: f64,
}

/// 1-second OHLCV accumulator owned by a single collector.
pub struct SecondBucket {
    writer: Arc<DatabaseWriter>,
    buckets: HashMap<(String, i64), Bucket>,
}

impl SecondBucket {
    pub fn new(writer: Arc<DatabaseWriter>) -> Self {
        Self { writer, buckets: HashMap::new() }
    }

    /// Merge one trade into its (market, second) bucket.
    pub fn add_trade(&mut self, market: &str, price: f64, volume: f64, ts_sec: i64) {
        let volume_krw = price * volume;
        match self.buckets.get_mut(&(market.to_string(), ts_sec)) {
            Some(b) => {
                b.high = b.high.max(price);
                b.low = b.low.min(price);
                b.close = price;
                b.volume += volume;
                b.volume_krw += volume_krw;
            }
            None => {
                self.buckets.insert(
                    (market.to_string(), ts_sec),
                    Bucket { open: price, high: price, low: price, close: price, volume, volume_krw },
                );
            }
        }
    }

    /// Flush every bucket strictly before `current_ts_sec`. Returns the
    /// number of rows submitted.
    pub fn flush_completed(&mut self, current_ts_sec: i64) -> usize {
        let completed: Vec<(String, i64)> = self
            .buckets
            .keys()
            .filter(|(_, ts)| *ts < current_ts_sec)
            .cloned()
            .collect();
        for key in &completed {
            if let Some(bucket) = self.buckets.remove(key) {
                self.submit(&key.0, key.1, bucket);
            }
        }
        completed.len()
    }

    /// Flush everything (shutdown path).
    pub fn flush_all(&mut self) -> usize {
        let keys: Vec<(String, i64)> = self.buckets.keys().cloned().collect();
        for key in &keys {
            if let Some(bucket) = self.buckets.remove(key) {
                self.submit(&key.0, key.1, bucket);
            }
        }
        keys.len()
    }

    /// Buckets not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.buckets.len()
    }

    fn submit(&self, market: &str, ts_sec: i64, b: Bucket) {
        self.writer.enqueue(
            INSERT_TRADE_1S,
            vec![
                Value::from(market.to_string()),
                Value::from(format_ts_sec(ts_sec)),
                Value::from(b.open),
                Value::from(b.high),
                Value::from(b.low),
                Value::from(b.close),
                Value::from(b.volume),
                Value::from(b.volume_krw),
            ],
            Priority::Normal,
        );
    }
}

/// Epoch seconds -> UTC `"YYYY-MM-DD HH:MM:SS"`.
pub fn format_ts_sec(ts_sec: i64) -> String {
    Utc.timestamp_opt(ts_sec, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}
