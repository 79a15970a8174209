//! Bithumb transaction + orderbook-depth collector.
//!
//! Bithumb WS quirks:
//! - JSON text frames; numbers arrive as comma-grouped strings
//! - orderbook frames are deltas (quantity 0 = level removed), so the cache
//!   must be rebuilt from scratch after every reconnect
//! - `contDtm` timestamps are KST (UTC+9)

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDateTime, TimeZone};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collectors::robust_ws::{CollectorHandle, ExchangeStream, WsRunner};
use crate::collectors::second_bucket::SecondBucket;
use crate::models::{Orderbook, PriceLevel};
use crate::store::writer::DatabaseWriter;

const BITHUMB_WS_URL: &str = "wss://pubwss.bithumb.com/pub/ws";
/// Max price levels kept per orderbook side.
const MAX_OB_LEVELS: usize = 50;
/// Fixed-point price key scale (1/10000 KRW resolution).
const PRICE_KEY_SCALE: f64 = 10_000.0;

#[derive(Debug, Deserialize)]
struct BithumbMsg {
    #[serde(rename = "type")]
    msg_type: Option<String>,
    content: Option<BithumbContent>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BithumbContent {
    #[serde(default)]
    list: Vec<BithumbEntry>,
}

#[derive(Debug, Deserialize)]
struct BithumbEntry {
    #[serde(default)]
    symbol: String,
    // transaction fields
    #[serde(rename = "contPrice")]
    cont_price: Option<String>,
    #[serde(rename = "contQty")]
    cont_qty: Option<String>,
    #[serde(rename = "contDtm")]
    cont_dtm: Option<String>,
    // orderbookdepth fields
    #[serde(rename = "orderType")]
    order_type: Option<String>,
    price: Option<String>,
    quantity: Option<String>,
}

#[derive(Debug, Default)]
struct BookSides {
    asks: BTreeMap<i64, f64>,
    bids: BTreeMap<i64, f64>,
}

/// Delta-maintained orderbook cache, readable as typed snapshots.
#[derive(Default)]
pub struct OrderbookCache {
    books: RwLock<HashMap<String, BookSides>>,
}

impl OrderbookCache {
    fn merge_delta(&self, symbol: &str, side: &str, price: f64, qty: f64) {
        let mut books = self.books.write();
        let book = books.entry(symbol.to_string()).or_default();
        let levels = if side == "ask" { &mut book.asks } else { &mut book.bids };
        let key = (price * PRICE_KEY_SCALE).round() as i64;

        if qty == 0.0 {
            levels.remove(&key);
            return;
        }
        levels.insert(key, qty);

        // Trim overflow: asks lose the highest prices, bids the lowest.
        while levels.len() > MAX_OB_LEVELS {
            let evict = if side == "ask" {
                levels.keys().next_back().copied()
            } else {
                levels.keys().next().copied()
            };
            match evict {
                Some(k) => levels.remove(&k),
                None => break,
            };
        }
    }

    fn clear(&self) {
        self.books.write().clear();
    }

    /// Sorted snapshot for the cost model: asks ascending, bids descending.
    pub fn snapshot(&self, symbol: &str) -> Option<Orderbook> {
        let books = self.books.read();
        let book = books.get(symbol)?;
        if book.asks.is_empty() && book.bids.is_empty() {
            return None;
        }
        Some(Orderbook {
            asks: book
                .asks
                .iter()
                .map(|(k, q)| PriceLevel { price: *k as f64 / PRICE_KEY_SCALE, qty: *q })
                .collect(),
            bids: book
                .bids
                .iter()
                .rev()
                .map(|(k, q)| PriceLevel { price: *k as f64 / PRICE_KEY_SCALE, qty: *q })
                .collect(),
        })
    }
}

/// Bithumb transaction stream + orderbook delta cache.
pub struct BithumbCollector {
    markets: Arc<RwLock<Vec<String>>>,
    bucket: Arc<Mutex<SecondBucket>>,
    orderbook: Arc<OrderbookCache>,
}

impl BithumbCollector {
    pub fn new(
        markets: Vec<String>,
        writer: Arc<DatabaseWriter>,
    ) -> (
        WsRunner<BithumbCollector>,
        CollectorHandle,
        Arc<Mutex<SecondBucket>>,
        Arc<OrderbookCache>,
    ) {
        let markets = Arc::new(RwLock::new(markets));
        let bucket = Arc::new(Mutex::new(SecondBucket::new(writer)));
        let orderbook = Arc::new(OrderbookCache::default());
        let collector = BithumbCollector {
            markets: markets.clone(),
            bucket: bucket.clone(),
            orderbook: orderbook.clone(),
        };
        let (runner, handle) = WsRunner::new(collector, markets);
        (runner, handle, bucket, orderbook)
    }

    fn handle_transaction(&self, entries: Vec<BithumbEntry>) {
        for tx in entries {
            let Some(price) = tx.cont_price.as_deref().and_then(parse_grouped_number) else {
                continue;
            };
            let Some(volume) = tx.cont_qty.as_deref().and_then(parse_grouped_number) else {
                continue;
            };
            if tx.symbol.is_empty() || price <= 0.0 {
                continue;
            }
            let market = format!("BITHUMB:{}", tx.symbol);
            let ts_sec = parse_kst_ts(tx.cont_dtm.as_deref());

            let mut bucket = self.bucket.lock();
            bucket.add_trade(&market, price, volume, ts_sec);
            bucket.flush_completed(ts_sec);
        }
    }

    fn handle_orderbook_depth(&self, entries: Vec<BithumbEntry>) {
        for entry in entries {
            if entry.symbol.is_empty() {
                continue;
            }
            let Some(price) = entry.price.as_deref().and_then(parse_grouped_number) else {
                continue;
            };
            let Some(qty) = entry.quantity.as_deref().and_then(parse_grouped_number) else {
                continue;
            };
            let side = entry.order_type.as_deref().unwrap_or("");
            self.orderbook.merge_delta(&entry.symbol, side, price, qty);
        }
    }
}

#[async_trait]
impl ExchangeStream for BithumbCollector {
    fn name(&self) -> &'static str {
        "bithumb"
    }

    fn url(&self) -> &str {
        BITHUMB_WS_URL
    }

    fn subscription_payloads(&self) -> Vec<String> {
        let symbols: Vec<String> = self.markets.read().clone();
        vec![
            serde_json::json!({ "type": "transaction", "symbols": symbols }).to_string(),
            serde_json::json!({ "type": "orderbookdepth", "symbols": symbols }).to_string(),
        ]
    }

    fn on_message(&mut self, text: &str) {
        let msg: BithumbMsg = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "bithumb message decode failed");
                return;
            }
        };

        let Some(content) = msg.content else {
            if let Some(status) = msg.status {
                debug!(status, "bithumb control message");
            }
            return;
        };

        match msg.msg_type.as_deref() {
            Some("transaction") => self.handle_transaction(content.list),
            Some("orderbookdepth") => self.handle_orderbook_depth(content.list),
            _ => {}
        }
    }

    fn on_reconnected(&mut self) {
        // Delta stream: stale levels would silently corrupt the book.
        self.orderbook.clear();
        info!("bithumb reconnected, orderbook cache invalidated");
    }

    async fn fetch_gap(&mut self, gap_seconds: f64) {
        warn!(gap_s = gap_seconds, "bithumb gap detected, REST backfill not wired");
    }
}

fn parse_grouped_number(s: &str) -> Option<f64> {
    s.replace(',', "").parse().ok()
}

/// Bithumb `contDtm` ("2024-01-15 12:34:56.123456", KST) -> UTC epoch secs.
fn parse_kst_ts(ts: Option<&str>) -> i64 {
    let kst = FixedOffset::east_opt(9 * 3600).expect("valid KST offset");
    ts.and_then(|s| {
        let trimmed = s.get(..19)?;
        let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S").ok()?;
        kst.from_local_datetime(&naive).single().map(|dt| dt.timestamp())
    })
    .unwrap_or_else(|| chrono::Utc::now().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::database::{apply_migrations, default_migrations_dir, open_connection};

    fn collector() -> (tempfile::TempDir, BithumbCollector, Arc<DatabaseWriter>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bithumb.db").to_string_lossy().to_string();
        let conn = open_connection(&path).unwrap();
        apply_migrations(&conn, &default_migrations_dir()).unwrap();
        let writer = DatabaseWriter::new(conn, 1000);
        writer.start();

        let c = BithumbCollector {
            markets: Arc::new(RwLock::new(vec!["BTC_KRW".to_string()])),
            bucket: Arc::new(Mutex::new(SecondBucket::new(writer.clone()))),
            orderbook: Arc::new(OrderbookCache::default()),
        };
        (dir, c, writer)
    }

    #[test]
    fn transaction_with_grouped_numbers() {
        let (_dir, mut c, writer) = collector();
        c.on_message(
            r#"{"type":"transaction","content":{"list":[
                {"symbol":"BTC_KRW","contPrice":"100,000,000","contQty":"0.5",
                 "contDtm":"2024-01-15 12:34:56.123456"}]}}"#,
        );
        assert_eq!(c.bucket.lock().pending_count(), 1);
        writer.shutdown();
    }

    #[test]
    fn kst_timestamp_converts_to_utc() {
        // 2024-01-15 12:34:56 KST == 2024-01-15 03:34:56 UTC.
        let ts = parse_kst_ts(Some("2024-01-15 12:34:56.123456"));
        assert_eq!(ts, 1_705_289_696);
    }

    #[test]
    fn orderbook_delta_merge_and_removal() {
        let (_dir, c, writer) = collector();
        c.orderbook.merge_delta("BTC_KRW", "ask", 100.0, 1.0);
        c.orderbook.merge_delta("BTC_KRW", "ask", 101.0, 2.0);
        c.orderbook.merge_delta("BTC_KRW", "bid", 99.0, 3.0);

        let snap = c.orderbook.snapshot("BTC_KRW").unwrap();
        assert_eq!(snap.asks.len(), 2);
        assert_eq!(snap.best_ask(), Some(100.0));
        assert_eq!(snap.bids[0].price, 99.0);

        // quantity 0 removes the level
        c.orderbook.merge_delta("BTC_KRW", "ask", 100.0, 0.0);
        let snap = c.orderbook.snapshot("BTC_KRW").unwrap();
        assert_eq!(snap.best_ask(), Some(101.0));
        writer.shutdown();
    }

    #[test]
    fn orderbook_caps_levels_per_side() {
        let (_dir, c, writer) = collector();
        for i in 0..60 {
            c.orderbook.merge_delta("BTC_KRW", "ask", 100.0 + i as f64, 1.0);
            c.orderbook.merge_delta("BTC_KRW", "bid", 99.0 - i as f64, 1.0);
        }
        let snap = c.orderbook.snapshot("BTC_KRW").unwrap();
        assert_eq!(snap.asks.len(), MAX_OB_LEVELS);
        assert_eq!(snap.bids.len(), MAX_OB_LEVELS);
        // Asks keep the lowest prices, bids the highest.
        assert_eq!(snap.asks.last().unwrap().price, 149.0);
        assert_eq!(snap.bids.last().unwrap().price, 50.0);
        writer.shutdown();
    }

    #[test]
    fn reconnect_invalidates_orderbook() {
        let (_dir, mut c, writer) = collector();
        c.orderbook.merge_delta("BTC_KRW", "ask", 100.0, 1.0);
        c.on_reconnected();
        assert!(c.orderbook.snapshot("BTC_KRW").is_none());
        writer.shutdown();
    }
}
