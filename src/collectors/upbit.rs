//! Upbit trade collector.
//!
//! Upbit WS quirks:
//! - JSON text frames (SIMPLE format skipped: data delivery issues)
//! - 120s idle timeout, held open by the runner's 30s ping
//! - orderbook frames are full snapshots, so nothing to reset on reconnect

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::collectors::robust_ws::{CollectorHandle, ExchangeStream, WsRunner};
use crate::collectors::second_bucket::SecondBucket;
use crate::store::writer::DatabaseWriter;

const UPBIT_WS_URL: &str = "wss://api.upbit.com/websocket/v1";

#[derive(Debug, Deserialize)]
struct UpbitTradeMsg {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    trade_price: f64,
    #[serde(default)]
    trade_volume: f64,
    /// Epoch milliseconds.
    trade_timestamp: Option<i64>,
}

/// Upbit trade stream feeding the 1-second bucket.
pub struct UpbitCollector {
    markets: Arc<RwLock<Vec<String>>>,
    bucket: Arc<Mutex<SecondBucket>>,
}

impl UpbitCollector {
    /// Build the collector plus its runner and external handle.
    pub fn new(
        markets: Vec<String>,
        writer: Arc<DatabaseWriter>,
    ) -> (WsRunner<UpbitCollector>, CollectorHandle, Arc<Mutex<SecondBucket>>) {
        let markets = Arc::new(RwLock::new(markets));
        let bucket = Arc::new(Mutex::new(SecondBucket::new(writer)));
        let collector = UpbitCollector { markets: markets.clone(), bucket: bucket.clone() };
        let (runner, handle) = WsRunner::new(collector, markets);
        (runner, handle, bucket)
    }

    fn handle_trade(&self, msg: UpbitTradeMsg) {
        if msg.code.is_empty() || msg.trade_price <= 0.0 {
            return;
        }
        let market = format!("UPBIT:{}", msg.code);
        let ts_sec = msg
            .trade_timestamp
            .map(|ms| ms / 1000)
            .unwrap_or_else(|| chrono::Utc::now().timestamp());

        let mut bucket = self.bucket.lock();
        bucket.add_trade(&market, msg.trade_price, msg.trade_volume, ts_sec);
        bucket.flush_completed(ts_sec);
    }
}

#[async_trait]
impl ExchangeStream for UpbitCollector {
    fn name(&self) -> &'static str {
        "upbit"
    }

    fn url(&self) -> &str {
        UPBIT_WS_URL
    }

    fn subscription_payloads(&self) -> Vec<String> {
        let ticket = uuid::Uuid::new_v4().to_string();
        let codes: Vec<String> = self.markets.read().clone();
        let payload = serde_json::json!([
            { "ticket": format!("upbit-{}", &ticket[..8]) },
            { "type": "trade", "codes": codes },
        ]);
        vec![payload.to_string()]
    }

    fn on_message(&mut self, text: &str) {
        match serde_json::from_str::<UpbitTradeMsg>(text) {
            Ok(msg) if msg.msg_type == "trade" => self.handle_trade(msg),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "upbit message decode failed"),
        }
    }

    fn on_reconnected(&mut self) {
        // Snapshot semantics: the aggregation buffer stays valid.
        debug!("upbit reconnected, resuming");
    }

    async fn fetch_gap(&mut self, gap_seconds: f64) {
        // Reserved for REST candle backfill.
        warn!(gap_s = gap_seconds, "upbit gap detected, REST backfill not wired");
    }
}
