//! Kimchi-premium inputs: FX resolution and the global VWAP.
//!
//! FX fallback chain (first success wins):
//!   1. naver finance scrape (most accurate)
//!   2. open.er-api.com USD/KRW
//!   3. Upbit USDT/KRW direct (carries the stablecoin premium, labelled)
//!   4. BTC-implied (Upbit KRW-BTC / Binance BTCUSDT)
//!   5. cached value within TTL
//!   6. configured hardcoded fallback
//!
//! Every live resolution is appended to `fx_snapshots` through the writer.

use parking_lot::Mutex;
use regex::Regex;
use rusqlite::types::Value;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::FxConfig;
use crate::store::writer::{DatabaseWriter, Priority};

const FX_SNAPSHOT_SQL: &str = "INSERT INTO fx_snapshots \
     (timestamp, fx_rate, source, btc_krw, btc_usd, upbit_usdt_krw, bithumb_usdt_krw, real_fx_rate) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Where an FX rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FxSource {
    Naver,
    ExchangeRateApi,
    UsdtKrwDirect,
    BtcImplied,
    EthImplied,
    HardcodedFallback,
}

impl FxSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FxSource::Naver => "naver",
            FxSource::ExchangeRateApi => "exchangerate_api",
            FxSource::UsdtKrwDirect => "usdt_krw_direct",
            FxSource::BtcImplied => "btc_implied",
            FxSource::EthImplied => "eth_implied",
            FxSource::HardcodedFallback => "hardcoded_fallback",
        }
    }

    /// Sources trustworthy enough for actionable decisions.
    pub fn is_trusted(&self) -> bool {
        matches!(self, FxSource::Naver | FxSource::BtcImplied | FxSource::EthImplied)
    }
}

/// Premium computation result.
#[derive(Debug, Clone, Copy)]
pub struct PremiumResult {
    pub premium_pct: f64,
    pub krw_price: f64,
    pub global_usd_price: f64,
    pub fx_rate: f64,
    pub fx_source: FxSource,
}

/// Volume-weighted global price across the reference exchanges.
#[derive(Debug, Clone)]
pub struct VwapResult {
    pub price_usd: f64,
    pub total_volume_usd: f64,
    pub sources: Vec<&'static str>,
}

struct FxCache {
    rate: f64,
    source: FxSource,
    fetched_at: std::time::Instant,
}

/// FX + VWAP + premium calculator with a process-wide FX cache.
pub struct PremiumCalculator {
    writer: Arc<DatabaseWriter>,
    client: reqwest::Client,
    fx_cache: Mutex<Option<FxCache>>,
    config: FxConfig,
}

impl PremiumCalculator {
    pub fn new(writer: Arc<DatabaseWriter>, config: FxConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { writer, client, fx_cache: Mutex::new(None), config }
    }

    /// Resolve KRW-per-USD through the fallback chain. Never fails: the
    /// final stage is the configured hardcoded rate.
    pub async fn get_real_fx(&self) -> (f64, FxSource) {
        if let Some(fx) = self.try_naver().await {
            return fx;
        }
        if let Some(fx) = self.try_exchangerate_api().await {
            return fx;
        }
        if let Some(fx) = self.try_usdt_krw().await {
            return fx;
        }
        if let Some(fx) = self.try_btc_implied().await {
            return fx;
        }

        // Stage 5: expired-or-not cache, reused only when all live sources fail.
        if let Some(cache) = self.fx_cache.lock().as_ref() {
            let age = cache.fetched_at.elapsed().as_secs_f64();
            if age < self.config.cache_ttl_sec {
                info!(rate = cache.rate, source = cache.source.as_str(), age_s = age, "using cached FX");
                return (cache.rate, cache.source);
            }
        }

        warn!(rate = self.config.fallback_rate, "all FX sources failed, using hardcoded fallback");
        (self.config.fallback_rate, FxSource::HardcodedFallback)
    }

    async fn try_naver(&self) -> Option<(f64, FxSource)> {
        let rate = fetch_naver_fx(&self.client).await?;
        self.store_success(rate, FxSource::Naver, Some(rate)).await;
        info!(rate, "naver FX");
        Some((rate, FxSource::Naver))
    }

    async fn try_exchangerate_api(&self) -> Option<(f64, FxSource)> {
        let rate = fetch_exchangerate_api(&self.client).await?;
        self.store_success(rate, FxSource::ExchangeRateApi, Some(rate)).await;
        info!(rate, "exchangerate API FX");
        Some((rate, FxSource::ExchangeRateApi))
    }

    async fn try_usdt_krw(&self) -> Option<(f64, FxSource)> {
        let rate = fetch_upbit_price(&self.client, "KRW-USDT").await?;
        if rate <= 0.0 {
            return None;
        }
        self.store_success(rate, FxSource::UsdtKrwDirect, None).await;
        debug!(rate, "USDT/KRW direct FX");
        Some((rate, FxSource::UsdtKrwDirect))
    }

    async fn try_btc_implied(&self) -> Option<(f64, FxSource)> {
        let btc_krw = fetch_upbit_price(&self.client, "KRW-BTC").await?;
        let btc_usd = fetch_binance_price(&self.client, "BTCUSDT").await?;
        if btc_krw <= 0.0 || btc_usd <= 0.0 {
            return None;
        }
        let rate = btc_krw / btc_usd;
        self.snapshot(rate, FxSource::BtcImplied, Some(btc_krw), Some(btc_usd), None).await;
        self.update_cache(rate, FxSource::BtcImplied);
        debug!(rate, btc_krw, btc_usd, "BTC-implied FX");
        Some((rate, FxSource::BtcImplied))
    }

    async fn store_success(&self, rate: f64, source: FxSource, real_rate: Option<f64>) {
        let btc_krw = fetch_upbit_price(&self.client, "KRW-BTC").await;
        let btc_usd = fetch_binance_price(&self.client, "BTCUSDT").await;
        self.snapshot(rate, source, btc_krw, btc_usd, real_rate).await;
        self.update_cache(rate, source);
    }

    fn update_cache(&self, rate: f64, source: FxSource) {
        *self.fx_cache.lock() =
            Some(FxCache { rate, source, fetched_at: std::time::Instant::now() });
    }

    async fn snapshot(
        &self,
        rate: f64,
        source: FxSource,
        btc_krw: Option<f64>,
        btc_usd: Option<f64>,
        real_rate: Option<f64>,
    ) {
        let upbit_usdt = fetch_upbit_price(&self.client, "KRW-USDT").await;
        let bithumb_usdt = fetch_bithumb_price(&self.client, "USDT").await;
        self.writer.enqueue(
            FX_SNAPSHOT_SQL,
            vec![
                Value::from(chrono::Utc::now().timestamp() as f64),
                Value::from(rate),
                Value::from(source.as_str().to_string()),
                Value::from(btc_krw),
                Value::from(btc_usd),
                Value::from(upbit_usdt),
                Value::from(bithumb_usdt),
                Value::from(real_rate),
            ],
            Priority::Normal,
        );
    }

    /// Premium of a domestic price over the FX-converted global reference.
    pub fn calculate_premium(
        &self,
        krw_price: f64,
        global_usd_price: f64,
        fx_rate: f64,
        fx_source: FxSource,
    ) -> PremiumResult {
        if global_usd_price <= 0.0 || fx_rate <= 0.0 {
            return PremiumResult {
                premium_pct: 0.0,
                krw_price,
                global_usd_price,
                fx_rate,
                fx_source,
            };
        }
        let global_krw = global_usd_price * fx_rate;
        let premium_pct = (krw_price - global_krw) / global_krw * 100.0;
        PremiumResult { premium_pct, krw_price, global_usd_price, fx_rate, fx_source }
    }

    /// 3-exchange volume-weighted global price (Binance + OKX + Bybit).
    pub async fn get_global_vwap(&self, symbol: &str) -> Option<VwapResult> {
        let (binance, okx, bybit) = tokio::join!(
            fetch_binance_ticker(&self.client, symbol),
            fetch_okx_ticker(&self.client, symbol),
            fetch_bybit_ticker(&self.client, symbol),
        );

        let mut quotes: Vec<(f64, f64, &'static str)> = Vec::new();
        if let Some((price, volume)) = binance {
            quotes.push((price, volume, "binance"));
        }
        if let Some((price, volume)) = okx {
            quotes.push((price, volume, "okx"));
        }
        if let Some((price, volume)) = bybit {
            quotes.push((price, volume, "bybit"));
        }

        if quotes.is_empty() {
            warn!(symbol, "global VWAP failed, no exchange responded");
            return None;
        }

        Some(vwap_from_quotes(&quotes))
    }
}

fn vwap_from_quotes(quotes: &[(f64, f64, &'static str)]) -> VwapResult {
    let total_volume: f64 = quotes.iter().map(|q| q.1).sum();
    let sources = quotes.iter().map(|q| q.2).collect();
    if total_volume <= 0.0 {
        let avg = quotes.iter().map(|q| q.0).sum::<f64>() / quotes.len() as f64;
        return VwapResult { price_usd: avg, total_volume_usd: 0.0, sources };
    }
    let vwap = quotes.iter().map(|q| q.0 * q.1).sum::<f64>() / total_volume;
    VwapResult { price_usd: vwap, total_volume_usd: total_volume, sources }
}

// =============================================================================
// REST helpers
// =============================================================================

#[derive(Deserialize)]
struct UpbitTicker {
    trade_price: f64,
}

pub(crate) async fn fetch_upbit_price(client: &reqwest::Client, market: &str) -> Option<f64> {
    let resp = client
        .get("https://api.upbit.com/v1/ticker")
        .query(&[("markets", market)])
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let tickers: Vec<UpbitTicker> = resp.json().await.ok()?;
    tickers.first().map(|t| t.trade_price).filter(|p| *p > 0.0)
}

pub(crate) async fn fetch_bithumb_price(client: &reqwest::Client, symbol: &str) -> Option<f64> {
    let url = format!("https://api.bithumb.com/public/ticker/{}_KRW", symbol);
    let resp = client.get(&url).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body: serde_json::Value = resp.json().await.ok()?;
    if body.get("status").and_then(|s| s.as_str()) != Some("0000") {
        return None;
    }
    body.pointer("/data/closing_price")
        .and_then(|p| p.as_str())
        .and_then(|p| p.parse().ok())
        .filter(|p: &f64| *p > 0.0)
}

#[derive(Deserialize)]
struct BinancePrice {
    price: String,
}

async fn fetch_binance_price(client: &reqwest::Client, symbol: &str) -> Option<f64> {
    let resp = client
        .get("https://api.binance.com/api/v3/ticker/price")
        .query(&[("symbol", symbol)])
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body: BinancePrice = resp.json().await.ok()?;
    body.price.parse().ok().filter(|p: &f64| *p > 0.0)
}

async fn fetch_binance_ticker(client: &reqwest::Client, symbol: &str) -> Option<(f64, f64)> {
    let pair = format!("{}USDT", symbol);
    let resp = client
        .get("https://api.binance.com/api/v3/ticker/24hr")
        .query(&[("symbol", pair.as_str())])
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body: serde_json::Value = resp.json().await.ok()?;
    let price: f64 = body.get("lastPrice")?.as_str()?.parse().ok()?;
    let volume: f64 = body.get("quoteVolume")?.as_str()?.parse().ok()?;
    (price > 0.0).then_some((price, volume))
}

async fn fetch_okx_ticker(client: &reqwest::Client, symbol: &str) -> Option<(f64, f64)> {
    let pair = format!("{}-USDT", symbol);
    let resp = client
        .get("https://www.okx.com/api/v5/market/ticker")
        .query(&[("instId", pair.as_str())])
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body: serde_json::Value = resp.json().await.ok()?;
    let ticker = body.get("data")?.as_array()?.first()?;
    let price: f64 = ticker.get("last")?.as_str()?.parse().ok()?;
    let vol_base: f64 = ticker.get("vol24h")?.as_str()?.parse().ok()?;
    (price > 0.0).then_some((price, vol_base * price))
}

async fn fetch_bybit_ticker(client: &reqwest::Client, symbol: &str) -> Option<(f64, f64)> {
    let pair = format!("{}USDT", symbol);
    let resp = client
        .get("https://api.bybit.com/v5/market/tickers")
        .query(&[("category", "spot"), ("symbol", pair.as_str())])
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body: serde_json::Value = resp.json().await.ok()?;
    let ticker = body.pointer("/result/list")?.as_array()?.first()?;
    let price: f64 = ticker.get("lastPrice")?.as_str()?.parse().ok()?;
    let volume: f64 = ticker.get("turnover24h")?.as_str()?.parse().ok()?;
    (price > 0.0).then_some((price, volume))
}

async fn fetch_exchangerate_api(client: &reqwest::Client) -> Option<f64> {
    let resp = client.get("https://open.er-api.com/v6/latest/USD").send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body: serde_json::Value = resp.json().await.ok()?;
    if body.get("result").and_then(|r| r.as_str()) != Some("success") {
        return None;
    }
    body.pointer("/rates/KRW").and_then(|r| r.as_f64()).filter(|r| *r > 0.0)
}

async fn fetch_naver_fx(client: &reqwest::Client) -> Option<f64> {
    let resp = client
        .get("https://finance.naver.com/marketindex/exchangeDetail.naver")
        .query(&[("marketindexCd", "FX_USDKRW")])
        .header(
            "User-Agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
        )
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let text = resp.text().await.ok()?;
    parse_naver_rate(&text)
}

/// The naver page splits each digit into a span whose class carries the
/// digit (`no1`, `no4`...) with `shim` for the thousands comma and `jum`
/// for the decimal point.
fn parse_naver_rate(html: &str) -> Option<f64> {
    let no_today = Regex::new(r#"(?s)<p class="no_today">(.*?)</p>"#)
        .ok()?
        .captures(html)?
        .get(1)?
        .as_str()
        .to_string();

    let span_re = Regex::new(r#"<span class="(no\d|shim|jum)"[^>]*>[^<]*</span>"#).ok()?;
    let mut rate_str = String::new();
    for cap in span_re.captures_iter(&no_today) {
        let class = cap.get(1)?.as_str();
        if let Some(digit) = class.strip_prefix("no") {
            rate_str.push_str(digit);
        } else if class == "jum" {
            rate_str.push('.');
        }
    }
    rate_str.parse().ok().filter(|r: &f64| *r > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::database::{apply_migrations, default_migrations_dir, open_connection};

    fn calculator() -> (tempfile::TempDir, PremiumCalculator, Arc<DatabaseWriter>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("premium.db").to_string_lossy().to_string();
        let conn = open_connection(&path).unwrap();
        apply_migrations(&conn, &default_migrations_dir()).unwrap();
        let writer = DatabaseWriter::new(conn, 1000);
        writer.start();
        (dir, PremiumCalculator::new(writer.clone(), FxConfig::default()), writer)
    }

    #[test]
    fn premium_is_zero_iff_parity() {
        let (_dir, calc, writer) = calculator();

        let at_parity = calc.calculate_premium(1_350_000.0, 1000.0, 1350.0, FxSource::Naver);
        assert_eq!(at_parity.premium_pct, 0.0);

        let above = calc.calculate_premium(1_500_000.0, 1000.0, 1350.0, FxSource::BtcImplied);
        assert!(above.premium_pct > 0.0);
        assert!((above.premium_pct - 11.111).abs() < 0.01);

        let below = calc.calculate_premium(1_200_000.0, 1000.0, 1350.0, FxSource::BtcImplied);
        assert!(below.premium_pct < 0.0);
        writer.shutdown();
    }

    #[test]
    fn degenerate_inputs_yield_zero_premium() {
        let (_dir, calc, writer) = calculator();
        let r = calc.calculate_premium(1000.0, 0.0, 1350.0, FxSource::Naver);
        assert_eq!(r.premium_pct, 0.0);
        let r = calc.calculate_premium(1000.0, 1.0, 0.0, FxSource::Naver);
        assert_eq!(r.premium_pct, 0.0);
        writer.shutdown();
    }

    #[test]
    fn vwap_weights_by_volume() {
        let quotes = [(100.0, 1000.0, "binance"), (110.0, 3000.0, "okx")];
        let result = vwap_from_quotes(&quotes);
        assert!((result.price_usd - 107.5).abs() < 1e-9);
        assert_eq!(result.total_volume_usd, 4000.0);
        assert_eq!(result.sources, vec!["binance", "okx"]);
    }

    #[test]
    fn vwap_falls_back_to_mean_without_volume() {
        let quotes = [(100.0, 0.0, "binance"), (110.0, 0.0, "okx")];
        let result = vwap_from_quotes(&quotes);
        assert!((result.price_usd - 105.0).abs() < 1e-9);
        assert_eq!(result.total_volume_usd, 0.0);
    }

    #[test]
    fn trusted_sources() {
        assert!(FxSource::Naver.is_trusted());
        assert!(FxSource::BtcImplied.is_trusted());
        assert!(FxSource::EthImplied.is_trusted());
        assert!(!FxSource::UsdtKrwDirect.is_trusted());
        assert!(!FxSource::HardcodedFallback.is_trusted());
    }

    #[test]
    fn naver_span_soup_parses() {
        let html = r#"
            <div><p class="no_today">
                <em>
                    <span class="no1">1</span><span class="shim">,</span>
                    <span class="no3">3</span><span class="no5">5</span>
                    <span class="no0">0</span><span class="jum">.</span>
                    <span class="no5">5</span><span class="no0">0</span>
                </em>
            </p></div>"#;
        assert_eq!(parse_naver_rate(html), Some(1350.50));
    }

    #[test]
    fn naver_parse_rejects_garbage() {
        assert_eq!(parse_naver_rate("<html>nothing here</html>"), None);
    }
}
