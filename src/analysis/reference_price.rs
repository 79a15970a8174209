//! Global reference price with a 6-stage fallback chain.
//!
//! New tokens often have no futures contract yet, so the chain walks from
//! the deepest venues down to aggregated data, with a fixed confidence per
//! source (futures > spot > aggregated):
//!
//!   1. Binance futures  0.95
//!   2. Bybit futures    0.90
//!   3. Binance spot     0.75
//!   4. OKX spot         0.70
//!   5. Bybit spot       0.65
//!   6. CoinGecko        0.50
//!
//! The gate downgrades aggressiveness below 0.8 and forces watch-only
//! below 0.6.

use std::time::Duration;
use tracing::{debug, info, warn};

/// Venue the reference price was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSource {
    BinanceFutures,
    BybitFutures,
    BinanceSpot,
    OkxSpot,
    BybitSpot,
    Coingecko,
}

impl ReferenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceSource::BinanceFutures => "binance_futures",
            ReferenceSource::BybitFutures => "bybit_futures",
            ReferenceSource::BinanceSpot => "binance_spot",
            ReferenceSource::OkxSpot => "okx_spot",
            ReferenceSource::BybitSpot => "bybit_spot",
            ReferenceSource::Coingecko => "coingecko",
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            ReferenceSource::BinanceFutures => 0.95,
            ReferenceSource::BybitFutures => 0.90,
            ReferenceSource::BinanceSpot => 0.75,
            ReferenceSource::OkxSpot => 0.70,
            ReferenceSource::BybitSpot => 0.65,
            ReferenceSource::Coingecko => 0.50,
        }
    }
}

/// Resolved reference price.
#[derive(Debug, Clone)]
pub struct ReferencePrice {
    pub symbol: String,
    pub price_usd: f64,
    pub source: ReferenceSource,
    pub confidence: f64,
    pub volume_24h_usd: Option<f64>,
}

pub struct ReferencePriceFetcher {
    client: reqwest::Client,
    coingecko_api_key: Option<String>,
}

impl ReferencePriceFetcher {
    pub fn new(coingecko_api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, coingecko_api_key }
    }

    /// Walk the fallback chain; `None` only when every stage fails.
    pub async fn get_reference_price(&self, symbol: &str) -> Option<ReferencePrice> {
        if let Some(r) = self.try_binance_futures(symbol).await {
            return Some(r);
        }
        if let Some(r) = self.try_bybit(symbol, "linear", ReferenceSource::BybitFutures).await {
            return Some(r);
        }
        if let Some(r) = self.try_binance_spot(symbol).await {
            return Some(r);
        }
        if let Some(r) = self.try_okx_spot(symbol).await {
            return Some(r);
        }
        if let Some(r) = self.try_bybit(symbol, "spot", ReferenceSource::BybitSpot).await {
            return Some(r);
        }
        if let Some(r) = self.try_coingecko(symbol).await {
            return Some(r);
        }

        warn!(symbol, "reference price: every fallback stage failed");
        None
    }

    async fn try_binance_futures(&self, symbol: &str) -> Option<ReferencePrice> {
        let pair = format!("{}USDT", symbol);
        let resp = self
            .client
            .get("https://fapi.binance.com/fapi/v1/ticker/24hr")
            .query(&[("symbol", pair.as_str())])
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            debug!(pair, status = %resp.status(), "binance futures miss");
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        let price: f64 = body.get("lastPrice")?.as_str()?.parse().ok()?;
        let volume: f64 = body.get("quoteVolume")?.as_str()?.parse().unwrap_or(0.0);
        if price <= 0.0 {
            return None;
        }
        Some(self.resolved(symbol, price, Some(volume), ReferenceSource::BinanceFutures))
    }

    async fn try_binance_spot(&self, symbol: &str) -> Option<ReferencePrice> {
        let pair = format!("{}USDT", symbol);
        let resp = self
            .client
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
        let volume: f64 = body.get("quoteVolume")?.as_str()?.parse().unwrap_or(0.0);
        if price <= 0.0 {
            return None;
        }
        Some(self.resolved(symbol, price, Some(volume), ReferenceSource::BinanceSpot))
    }

    async fn try_bybit(
        &self,
        symbol: &str,
        category: &str,
        source: ReferenceSource,
    ) -> Option<ReferencePrice> {
        let pair = format!("{}USDT", symbol);
        let resp = self
            .client
            .get("https://api.bybit.com/v5/market/tickers")
            .query(&[("category", category), ("symbol", pair.as_str())])
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        let ticker = body.pointer("/result/list")?.as_array()?.first()?;
        let price: f64 = ticker.get("lastPrice")?.as_str()?.parse().ok()?;
        let volume: f64 = ticker.get("turnover24h")?.as_str()?.parse().unwrap_or(0.0);
        if price <= 0.0 {
            return None;
        }
        Some(self.resolved(symbol, price, Some(volume), source))
    }

    async fn try_okx_spot(&self, symbol: &str) -> Option<ReferencePrice> {
        let pair = format!("{}-USDT", symbol);
        let resp = self
            .client
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
        let vol_base: f64 = ticker.get("vol24h")?.as_str()?.parse().unwrap_or(0.0);
        if price <= 0.0 {
            return None;
        }
        Some(self.resolved(symbol, price, Some(vol_base * price), ReferenceSource::OkxSpot))
    }

    /// Aggregated last resort. Multi-exchange averages lag single venues.
    async fn try_coingecko(&self, symbol: &str) -> Option<ReferencePrice> {
        let coin_id = symbol_to_coingecko_id(symbol)?;
        let mut req = self
            .client
            .get("https://api.coingecko.com/api/v3/simple/price")
            .query(&[
                ("ids", coin_id),
                ("vs_currencies", "usd"),
                ("include_24hr_vol", "true"),
            ]);
        if let Some(key) = &self.coingecko_api_key {
            req = req.header("x-cg-pro-api-key", key);
        }
        let resp = req.send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        let coin = body.get(coin_id)?;
        let price = coin.get("usd")?.as_f64()?;
        let volume = coin.get("usd_24h_vol").and_then(|v| v.as_f64());
        if price <= 0.0 {
            return None;
        }
        warn!(symbol, price, "reference price from coingecko, low confidence");
        Some(ReferencePrice {
            symbol: symbol.to_string(),
            price_usd: price,
            source: ReferenceSource::Coingecko,
            confidence: ReferenceSource::Coingecko.confidence(),
            volume_24h_usd: volume,
        })
    }

    fn resolved(
        &self,
        symbol: &str,
        price: f64,
        volume: Option<f64>,
        source: ReferenceSource,
    ) -> ReferencePrice {
        info!(
            symbol,
            price,
            source = source.as_str(),
            confidence = source.confidence(),
            "reference price resolved"
        );
        ReferencePrice {
            symbol: symbol.to_string(),
            price_usd: price,
            source,
            confidence: source.confidence(),
            volume_24h_usd: volume,
        }
    }
}

/// Symbol -> CoinGecko id for the majors; freshly-launched tokens rarely
/// have a stable mapping anyway.
fn symbol_to_coingecko_id(symbol: &str) -> Option<&'static str> {
    let id = match symbol.to_uppercase().as_str() {
        "BTC" => "bitcoin",
        "ETH" => "ethereum",
        "BNB" => "binancecoin",
        "SOL" => "solana",
        "XRP" => "ripple",
        "ADA" => "cardano",
        "AVAX" => "avalanche-2",
        "DOT" => "polkadot",
        "LINK" => "chainlink",
        "UNI" => "uniswap",
        "ATOM" => "cosmos",
        "ARB" => "arbitrum",
        "OP" => "optimism",
        "STRK" => "starknet",
        "BLUR" => "blur",
        _ => return None,
    };
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_ordering_futures_over_spot_over_aggregated() {
        assert!(ReferenceSource::BinanceFutures.confidence() > ReferenceSource::BinanceSpot.confidence());
        assert!(ReferenceSource::BybitFutures.confidence() > ReferenceSource::OkxSpot.confidence());
        assert!(ReferenceSource::BybitSpot.confidence() > ReferenceSource::Coingecko.confidence());
        for source in [
            ReferenceSource::BinanceFutures,
            ReferenceSource::BybitFutures,
            ReferenceSource::BinanceSpot,
            ReferenceSource::OkxSpot,
            ReferenceSource::BybitSpot,
            ReferenceSource::Coingecko,
        ] {
            let c = source.confidence();
            assert!((0.0..=1.0).contains(&c));
        }
    }

    #[test]
    fn coingecko_mapping_covers_majors_only() {
        assert_eq!(symbol_to_coingecko_id("btc"), Some("bitcoin"));
        assert_eq!(symbol_to_coingecko_id("SOL"), Some("solana"));
        assert_eq!(symbol_to_coingecko_id("FRESHTGE"), None);
    }
}
