//! Exchange hot-wallet balance probe (EVM JSON-RPC).
//!
//! Feeds the supply classifier's hot-wallet factor. Disabled entirely when
//! `WALLET_RPC_URL` is unset; RPC failures fall back to the stale cache.
//! Balances are stable on the minutes scale, so the cache TTL is 15 min.

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const HOT_WALLET_TTL: Duration = Duration::from_secs(900);
/// ERC-20 `balanceOf(address)` selector.
const BALANCE_OF_SELECTOR: &str = "0x70a08231";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HotWalletsConfig {
    /// exchange -> labelled wallet addresses.
    pub hot_wallets: HashMap<String, Vec<WalletEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletEntry {
    pub address: String,
    #[serde(default)]
    pub label: String,
}

struct CachedBalance {
    usd: f64,
    fetched_at: Instant,
}

pub struct HotWalletProbe {
    rpc_url: Option<String>,
    client: reqwest::Client,
    wallets: HotWalletsConfig,
    cache: Mutex<HashMap<String, CachedBalance>>,
}

impl HotWalletProbe {
    /// `rpc_url` falls back to `WALLET_RPC_URL`; `None` disables the probe.
    pub fn new(config_dir: &Path, rpc_url: Option<String>) -> Self {
        let rpc_url = rpc_url.or_else(|| std::env::var("WALLET_RPC_URL").ok());
        if rpc_url.is_none() {
            warn!("WALLET_RPC_URL unset, hot-wallet tracking disabled");
        }

        let wallets = std::fs::read_to_string(config_dir.join("hot_wallets.yaml"))
            .ok()
            .and_then(|text| serde_yaml::from_str(&text).ok())
            .unwrap_or_default();

        Self {
            rpc_url,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            wallets,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.rpc_url.is_some()
    }

    /// Sum the configured hot wallets' token balance in USD.
    ///
    /// `None` when disabled, unconfigured, or every call failed with no
    /// cache to fall back on.
    pub async fn total_balance_usd(
        &self,
        exchange: &str,
        contract_address: &str,
        decimals: u32,
        token_price_usd: f64,
    ) -> Option<f64> {
        let rpc_url = self.rpc_url.as_ref()?;
        let cache_key = format!("{}:{}", exchange, contract_address);

        if let Some(cached) = self.cache.lock().get(&cache_key) {
            if cached.fetched_at.elapsed() < HOT_WALLET_TTL {
                return Some(cached.usd);
            }
        }

        let wallets = self.wallets.hot_wallets.get(exchange)?;
        let mut total_raw: f64 = 0.0;
        let mut any_success = false;

        for wallet in wallets {
            match self.balance_of(rpc_url, contract_address, &wallet.address).await {
                Some(raw) => {
                    any_success = true;
                    total_raw += raw;
                }
                None => debug!(
                    exchange,
                    wallet = %wallet.label,
                    "hot wallet balance call failed"
                ),
            }
        }

        if !any_success {
            // Degrade to the stale cache rather than returning nothing.
            return self.cache.lock().get(&cache_key).map(|c| c.usd);
        }

        let usd = total_raw / 10f64.powi(decimals as i32) * token_price_usd;
        self.cache
            .lock()
            .insert(cache_key, CachedBalance { usd, fetched_at: Instant::now() });
        Some(usd)
    }

    async fn balance_of(&self, rpc_url: &str, contract: &str, holder: &str) -> Option<f64> {
        let data = encode_balance_of(holder)?;
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [{ "to": contract, "data": data }, "latest"],
        });
        let resp = self.client.post(rpc_url).json(&payload).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        let hex_result = body.get("result")?.as_str()?;
        parse_hex_amount(hex_result)
    }
}

/// `balanceOf(address)` calldata: selector + 32-byte left-padded address.
fn encode_balance_of(holder: &str) -> Option<String> {
    let stripped = holder.strip_prefix("0x").unwrap_or(holder);
    if stripped.len() != 40 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("{}{:0>64}", BALANCE_OF_SELECTOR, stripped.to_lowercase()))
}

/// Hex quantity -> f64. Balances exceed u64, so fold digits as float.
fn parse_hex_amount(hex_str: &str) -> Option<f64> {
    let stripped = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    if stripped.is_empty() {
        return None;
    }
    let mut value: f64 = 0.0;
    for c in stripped.chars() {
        value = value * 16.0 + c.to_digit(16)? as f64;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calldata_is_selector_plus_padded_address() {
        let data = encode_balance_of("0x28C6c06298d514Db089934071355E5743bf21d60").unwrap();
        assert!(data.starts_with(BALANCE_OF_SELECTOR));
        assert_eq!(data.len(), 10 + 64);
        assert!(data.ends_with("28c6c06298d514db089934071355e5743bf21d60"));
    }

    #[test]
    fn malformed_address_is_rejected(){
        assert!(encode_balance_of("0x1234").is_none());
        assert!(encode_balance_of("not-an-address").is_none());
    }

    #[test]
    fn hex_amounts_parse_including_large() {
        assert_eq!(parse_hex_amount("0x0"), Some(0.0));
        assert_eq!(parse_hex_amount("0xff"), Some(255.0));
        // 1e24-ish values survive as floats.
        let big = parse_hex_amount("0xd3c21bcecceda1000000").unwrap();
        assert!(big > 9.9e23 && big < 1.1e24);
        assert_eq!(parse_hex_amount("0xzz"), None);
    }

    #[test]
    fn disabled_without_rpc_url() {
        std::env::remove_var("WALLET_RPC_URL");
        let probe = HotWalletProbe::new(Path::new("/nonexistent"), None);
        assert!(!probe.is_enabled());
    }
}
