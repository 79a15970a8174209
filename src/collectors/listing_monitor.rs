//! New-listing detection via catalog diffing.
//!
//! Each exchange catalog is polled on its own cadence (30s Upbit, 60s
//! Bithumb). The first successful fetch seeds the baseline; afterwards the
//! set difference is the candidate listing set. A poll introducing more
//! than [`FALSE_POSITIVE_THRESHOLD`] symbols at once is treated as a
//! catalog reshuffle: the baseline resets and nothing fires.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::alerts::telegram::TelegramAlert;
use crate::analysis::gate::{GateChecker, GateResult};
use crate::collectors::robust_ws::CollectorHandle;
use crate::metrics::latency::LatencyTracker;
use crate::metrics::observability::{log_gate_analysis, record_listing_history};
use crate::store::token_registry::{fetch_token_by_symbol, TokenIdentity, TokenRegistry};
use crate::store::writer::DatabaseWriter;

/// More new symbols than this in one poll means a stale baseline.
const FALSE_POSITIVE_THRESHOLD: usize = 10;
/// Failure streak at which the log level escalates.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Initial-fetch retry attempts.
const INITIAL_FETCH_ATTEMPTS: u32 = 3;

/// One exchange's listable-symbol catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn exchange(&self) -> &'static str;
    fn interval(&self) -> Duration;
    /// Current KRW-listable symbols.
    async fn fetch_catalog(&self) -> anyhow::Result<HashSet<String>>;
    /// Symbol -> WS market code for the collector subscription.
    fn market_code(&self, symbol: &str) -> String;
}

/// Outcome of one diff evaluation (pure; drives the poll loop).
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    NoChange,
    NewListings(Vec<String>),
    BaselineReset(usize),
}

/// Diff `current` against the baseline, applying the false-positive guard.
/// The baseline is always advanced to `current`.
pub fn evaluate_poll(baseline: &mut HashSet<String>, current: HashSet<String>) -> PollOutcome {
    let new_symbols: Vec<String> = current.difference(baseline).cloned().collect();
    let outcome = if new_symbols.is_empty() {
        PollOutcome::NoChange
    } else if new_symbols.len() > FALSE_POSITIVE_THRESHOLD {
        PollOutcome::BaselineReset(new_symbols.len())
    } else {
        PollOutcome::NewListings(new_symbols)
    };
    *baseline = current;
    outcome
}

pub struct ListingMonitor {
    writer: Arc<DatabaseWriter>,
    registry: Arc<TokenRegistry>,
    gate: Arc<GateChecker>,
    alert: Arc<TelegramAlert>,
    collectors: HashMap<&'static str, CollectorHandle>,
}

impl ListingMonitor {
    pub fn new(
        writer: Arc<DatabaseWriter>,
        registry: Arc<TokenRegistry>,
        gate: Arc<GateChecker>,
        alert: Arc<TelegramAlert>,
        collectors: HashMap<&'static str, CollectorHandle>,
    ) -> Self {
        Self { writer, registry, gate, alert, collectors }
    }

    /// Poll one catalog source until stopped.
    pub async fn run_source(&self, source: &dyn CatalogSource, mut stop: watch::Receiver<bool>) {
        let exchange = source.exchange();
        let mut baseline: HashSet<String> = HashSet::new();
        let mut baseline_set = false;
        let mut consecutive_failures: u32 = 0;

        // Initial baseline, bounded retries.
        for attempt in 1..=INITIAL_FETCH_ATTEMPTS {
            match source.fetch_catalog().await {
                Ok(catalog) => {
                    info!(exchange, markets = catalog.len(), "initial catalog loaded");
                    baseline = catalog;
                    baseline_set = true;
                    break;
                }
                Err(e) => {
                    warn!(exchange, attempt, error = %e, "initial catalog fetch failed");
                    if attempt < INITIAL_FETCH_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
                    }
                }
            }
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(source.interval()) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                    continue;
                }
            }

            let current = match source.fetch_catalog().await {
                Ok(c) => {
                    consecutive_failures = 0;
                    c
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        error!(exchange, streak = consecutive_failures, error = %e, "catalog fetch failing");
                    } else {
                        warn!(exchange, streak = consecutive_failures, error = %e, "catalog fetch failed");
                    }
                    continue;
                }
            };

            // A diff may only fire after a successful baseline.
            if !baseline_set {
                info!(exchange, markets = current.len(), "baseline established");
                baseline = current;
                baseline_set = true;
                continue;
            }

            match evaluate_poll(&mut baseline, current) {
                PollOutcome::NoChange => {}
                PollOutcome::BaselineReset(count) => {
                    warn!(exchange, count, "mass catalog change, baseline reset without alerts");
                }
                PollOutcome::NewListings(symbols) => {
                    for symbol in symbols {
                        self.on_new_listing(source, &symbol).await;
                    }
                }
            }
        }
    }

    /// Full handling for one confirmed new listing.
    async fn on_new_listing(&self, source: &dyn CatalogSource, symbol: &str) {
        let exchange = source.exchange();
        error!(symbol, exchange, "NEW LISTING DETECTED");

        let mut tracker = LatencyTracker::new(symbol, exchange, "listing");
        tracker.mark_detect();

        self.register_token(symbol).await;

        if let Some(handle) = self.collectors.get(exchange) {
            handle.add_market(&source.market_code(symbol));
        }

        tracker.mark_analyze_start();
        let started = std::time::Instant::now();
        let result = self.gate.analyze_listing(symbol, exchange).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        tracker.mark_analyze_end();

        log_gate_analysis(&self.writer, &result, duration_ms);
        record_listing_history(&self.writer, &result, None);

        let message = format_alert(symbol, exchange, &result);
        self.alert
            .send(result.alert_level, &message, Some(&format!("listing:{}", symbol)))
            .await;
        tracker.mark_alert_sent();
        tracker.set_result(result.alert_level.as_str(), result.can_proceed);
        tracker.save(&self.writer);
    }

    /// Register the symbol: CoinGecko enrichment when possible, otherwise a
    /// minimal row so the identity at least exists.
    async fn register_token(&self, symbol: &str) {
        match self.registry.get_by_symbol(symbol) {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!(symbol, error = %e, "registry lookup failed");
                return;
            }
        }
        let token = fetch_token_by_symbol(symbol)
            .await
            .unwrap_or_else(|| TokenIdentity::minimal(symbol));
        self.registry.insert(&token);
    }
}

/// Compact alert body from a gate decision.
pub fn format_alert(symbol: &str, exchange: &str, result: &GateResult) -> String {
    let status = if result.can_proceed { "GO" } else { "NO-GO" };
    let mut lines = vec![format!("*{}* | {} @ {}", status, symbol, exchange.to_uppercase())];

    if let Some(gi) = &result.gate_input {
        lines.push(format!(
            "premium: {:+.2}% | net: {:+.2}%",
            gi.premium_pct, gi.cost.net_profit_pct
        ));
        lines.push(format!(
            "fx: {} ({:.2}% cost)",
            gi.fx_source.as_str(),
            gi.cost.total_cost_pct
        ));
    }
    if !result.blockers.is_empty() {
        lines.push("blockers:".into());
        for b in &result.blockers {
            lines.push(format!("  - {}", b));
        }
    }
    if !result.warnings.is_empty() {
        lines.push("warnings:".into());
        for w in &result.warnings {
            lines.push(format!("  - {}", w));
        }
    }
    if let Some(card) = result.scenarios.iter().find(|c| c.kind == crate::analysis::scenario::ScenarioKind::Likely) {
        lines.push(format!(
            "scenario: {} ({:.0}%)",
            card.outcome.as_str(),
            card.probability * 100.0
        ));
    }

    lines.join("\n")
}

// =============================================================================
// Catalog sources
// =============================================================================

pub struct UpbitCatalog {
    client: reqwest::Client,
}

impl UpbitCatalog {
    pub fn new() -> Self {
        Self { client: http_client() }
    }
}

impl Default for UpbitCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogSource for UpbitCatalog {
    fn exchange(&self) -> &'static str {
        "upbit"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn fetch_catalog(&self) -> anyhow::Result<HashSet<String>> {
        #[derive(serde::Deserialize)]
        struct MarketRow {
            market: String,
        }
        let rows: Vec<MarketRow> = self
            .client
            .get("https://api.upbit.com/v1/market/all")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        // KRW markets only; BTC/USDT quote markets are not listings we act on.
        Ok(rows
            .into_iter()
            .filter_map(|r| r.market.strip_prefix("KRW-").map(str::to_string))
            .collect())
    }

    fn market_code(&self, symbol: &str) -> String {
        format!("KRW-{}", symbol)
    }
}

pub struct BithumbCatalog {
    client: reqwest::Client,
}

impl BithumbCatalog {
    pub fn new() -> Self {
        Self { client: http_client() }
    }
}

impl Default for BithumbCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogSource for BithumbCatalog {
    fn exchange(&self) -> &'static str {
        "bithumb"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn fetch_catalog(&self) -> anyhow::Result<HashSet<String>> {
        let body: serde_json::Value = self
            .client
            .get("https://api.bithumb.com/public/ticker/ALL_KRW")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if body.get("status").and_then(|s| s.as_str()) != Some("0000") {
            anyhow::bail!(
                "bithumb API error: {}",
                body.get("message").and_then(|m| m.as_str()).unwrap_or("unknown")
            );
        }
        let data = body
            .get("data")
            .and_then(|d| d.as_object())
            .ok_or_else(|| anyhow::anyhow!("bithumb ticker payload missing data"))?;
        Ok(data.keys().filter(|k| *k != "date").cloned().collect())
    }

    fn market_code(&self, symbol: &str) -> String {
        format!("{}_KRW", symbol)
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(symbols: &[&str]) -> HashSet<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_change_when_sets_match() {
        let mut baseline = set(&["BTC", "ETH"]);
        assert_eq!(evaluate_poll(&mut baseline, set(&["BTC", "ETH"])), PollOutcome::NoChange);
    }

    #[test]
    fn detects_single_new_listing() {
        let mut baseline = set(&["BTC", "ETH"]);
        let outcome = evaluate_poll(&mut baseline, set(&["BTC", "ETH", "XYZ"]));
        assert_eq!(outcome, PollOutcome::NewListings(vec!["XYZ".to_string()]));
        // Baseline advanced: a second poll is quiet.
        assert_eq!(evaluate_poll(&mut baseline, set(&["BTC", "ETH", "XYZ"])), PollOutcome::NoChange);
    }

    #[test]
    fn exactly_ten_fires_eleven_resets() {
        let base: Vec<String> = (0..5).map(|i| format!("OLD{}", i)).collect();

        let mut baseline: HashSet<String> = base.iter().cloned().collect();
        let mut current: HashSet<String> = baseline.clone();
        for i in 0..10 {
            current.insert(format!("NEW{}", i));
        }
        match evaluate_poll(&mut baseline, current) {
            PollOutcome::NewListings(symbols) => assert_eq!(symbols.len(), 10),
            other => panic!("expected 10 listings, got {:?}", other),
        }

        let mut baseline: HashSet<String> = base.iter().cloned().collect();
        let mut current: HashSet<String> = baseline.clone();
        for i in 0..11 {
            current.insert(format!("NEW{}", i));
        }
        assert_eq!(evaluate_poll(&mut baseline, current), PollOutcome::BaselineReset(11));
        // Baseline silently adopted the storm.
        assert!(baseline.contains("NEW0"));
        assert_eq!(baseline.len(), 16);
    }

    #[test]
    fn delisting_does_not_fire() {
        let mut baseline = set(&["BTC", "ETH", "DOGE"]);
        assert_eq!(evaluate_poll(&mut baseline, set(&["BTC", "ETH"])), PollOutcome::NoChange);
        assert_eq!(baseline.len(), 2);
    }

    #[test]
    fn market_codes_per_exchange() {
        assert_eq!(UpbitCatalog::new().market_code("XYZ"), "KRW-XYZ");
        assert_eq!(BithumbCatalog::new().market_code("XYZ"), "XYZ_KRW");
    }
}
