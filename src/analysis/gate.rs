//! Go / No-Go gate.
//!
//! Single entry point `analyze_listing(symbol, exchange)`. The gate never
//! returns an error: every failure path degrades into a `GateResult`, either
//! with fewer enrichments or as a No-Go carrying a descriptive blocker.
//!
//! Hard blockers (any one forces No-Go): deposit closed, withdrawal closed,
//! non-positive net profit, transfer time over 30 minutes, VASP route
//! blocked, untrustworthy inputs (hardcoded FX / reference confidence below
//! 0.6 force watch-only).

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::analysis::cost_model::{CostModel, CostResult};
use crate::analysis::listing_type::{ListingTypeClassifier, ListingTypeResult};
use crate::analysis::premium::{
    fetch_bithumb_price, fetch_upbit_price, FxSource, PremiumCalculator,
};
use crate::analysis::reference_price::ReferencePriceFetcher;
use crate::analysis::scenario::{ScenarioCard, ScenarioInput, ScenarioPlanner, TgeRisk};
use crate::analysis::supply::{SupplyClassifier, SupplyInput, SupplyResult};
use crate::collectors::bithumb::OrderbookCache;
use crate::collectors::hot_wallet::HotWalletProbe;
use crate::config::{AppConfig, VaspStatus};
use crate::models::{AlertLevel, HedgeType, MarketCondition};
use crate::store::token_registry::TokenRegistry;

/// Cost basis for the slippage walk (KRW).
const DEFAULT_AMOUNT_KRW: f64 = 10_000_000.0;
/// Minimum global 24h volume before a liquidity warning.
const MIN_GLOBAL_VOLUME_USD: f64 = 100_000.0;
/// Maximum acceptable on-chain transfer time (minutes).
const MAX_TRANSFER_MIN: f64 = 30.0;
/// Reference confidence below this forces watch-only.
const WATCH_ONLY_CONFIDENCE: f64 = 0.6;
/// Reference confidence below this blocks CRITICAL alerts.
const CONSERVATIVE_CONFIDENCE: f64 = 0.8;

/// Everything the blocker evaluation needs, assembled by the pipeline or
/// handed in directly by tests.
#[derive(Debug, Clone)]
pub struct GateInput {
    pub symbol: String,
    pub exchange: String,
    pub premium_pct: f64,
    pub cost: CostResult,
    pub deposit_open: bool,
    pub withdrawal_open: bool,
    pub transfer_time_min: f64,
    pub global_volume_usd: f64,
    pub fx_rate: f64,
    pub fx_source: FxSource,
    pub hedge_type: HedgeType,
    pub network: String,
    pub top_exchange: String,
    pub reference_confidence: f64,
    pub domestic_price_krw: f64,
    pub global_price_usd: f64,
}

/// Gate decision plus enrichments.
#[derive(Debug, Clone)]
pub struct GateResult {
    pub symbol: String,
    pub exchange: String,
    pub can_proceed: bool,
    pub blockers: Vec<String>,
    pub warnings: Vec<String>,
    pub alert_level: AlertLevel,
    pub gate_input: Option<GateInput>,
    pub supply: Option<SupplyResult>,
    pub listing_type: Option<ListingTypeResult>,
    pub scenarios: Vec<ScenarioCard>,
}

impl GateResult {
    fn early_failure(symbol: &str, exchange: &str, blocker: String, level: AlertLevel) -> Self {
        Self {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            can_proceed: false,
            blockers: vec![blocker],
            warnings: Vec::new(),
            alert_level: level,
            gate_input: None,
            supply: None,
            listing_type: None,
            scenarios: Vec::new(),
        }
    }
}

pub struct GateChecker {
    premium: Arc<PremiumCalculator>,
    cost_model: CostModel,
    reference: ReferencePriceFetcher,
    supply: SupplyClassifier,
    listing_type: ListingTypeClassifier,
    scenario: ScenarioPlanner,
    config: AppConfig,
    client: reqwest::Client,
    orderbooks: Option<Arc<OrderbookCache>>,
    registry: Option<Arc<TokenRegistry>>,
    hot_wallet: Option<Arc<HotWalletProbe>>,
}

impl GateChecker {
    pub fn new(
        premium: Arc<PremiumCalculator>,
        config: AppConfig,
        listing_type: ListingTypeClassifier,
        orderbooks: Option<Arc<OrderbookCache>>,
        registry: Option<Arc<TokenRegistry>>,
        hot_wallet: Option<Arc<HotWalletProbe>>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            premium,
            cost_model: CostModel::new(config.fees.clone()),
            reference: ReferencePriceFetcher::new(std::env::var("COINGECKO_API_KEY").ok()),
            supply: SupplyClassifier::new(&config.thresholds),
            scenario: ScenarioPlanner::new(config.thresholds.clone()),
            listing_type,
            config,
            client,
            orderbooks,
            registry,
            hot_wallet,
        }
    }

    /// Full analysis pipeline for a freshly detected listing.
    pub async fn analyze_listing(&self, symbol: &str, exchange: &str) -> GateResult {
        // 1. FX + global references, fetched concurrently.
        let ((fx_rate, fx_source), vwap, reference) = tokio::join!(
            self.premium.get_real_fx(),
            self.premium.get_global_vwap(symbol),
            self.reference.get_reference_price(symbol),
        );

        // 2. Domestic ticker.
        let krw_price = self.fetch_domestic_price(symbol, exchange).await;
        let Some(krw_price) = krw_price.filter(|p| *p > 0.0) else {
            warn!(symbol, exchange, "domestic price unavailable");
            return GateResult::early_failure(
                symbol,
                exchange,
                format!("domestic price unavailable: {}@{}", symbol, exchange),
                AlertLevel::Low,
            );
        };

        // 3. Global price: VWAP preferred, reference price as fallback.
        let (global_usd, global_volume_usd, top_exchange) = match (&vwap, &reference) {
            (Some(v), _) => (
                v.price_usd,
                v.total_volume_usd,
                v.sources.first().copied().unwrap_or("").to_string(),
            ),
            (None, Some(r)) => (
                r.price_usd,
                r.volume_24h_usd.unwrap_or(0.0),
                r.source.as_str().to_string(),
            ),
            (None, None) => {
                warn!(symbol, "no global price from any source");
                return GateResult::early_failure(
                    symbol,
                    exchange,
                    "global price unavailable (no VWAP, no reference)".into(),
                    AlertLevel::Medium,
                );
            }
        };
        let reference_confidence = reference
            .as_ref()
            .map(|r| r.confidence)
            // Three live spot venues behind a VWAP rate as spot-tier trust.
            .unwrap_or(0.75);

        // 4. Premium.
        let premium = self.premium.calculate_premium(krw_price, global_usd, fx_rate, fx_source);

        // 5. Cost, using the Bithumb depth cache when the listing is there.
        let network = "ethereum".to_string();
        let hedge_type = HedgeType::None;
        let orderbook = if exchange == "bithumb" {
            self.orderbooks
                .as_ref()
                .and_then(|cache| cache.snapshot(&format!("{}_KRW", symbol)))
        } else {
            None
        };
        let cost = self.cost_model.calculate_total_cost(
            premium.premium_pct,
            &network,
            DEFAULT_AMOUNT_KRW,
            hedge_type,
            fx_rate,
            orderbook.as_ref(),
            exchange,
            "binance",
        );

        let transfer_time_min = self.config.networks.avg_transfer_min(&network);

        let gate_input = GateInput {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            premium_pct: premium.premium_pct,
            cost,
            // Deposit/withdrawal status probes are not wired; assume open.
            deposit_open: true,
            withdrawal_open: true,
            transfer_time_min,
            global_volume_usd,
            fx_rate,
            fx_source,
            hedge_type,
            network,
            top_exchange,
            reference_confidence,
            domestic_price_krw: krw_price,
            global_price_usd: global_usd,
        };

        let hot_wallet_usd = self.probe_hot_wallet(symbol, global_usd).await;

        let mut result = self.check_hard_blockers(gate_input);
        self.enrich(&mut result, hot_wallet_usd);
        result
    }

    /// Best-effort hot-wallet balance on the hedge venue, for the supply
    /// classifier. Needs the probe, a registry hit and a chain binding.
    async fn probe_hot_wallet(&self, symbol: &str, token_price_usd: f64) -> Option<f64> {
        let probe = self.hot_wallet.as_ref().filter(|p| p.is_enabled())?;
        let registry = self.registry.as_ref()?;
        let token = registry.get_by_symbol(symbol).ok().flatten()?;
        let chain = token.chains.first()?;
        probe
            .total_balance_usd(
                "binance",
                &chain.contract_address,
                chain.decimals.max(0) as u32,
                token_price_usd,
            )
            .await
    }

    /// Blocker/warning/alert-level evaluation over an assembled input.
    /// Public so decision tables can be exercised without the network.
    pub fn check_hard_blockers(&self, input: GateInput) -> GateResult {
        let mut blockers = Vec::new();
        let mut warnings = Vec::new();

        if !input.deposit_open {
            blockers.push(format!("deposit closed: {}", input.exchange));
        }
        if !input.withdrawal_open {
            blockers.push(format!("withdrawal closed: {}", input.exchange));
        }
        if input.cost.net_profit_pct <= 0.0 {
            blockers.push(format!(
                "unprofitable: net {:.2}% (premium {:.2}% - cost {:.2}%)",
                input.cost.net_profit_pct, input.premium_pct, input.cost.total_cost_pct
            ));
        }
        if input.transfer_time_min > MAX_TRANSFER_MIN {
            blockers.push(format!(
                "transfer too slow: {:.0} min (max {:.0})",
                input.transfer_time_min, MAX_TRANSFER_MIN
            ));
        }

        let vasp = self.config.vasp.route_status(&input.exchange, &input.top_exchange);
        if vasp == VaspStatus::Blocked {
            blockers.push(format!("VASP blocked: {} -> {}", input.exchange, input.top_exchange));
        }

        if input.global_volume_usd < MIN_GLOBAL_VOLUME_USD {
            warnings.push(format!(
                "thin global liquidity: 24h volume ${:.0} (min ${:.0})",
                input.global_volume_usd, MIN_GLOBAL_VOLUME_USD
            ));
        }
        if input.cost.gas_warn {
            warnings.push(format!(
                "gas warning: {} ({:.0} KRW)",
                input.network, input.cost.gas_cost_krw
            ));
        }
        if input.hedge_type == HedgeType::DexOnly {
            warnings.push("dex-only hedge: no CEX perpetual".to_string());
        }
        if matches!(vasp, VaspStatus::Partial | VaspStatus::Unknown) {
            warnings.push(format!(
                "VASP caution: {} -> {} ({:?})",
                input.exchange,
                input.top_exchange,
                vasp
            ));
        }

        // Watch-only: untrustworthy inputs override everything.
        if input.fx_source == FxSource::HardcodedFallback {
            blockers.push("FX is the hardcoded fallback, premium untrustworthy (watch-only)".into());
        }
        if input.reference_confidence < WATCH_ONLY_CONFIDENCE {
            blockers.push(format!(
                "reference confidence {:.2} below {:.1} (watch-only)",
                input.reference_confidence, WATCH_ONLY_CONFIDENCE
            ));
        } else if input.reference_confidence < CONSERVATIVE_CONFIDENCE {
            warnings.push(format!(
                "reference confidence {:.2}, conservative entry only",
                input.reference_confidence
            ));
        }

        let can_proceed = blockers.is_empty();
        let alert_level = determine_alert_level(can_proceed, &blockers, &warnings, &input);

        info!(
            symbol = %input.symbol,
            exchange = %input.exchange,
            decision = if can_proceed { "GO" } else { "NO-GO" },
            premium_pct = input.premium_pct,
            net_profit_pct = input.cost.net_profit_pct,
            blockers = blockers.len(),
            warnings = warnings.len(),
            level = alert_level.as_str(),
            "gate decision"
        );

        GateResult {
            symbol: input.symbol.clone(),
            exchange: input.exchange.clone(),
            can_proceed,
            blockers,
            warnings,
            alert_level,
            gate_input: Some(input),
            supply: None,
            listing_type: None,
            scenarios: Vec::new(),
        }
    }

    /// Feature-flagged enrichment: supply class, listing type, scenarios.
    /// Failures here never change the Go/No-Go decision.
    fn enrich(&self, result: &mut GateResult, hot_wallet_usd: Option<f64>) {
        let Some(input) = result.gate_input.clone() else {
            return;
        };
        let features = self.config.features;

        // Registry first-seen drives the TGE recency check. A fresh listing
        // whose insert has not committed yet reads back as no-data, which
        // the classifier resolves as assumed-TGE at low confidence.
        let first_listed_at = self
            .registry
            .as_ref()
            .and_then(|r| r.get_by_symbol(&input.symbol).ok().flatten())
            .and_then(|t| t.first_seen_at);

        let listing_type = self.listing_type.classify(
            &input.symbol,
            &input.exchange,
            &input.top_exchange,
            first_listed_at,
        );

        let supply = if features.supply_classifier {
            Some(self.supply.classify(&SupplyInput {
                symbol: input.symbol.clone(),
                exchange: input.exchange.clone(),
                hot_wallet_usd,
                hot_wallet_confidence: 0.8,
                withdrawal_open: Some(input.withdrawal_open),
                withdrawal_confidence: 1.0,
                network_speed_min: Some(input.transfer_time_min),
                network_confidence: 0.8,
                ..Default::default()
            }))
        } else {
            None
        };

        if features.scenario_planner {
            let scenario_input = ScenarioInput {
                symbol: input.symbol.clone(),
                exchange: input.exchange.clone(),
                supply: supply
                    .as_ref()
                    .map(|s| s.classification)
                    .unwrap_or(crate::analysis::supply::SupplyClassification::Unknown),
                listing_type: listing_type.listing_type,
                hedge_type: input.hedge_type,
                market_condition: MarketCondition::Neutral,
                tge_risk: TgeRisk::Unknown,
                reference_confidence: input.reference_confidence,
            };
            result.scenarios = self.scenario.generate_scenarios(&scenario_input);
        }

        result.listing_type = Some(listing_type);
        result.supply = supply;
    }

    async fn fetch_domestic_price(&self, symbol: &str, exchange: &str) -> Option<f64> {
        match exchange {
            "upbit" => fetch_upbit_price(&self.client, &format!("KRW-{}", symbol)).await,
            "bithumb" => fetch_bithumb_price(&self.client, symbol).await,
            _ => None,
        }
    }
}

fn determine_alert_level(
    can_proceed: bool,
    blockers: &[String],
    warnings: &[String],
    input: &GateInput,
) -> AlertLevel {
    if can_proceed {
        let trusted_fx = input.fx_source.is_trusted();
        let actionable = input.hedge_type != HedgeType::None;
        if trusted_fx && actionable && warnings.is_empty() {
            return AlertLevel::Critical;
        }
        return AlertLevel::High;
    }

    // Listing decisions are time-sensitive either way.
    if !blockers.is_empty() {
        return AlertLevel::High;
    }
    if !warnings.is_empty() {
        return AlertLevel::Low;
    }
    AlertLevel::Info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Orderbook, PriceLevel};
    use crate::store::database::{apply_migrations, default_migrations_dir, open_connection};
    use crate::store::writer::DatabaseWriter;

    fn checker() -> (tempfile::TempDir, GateChecker, Arc<DatabaseWriter>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.db").to_string_lossy().to_string();
        let conn = open_connection(&path).unwrap();
        apply_migrations(&conn, &default_migrations_dir()).unwrap();
        let writer = DatabaseWriter::new(conn, 1000);
        writer.start();

        let config = AppConfig::load(&AppConfig::default_dir()).unwrap();
        let premium = Arc::new(PremiumCalculator::new(writer.clone(), config.fx));
        let gate =
            GateChecker::new(premium, config, ListingTypeClassifier::new(None), None, None, None);
        (dir, gate, writer)
    }

    fn clean_go_input(gate: &GateChecker) -> GateInput {
        // Reference scenario: 1.5M KRW vs $1000 at 1350 (btc_implied).
        let premium_pct = (1_500_000.0 - 1000.0 * 1350.0) / (1000.0 * 1350.0) * 100.0;
        let book = Orderbook {
            asks: vec![
                PriceLevel { price: 10_000.0, qty: 1.0 },
                PriceLevel { price: 10_010.0, qty: 2.0 },
                PriceLevel { price: 10_020.0, qty: 3.0 },
                PriceLevel { price: 10_050.0, qty: 5.0 },
            ],
            bids: Vec::new(),
        };
        let cost = gate.cost_model.calculate_total_cost(
            premium_pct,
            "solana",
            10_000_000.0,
            HedgeType::Cex,
            1350.0,
            Some(&book),
            "upbit",
            "binance",
        );
        GateInput {
            symbol: "XYZ".into(),
            exchange: "upbit".into(),
            premium_pct,
            cost,
            deposit_open: true,
            withdrawal_open: true,
            transfer_time_min: 5.0,
            global_volume_usd: 500_000.0,
            fx_rate: 1350.0,
            fx_source: FxSource::BtcImplied,
            hedge_type: HedgeType::Cex,
            network: "solana".into(),
            top_exchange: "binance".into(),
            reference_confidence: 0.95,
            domestic_price_krw: 1_500_000.0,
            global_price_usd: 1000.0,
        }
    }

    #[test]
    fn clean_go_scenario() {
        let (_dir, gate, writer) = checker();
        let input = clean_go_input(&gate);
        assert!((input.premium_pct - 11.111).abs() < 0.01);

        let result = gate.check_hard_blockers(input);
        assert!(result.can_proceed);
        assert!(result.blockers.is_empty());
        let gi = result.gate_input.as_ref().unwrap();
        assert!(gi.cost.net_profit_pct > 0.0);
        assert!(matches!(result.alert_level, AlertLevel::Critical | AlertLevel::High));
        writer.shutdown();
    }

    #[test]
    fn hardcoded_fx_forces_watch_only() {
        let (_dir, gate, writer) = checker();
        let mut input = clean_go_input(&gate);
        input.fx_source = FxSource::HardcodedFallback;

        let result = gate.check_hard_blockers(input);
        assert!(!result.can_proceed);
        assert!(result.blockers.iter().any(|b| b.contains("watch-only")));
        writer.shutdown();
    }

    #[test]
    fn unprofitable_listing_blocks_with_high_alert() {
        let (_dir, gate, writer) = checker();
        let mut input = clean_go_input(&gate);
        input.premium_pct = 0.5;
        input.network = "ethereum".into();
        input.cost = gate.cost_model.calculate_total_cost(
            0.5,
            "ethereum",
            10_000_000.0,
            HedgeType::Cex,
            1350.0,
            None,
            "upbit",
            "binance",
        );

        let result = gate.check_hard_blockers(input);
        assert!(!result.can_proceed);
        assert!(result.gate_input.as_ref().unwrap().cost.net_profit_pct < 0.0);
        assert!(result.blockers.iter().any(|b| b.contains("unprofitable")));
        assert_eq!(result.alert_level, AlertLevel::High);
        writer.shutdown();
    }

    #[test]
    fn transfer_time_boundary() {
        let (_dir, gate, writer) = checker();

        let mut input = clean_go_input(&gate);
        input.transfer_time_min = 30.0;
        assert!(gate.check_hard_blockers(input).can_proceed);

        let mut input = clean_go_input(&gate);
        input.transfer_time_min = 30.01;
        let result = gate.check_hard_blockers(input);
        assert!(!result.can_proceed);
        assert!(result.blockers.iter().any(|b| b.contains("transfer")));
        writer.shutdown();
    }

    #[test]
    fn net_profit_boundary_is_strict() {
        let (_dir, gate, writer) = checker();

        let mut input = clean_go_input(&gate);
        input.cost.net_profit_pct = 0.0;
        assert!(!gate.check_hard_blockers(input).can_proceed);

        let mut input = clean_go_input(&gate);
        input.cost.net_profit_pct = 0.01;
        assert!(gate.check_hard_blockers(input).can_proceed);
        writer.shutdown();
    }

    #[test]
    fn deposit_or_withdrawal_closed_blocks() {
        let (_dir, gate, writer) = checker();

        let mut input = clean_go_input(&gate);
        input.deposit_open = false;
        assert!(!gate.check_hard_blockers(input).can_proceed);

        let mut input = clean_go_input(&gate);
        input.withdrawal_open = false;
        assert!(!gate.check_hard_blockers(input).can_proceed);
        writer.shutdown();
    }

    #[test]
    fn low_reference_confidence_forces_watch_only() {
        let (_dir, gate, writer) = checker();
        let mut input = clean_go_input(&gate);
        input.reference_confidence = 0.5;

        let result = gate.check_hard_blockers(input);
        assert!(!result.can_proceed);
        assert!(result.blockers.iter().any(|b| b.contains("watch-only")));

        // 0.6..0.8 only downgrades to a warning.
        let mut input = clean_go_input(&gate);
        input.reference_confidence = 0.7;
        let result = gate.check_hard_blockers(input);
        assert!(result.can_proceed);
        assert_ne!(result.alert_level, AlertLevel::Critical);
        writer.shutdown();
    }

    #[test]
    fn critical_needs_trusted_fx_hedge_and_no_warnings() {
        let (_dir, gate, writer) = checker();
        let input = clean_go_input(&gate);
        let result = gate.check_hard_blockers(input);
        // VASP upbit->binance is ok, volume and gas are fine: CRITICAL.
        assert_eq!(result.alert_level, AlertLevel::Critical);

        let mut input = clean_go_input(&gate);
        input.fx_source = FxSource::UsdtKrwDirect;
        let result = gate.check_hard_blockers(input);
        assert!(result.can_proceed);
        assert_eq!(result.alert_level, AlertLevel::High);

        let mut input = clean_go_input(&gate);
        input.global_volume_usd = 50_000.0;
        let result = gate.check_hard_blockers(input);
        assert!(result.can_proceed);
        assert_eq!(result.alert_level, AlertLevel::High);
        writer.shutdown();
    }

    #[test]
    fn dex_only_hedge_warns_but_passes() {
        let (_dir, gate, writer) = checker();
        let mut input = clean_go_input(&gate);
        input.hedge_type = HedgeType::DexOnly;
        let result = gate.check_hard_blockers(input);
        assert!(result.can_proceed);
        assert!(result.warnings.iter().any(|w| w.contains("dex-only")));
        writer.shutdown();
    }
}
