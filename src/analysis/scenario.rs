//! Probabilistic outcome planner.
//!
//! A per-exchange base rate plus additive coefficients (supply, hedge,
//! market regime, TGE unlock risk) yields a "positive outcome" probability.
//! Coefficients backed by fewer observations than `min_sample_size` are
//! shrunk toward zero: `effective = raw * min(1, n / n_min)`. Sample counts
//! live in `thresholds.yaml` so they stay auditable.

use tracing::{debug, info};

use crate::analysis::listing_type::ListingType;
use crate::analysis::supply::SupplyClassification;
use crate::config::Thresholds;
use crate::models::{HedgeType, MarketCondition};

/// Predicted outcome bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioOutcome {
    /// Premium expected to spike hard (>= 30%).
    HeungBig,
    /// Sustained meaningful premium.
    Heung,
    Neutral,
    /// Premium expected to fade or invert.
    Mang,
}

impl ScenarioOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioOutcome::HeungBig => "heung_big",
            ScenarioOutcome::Heung => "heung",
            ScenarioOutcome::Neutral => "neutral",
            ScenarioOutcome::Mang => "mang",
        }
    }
}

/// TGE unlock risk bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TgeRisk {
    VeryHigh,
    High,
    Medium,
    Low,
    VeryLow,
    #[default]
    Unknown,
}

impl TgeRisk {
    fn coeff_key(&self) -> &'static str {
        match self {
            TgeRisk::VeryHigh => "tge_very_high",
            TgeRisk::High => "tge_high",
            TgeRisk::Medium => "tge_medium",
            TgeRisk::Low => "tge_low",
            TgeRisk::VeryLow => "tge_very_low",
            TgeRisk::Unknown => "tge_unknown",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TgeRisk::VeryHigh => "very_high",
            TgeRisk::High => "high",
            TgeRisk::Medium => "medium",
            TgeRisk::Low => "low",
            TgeRisk::VeryLow => "very_low",
            TgeRisk::Unknown => "unknown",
        }
    }
}

/// Which assumption set produced a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioKind {
    Best,
    Likely,
    Worst,
}

impl ScenarioKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioKind::Best => "best",
            ScenarioKind::Likely => "likely",
            ScenarioKind::Worst => "worst",
        }
    }
}

/// Inputs for one card.
#[derive(Debug, Clone)]
pub struct ScenarioInput {
    pub symbol: String,
    pub exchange: String,
    pub supply: SupplyClassification,
    pub listing_type: ListingType,
    pub hedge_type: HedgeType,
    pub market_condition: MarketCondition,
    pub tge_risk: TgeRisk,
    pub reference_confidence: f64,
}

/// One predicted scenario.
#[derive(Debug, Clone)]
pub struct ScenarioCard {
    pub symbol: String,
    pub exchange: String,
    pub kind: ScenarioKind,
    pub probability: f64,
    pub supply_contribution: f64,
    pub hedge_contribution: f64,
    pub market_contribution: f64,
    pub tge_contribution: f64,
    pub outcome: ScenarioOutcome,
    pub confidence: f64,
    pub factors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct ScenarioPlanner {
    thresholds: Thresholds,
    use_upbit_base: bool,
}

impl ScenarioPlanner {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds, use_upbit_base: true }
    }

    fn raw_coeff(&self, key: &str) -> f64 {
        self.thresholds.scenario_coefficients.get(key).copied().unwrap_or(0.0)
    }

    /// Shrink an under-sampled coefficient toward zero.
    fn coeff(&self, key: &str) -> f64 {
        let raw = self.raw_coeff(key);
        let n = self.thresholds.scenario_sample_counts.get(key).copied().unwrap_or(0);
        let n_min = self.thresholds.coefficient_governance.min_sample_size.max(1);
        if n >= n_min {
            return raw;
        }
        let shrunk = raw * (n as f64 / n_min as f64);
        debug!(key, raw, shrunk, samples = n, min = n_min, "coefficient shrinkage");
        shrunk
    }

    fn base_probability(&self, exchange: &str) -> f64 {
        if self.use_upbit_base && exchange.eq_ignore_ascii_case("upbit") {
            self.thresholds
                .scenario_coefficients
                .get("base_probability_upbit")
                .copied()
                .unwrap_or(0.42)
        } else {
            self.thresholds
                .scenario_coefficients
                .get("base_probability")
                .copied()
                .unwrap_or(0.51)
        }
    }

    fn probability(&self, input: &ScenarioInput) -> (f64, f64, f64, f64, f64) {
        let base = self.base_probability(&input.exchange);

        let supply = match input.supply {
            SupplyClassification::Constrained => self.coeff("supply_constrained"),
            SupplyClassification::Smooth => self.coeff("supply_smooth"),
            _ => 0.0,
        };
        let hedge = match input.hedge_type {
            HedgeType::Cex => self.coeff("hedge_cex"),
            HedgeType::DexOnly => self.coeff("hedge_dex_only"),
            HedgeType::None => self.coeff("hedge_none"),
        };
        let market = match input.market_condition {
            MarketCondition::Bull => self.coeff("market_bull"),
            MarketCondition::Neutral => self.coeff("market_neutral"),
            MarketCondition::Bear => self.coeff("market_bear"),
        };
        let tge = self.coeff(input.tge_risk.coeff_key());

        let mut total = base + supply + hedge + market + tge;

        // Low reference confidence pulls the estimate conservative.
        if input.reference_confidence < 0.8 {
            total -= (0.8 - input.reference_confidence) * 0.5;
        }

        (total.clamp(0.0, 1.0), supply, hedge, market, tge)
    }

    fn predict(&self, probability: f64, input: &ScenarioInput) -> (ScenarioOutcome, f64) {
        if input.hedge_type == HedgeType::None
            && input.supply == SupplyClassification::Constrained
            && probability >= 0.7
        {
            return (ScenarioOutcome::HeungBig, probability);
        }
        if probability >= 0.50 {
            return (ScenarioOutcome::Heung, probability);
        }
        if probability >= 0.40 {
            return (ScenarioOutcome::Neutral, 1.0 - (probability - 0.45).abs() * 4.0);
        }
        (ScenarioOutcome::Mang, 1.0 - probability)
    }

    /// Build one card from the given assumption set.
    pub fn generate_card(&self, input: &ScenarioInput, kind: ScenarioKind) -> ScenarioCard {
        let (probability, supply_c, hedge_c, market_c, tge_c) = self.probability(input);
        let (outcome, mut confidence) = self.predict(probability, input);

        if input.reference_confidence < 0.8 {
            confidence *= input.reference_confidence;
        }

        let mut factors = vec![
            format!("supply {} ({:+.1}pp)", input.supply.as_str(), supply_c * 100.0),
            format!("hedge {} ({:+.1}pp)", input.hedge_type.as_str(), hedge_c * 100.0),
            format!(
                "market {} ({:+.1}pp)",
                input.market_condition.as_str(),
                market_c * 100.0
            ),
            format!("listing type {}", input.listing_type.as_str()),
        ];
        if input.tge_risk != TgeRisk::Unknown {
            factors.push(format!("TGE risk {} ({:+.1}pp)", input.tge_risk.as_str(), tge_c * 100.0));
        }

        let mut warnings = Vec::new();
        if input.supply == SupplyClassification::Unknown {
            warnings.push("supply data missing, prediction weakly grounded".to_string());
        }
        if input.listing_type == ListingType::Unknown {
            warnings.push("listing type unresolved".to_string());
        }
        if matches!(input.hedge_type, HedgeType::DexOnly | HedgeType::None) {
            warnings.push(format!(
                "hedge '{}' coefficient is under-sampled (shrinkage applied)",
                input.hedge_type.as_str()
            ));
        }
        if input.reference_confidence < 0.6 {
            warnings.push(format!(
                "reference price confidence {:.0}%, watch-only recommended",
                input.reference_confidence * 100.0
            ));
        } else if input.reference_confidence < 0.8 {
            warnings.push(format!(
                "reference price confidence {:.0}%, conservative entry",
                input.reference_confidence * 100.0
            ));
        }
        if confidence < 0.5 {
            warnings.push(format!("prediction confidence low ({:.0}%)", confidence * 100.0));
        }

        info!(
            symbol = %input.symbol,
            exchange = %input.exchange,
            kind = kind.as_str(),
            outcome = outcome.as_str(),
            probability,
            "scenario card generated"
        );

        ScenarioCard {
            symbol: input.symbol.clone(),
            exchange: input.exchange.clone(),
            kind,
            probability,
            supply_contribution: supply_c,
            hedge_contribution: hedge_c,
            market_contribution: market_c,
            tge_contribution: tge_c,
            outcome,
            confidence,
            factors,
            warnings,
        }
    }

    /// BEST / LIKELY / WORST cards from perturbed assumptions.
    pub fn generate_scenarios(&self, input: &ScenarioInput) -> Vec<ScenarioCard> {
        let mut best_input = input.clone();
        best_input.market_condition = MarketCondition::Bull;
        if !matches!(input.tge_risk, TgeRisk::Low | TgeRisk::VeryLow) {
            best_input.tge_risk = TgeRisk::Unknown;
        }

        let mut worst_input = input.clone();
        worst_input.market_condition = MarketCondition::Bear;
        worst_input.reference_confidence = input.reference_confidence.min(0.6);

        vec![
            self.generate_card(&best_input, ScenarioKind::Best),
            self.generate_card(input, ScenarioKind::Likely),
            self.generate_card(&worst_input, ScenarioKind::Worst),
        ]
    }
}
