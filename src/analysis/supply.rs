//! Five-factor supply-pressure classifier.
//!
//! Scores live in [-1, +1]: negative = constrained supply (premium tends to
//! hold), positive = smooth supply (premium tends to collapse). Degradation
//! rules: absent airdrop data redistributes the weights, factors below 0.3
//! confidence lose half their weight, and no factors at all yields UNKNOWN.

use tracing::{debug, info, warn};

use crate::config::{Thresholds, TurnoverThresholds};

/// Default factor weights.
const DEFAULT_WEIGHTS: [(&str, f64); 5] = [
    ("hot_wallet", 0.30),
    ("dex_liquidity", 0.25),
    ("withdrawal", 0.20),
    ("airdrop", 0.15),
    ("network", 0.10),
];

/// Redistributed weights when airdrop data is missing.
const FALLBACK_NO_AIRDROP: [(&str, f64); 4] = [
    ("hot_wallet", 0.35),
    ("dex_liquidity", 0.30),
    ("withdrawal", 0.23),
    ("network", 0.12),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupplyClassification {
    Constrained,
    Neutral,
    Smooth,
    Unknown,
}

impl SupplyClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupplyClassification::Constrained => "constrained",
            SupplyClassification::Neutral => "neutral",
            SupplyClassification::Smooth => "smooth",
            SupplyClassification::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupplyFactor {
    pub name: &'static str,
    pub raw_value: Option<f64>,
    pub score: f64,
    pub weight: f64,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct SupplyResult {
    pub classification: SupplyClassification,
    pub total_score: f64,
    pub confidence: f64,
    pub factors: Vec<SupplyFactor>,
    pub turnover_ratio: Option<f64>,
    pub warnings: Vec<String>,
}

impl SupplyResult {
    fn unknown(warning: String) -> Self {
        Self {
            classification: SupplyClassification::Unknown,
            total_score: 0.0,
            confidence: 0.0,
            factors: Vec::new(),
            turnover_ratio: None,
            warnings: vec![warning],
        }
    }
}

/// Inputs gathered best-effort by the caller; everything is optional.
#[derive(Debug, Clone, Default)]
pub struct SupplyInput {
    pub symbol: String,
    pub exchange: String,
    pub hot_wallet_usd: Option<f64>,
    pub hot_wallet_confidence: f64,
    pub dex_liquidity_usd: Option<f64>,
    pub dex_confidence: f64,
    pub withdrawal_open: Option<bool>,
    pub withdrawal_confidence: f64,
    pub airdrop_claim_rate: Option<f64>,
    pub airdrop_confidence: f64,
    pub network_speed_min: Option<f64>,
    pub network_confidence: f64,
    pub deposit_krw: Option<f64>,
    pub volume_5m_krw: Option<f64>,
}

pub struct SupplyClassifier {
    weights: Vec<(&'static str, f64)>,
    turnover: TurnoverThresholds,
}

impl SupplyClassifier {
    pub fn new(thresholds: &Thresholds) -> Self {
        // Config overrides apply to the default table; the no-airdrop
        // redistribution is used verbatim.
        let weights = DEFAULT_WEIGHTS
            .iter()
            .map(|(name, w)| {
                let w = thresholds
                    .supply_classifier_weights
                    .get(*name)
                    .copied()
                    .unwrap_or(*w);
                (*name, w)
            })
            .collect();
        Self { weights, turnover: thresholds.turnover_ratio }
    }

    pub fn classify(&self, data: &SupplyInput) -> SupplyResult {
        let mut factors: Vec<SupplyFactor> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        let weights: Vec<(&'static str, f64)> = if data.airdrop_claim_rate.is_none() {
            warnings.push("airdrop data missing, weights redistributed".into());
            FALLBACK_NO_AIRDROP.to_vec()
        } else {
            self.weights.clone()
        };

        if let Some(f) = self.score_hot_wallet(data, &weights) {
            factors.push(f);
        }
        if let Some(f) = self.score_dex_liquidity(data, &weights) {
            factors.push(f);
        }
        if let Some(f) = self.score_withdrawal(data, &weights) {
            factors.push(f);
        }
        if let Some(f) = self.score_airdrop(data, &weights) {
            factors.push(f);
        }
        if let Some(f) = self.score_network(data, &weights) {
            factors.push(f);
        }

        if factors.is_empty() {
            warn!(symbol = %data.symbol, exchange = %data.exchange, "supply UNKNOWN, no factors");
            return SupplyResult::unknown("no supply factor data available".into());
        }

        let mut total_score = 0.0;
        let mut total_weight = 0.0;
        for f in &factors {
            let mut effective = f.weight;
            if f.confidence < 0.3 {
                effective *= 0.5;
                warnings.push(format!(
                    "{} low confidence ({:.1}), weight halved",
                    f.name, f.confidence
                ));
            }
            total_score += f.score * effective;
            total_weight += effective;
        }
        if total_weight > 0.0 {
            total_score /= total_weight;
        }

        let weight_sum: f64 = factors.iter().map(|f| f.weight).sum();
        let confidence =
            factors.iter().map(|f| f.confidence * f.weight).sum::<f64>() / weight_sum;

        let turnover = self.turnover_ratio(data);
        if let Some(t) = turnover {
            let adjustment = self.turnover_adjustment(t);
            total_score = (total_score + adjustment) / 2.0;
            debug!(turnover = t, adjustment, "turnover blended into supply score");
        }

        let classification = classify_score(total_score);
        info!(
            symbol = %data.symbol,
            exchange = %data.exchange,
            classification = classification.as_str(),
            score = total_score,
            confidence,
            factors = factors.len(),
            "supply classified"
        );

        SupplyResult {
            classification,
            total_score,
            confidence,
            factors,
            turnover_ratio: turnover,
            warnings,
        }
    }

    fn weight_for(&self, weights: &[(&'static str, f64)], name: &str) -> f64 {
        weights.iter().find(|(n, _)| *n == name).map(|(_, w)| *w).unwrap_or(0.0)
    }

    fn score_hot_wallet(
        &self,
        data: &SupplyInput,
        weights: &[(&'static str, f64)],
    ) -> Option<SupplyFactor> {
        let hw = data.hot_wallet_usd?;
        let (score, label) = match hw {
            v if v >= 1_000_000.0 => (0.8, "ample"),
            v if v >= 500_000.0 => (0.4, "good"),
            v if v >= 100_000.0 => (0.0, "moderate"),
            v if v >= 50_000.0 => (-0.4, "thin"),
            _ => (-0.8, "very thin"),
        };
        Some(SupplyFactor {
            name: "hot_wallet",
            raw_value: Some(hw),
            score,
            weight: self.weight_for(weights, "hot_wallet"),
            confidence: data.hot_wallet_confidence,
            reason: format!("hot wallet ${:.0} ({})", hw, label),
        })
    }

    fn score_dex_liquidity(
        &self,
        data: &SupplyInput,
        weights: &[(&'static str, f64)],
    ) -> Option<SupplyFactor> {
        let dex = data.dex_liquidity_usd?;
        let (score, label) = match dex {
            v if v >= 500_000.0 => (0.8, "deep"),
            v if v >= 200_000.0 => (0.4, "good"),
            v if v >= 50_000.0 => (0.0, "moderate"),
            v if v >= 10_000.0 => (-0.4, "thin"),
            _ => (-0.8, "very thin"),
        };
        Some(SupplyFactor {
            name: "dex_liquidity",
            raw_value: Some(dex),
            score,
            weight: self.weight_for(weights, "dex_liquidity"),
            confidence: data.dex_confidence,
            reason: format!("DEX liquidity ${:.0} ({})", dex, label),
        })
    }

    fn score_withdrawal(
        &self,
        data: &SupplyInput,
        weights: &[(&'static str, f64)],
    ) -> Option<SupplyFactor> {
        let open = data.withdrawal_open?;
        let (score, reason) = if open {
            (0.6, "withdrawals open".to_string())
        } else {
            (-1.0, "withdrawals closed, supply blocked".to_string())
        };
        Some(SupplyFactor {
            name: "withdrawal",
            raw_value: Some(if open { 1.0 } else { 0.0 }),
            score,
            weight: self.weight_for(weights, "withdrawal"),
            confidence: data.withdrawal_confidence,
            reason,
        })
    }

    fn score_airdrop(
        &self,
        data: &SupplyInput,
        weights: &[(&'static str, f64)],
    ) -> Option<SupplyFactor> {
        let rate = data.airdrop_claim_rate?;
        let score = match rate {
            r if r >= 0.8 => 0.8,
            r if r >= 0.5 => 0.3,
            r if r >= 0.2 => -0.3,
            _ => -0.8,
        };
        Some(SupplyFactor {
            name: "airdrop",
            raw_value: Some(rate),
            score,
            weight: self.weight_for(weights, "airdrop"),
            confidence: data.airdrop_confidence,
            reason: format!("claim rate {:.0}%", rate * 100.0),
        })
    }

    fn score_network(
        &self,
        data: &SupplyInput,
        weights: &[(&'static str, f64)],
    ) -> Option<SupplyFactor> {
        let speed = data.network_speed_min?;
        let score = match speed {
            s if s <= 2.0 => 0.6,
            s if s <= 5.0 => 0.3,
            s if s <= 15.0 => 0.0,
            s if s <= 30.0 => -0.4,
            _ => -0.8,
        };
        Some(SupplyFactor {
            name: "network",
            raw_value: Some(speed),
            score,
            weight: self.weight_for(weights, "network"),
            confidence: data.network_confidence,
            reason: format!("transfer {:.0} min", speed),
        })
    }

    fn turnover_ratio(&self, data: &SupplyInput) -> Option<f64> {
        let deposit = data.deposit_krw?;
        let volume = data.volume_5m_krw?;
        if deposit <= 0.0 {
            return None;
        }
        Some(volume / deposit)
    }

    /// High turnover means trade volume dwarfs deposits: constrained (-).
    fn turnover_adjustment(&self, turnover: f64) -> f64 {
        if turnover >= self.turnover.extreme_high {
            -1.0
        } else if turnover >= self.turnover.high {
            -0.6
        } else if turnover >= self.turnover.normal {
            -0.2
        } else if turnover >= self.turnover.low {
            0.2
        } else {
            0.6
        }
    }
}

fn classify_score(score: f64) -> SupplyClassification {
    if score < -0.3 {
        SupplyClassification::Constrained
    } else if score > 0.3 {
        SupplyClassification::Smooth
    } else {
        SupplyClassification::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Thresholds;

    fn classifier() -> SupplyClassifier {
        SupplyClassifier::new(&Thresholds::default())
    }

    fn base_input() -> SupplyInput {
        SupplyInput {
            symbol: "XYZ".into(),
            exchange: "upbit".into(),
            hot_wallet_confidence: 0.8,
            dex_confidence: 0.8,
            withdrawal_confidence: 1.0,
            airdrop_confidence: 0.8,
            network_confidence: 0.8,
            ..Default::default()
        }
    }

    #[test]
    fn no_factors_is_unknown() {
        let r = classifier().classify(&base_input());
        assert_eq!(r.classification, SupplyClassification::Unknown);
        assert_eq!(r.confidence, 0.0);
        assert!(!r.warnings.is_empty());
    }

    #[test]
    fn blocked_supply_classifies_constrained() {
        let mut input = base_input();
        input.hot_wallet_usd = Some(20_000.0);
        input.dex_liquidity_usd = Some(5_000.0);
        input.withdrawal_open = Some(false);
        input.network_speed_min = Some(40.0);

        let r = classifier().classify(&input);
        assert_eq!(r.classification, SupplyClassification::Constrained);
        assert!(r.total_score < -0.3);
    }

    #[test]
    fn ample_supply_classifies_smooth() {
        let mut input = base_input();
        input.hot_wallet_usd = Some(5_000_000.0);
        input.dex_liquidity_usd = Some(2_000_000.0);
        input.withdrawal_open = Some(true);
        input.airdrop_claim_rate = Some(0.9);
        input.network_speed_min = Some(1.0);

        let r = classifier().classify(&input);
        assert_eq!(r.classification, SupplyClassification::Smooth);
    }

    #[test]
    fn missing_airdrop_redistributes_weights() {
        let mut input = base_input();
        input.hot_wallet_usd = Some(1_500_000.0);
        let r = classifier().classify(&input);
        assert!(r.warnings.iter().any(|w| w.contains("airdrop")));
        let hw = r.factors.iter().find(|f| f.name == "hot_wallet").unwrap();
        assert!((hw.weight - 0.35).abs() < 1e-9);
    }

    #[test]
    fn low_confidence_factor_weight_is_halved() {
        let mut input = base_input();
        input.hot_wallet_usd = Some(5_000_000.0);
        input.hot_wallet_confidence = 0.1;
        input.withdrawal_open = Some(false);

        let r = classifier().classify(&input);
        assert!(r.warnings.iter().any(|w| w.contains("weight halved")));
        // The strongly negative withdrawal factor dominates the weakened
        // hot-wallet signal.
        assert!(r.total_score < 0.0);
    }

    #[test]
    fn extreme_turnover_pulls_constrained() {
        let mut input = base_input();
        input.hot_wallet_usd = Some(300_000.0); // neutral factor
        input.deposit_krw = Some(1_000_000.0);
        input.volume_5m_krw = Some(50_000_000.0); // turnover 50x

        let r = classifier().classify(&input);
        assert_eq!(r.turnover_ratio, Some(50.0));
        assert_eq!(r.classification, SupplyClassification::Constrained);
    }
}
