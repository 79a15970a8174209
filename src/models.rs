//! Shared core types.
//!
//! Tagged enums for everything that crosses component boundaries; strings
//! appear only at serialisation edges.

use serde::{Deserialize, Serialize};

/// One price level of an orderbook side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    pub qty: f64,
}

/// Explicitly-typed orderbook snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Orderbook {
    pub asks: Vec<PriceLevel>,
    pub bids: Vec<PriceLevel>,
}

impl Orderbook {
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }
}

/// Alert severity, driving the router's delivery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertLevel {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Critical => "CRITICAL",
            AlertLevel::High => "HIGH",
            AlertLevel::Medium => "MEDIUM",
            AlertLevel::Low => "LOW",
            AlertLevel::Info => "INFO",
        }
    }
}

/// Hedge availability for the global short leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HedgeType {
    /// CEX perpetual short available.
    Cex,
    /// Only a decentralised perpetual exists.
    DexOnly,
    /// Unhedgeable.
    None,
}

impl HedgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HedgeType::Cex => "cex",
            HedgeType::DexOnly => "dex_only",
            HedgeType::None => "none",
        }
    }
}

/// Broad market regime used by the scenario planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketCondition {
    Bull,
    Neutral,
    Bear,
}

impl MarketCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketCondition::Bull => "bull",
            MarketCondition::Neutral => "neutral",
            MarketCondition::Bear => "bear",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_levels_are_ordered() {
        assert!(AlertLevel::Critical > AlertLevel::High);
        assert!(AlertLevel::High > AlertLevel::Medium);
        assert!(AlertLevel::Medium > AlertLevel::Low);
        assert!(AlertLevel::Low > AlertLevel::Info);
    }

    #[test]
    fn hedge_type_round_trips_snake_case() {
        let json = serde_json::to_string(&HedgeType::DexOnly).unwrap();
        assert_eq!(json, "\"dex_only\"");
    }
}
