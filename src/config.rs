//! YAML configuration layer.
//!
//! Each file is optional: a missing file falls back to shipped defaults with
//! a warning, while an unparseable file is a fatal startup error.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Root configuration bundle loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub fees: FeesConfig,
    pub networks: NetworksConfig,
    pub fx: FxConfig,
    pub vasp: VaspMatrix,
    pub features: Features,
    pub thresholds: Thresholds,
}

impl AppConfig {
    /// Load every config file from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            fees: load_yaml(dir, "fees.yaml")?,
            networks: load_yaml(dir, "networks.yaml")?,
            fx: load_yaml::<ExchangesFile>(dir, "exchanges.yaml")?.fx,
            vasp: load_yaml(dir, "vasp_matrix.yaml")?,
            features: load_yaml::<FeaturesFile>(dir, "features.yaml")?.features,
            thresholds: load_yaml(dir, "thresholds.yaml")?,
        })
    }

    /// Default config directory: `config/` next to the crate manifest.
    pub fn default_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config")
    }
}

fn load_yaml<T: for<'de> Deserialize<'de> + Default>(dir: &Path, name: &str) -> Result<T> {
    let path = dir.join(name);
    if !path.exists() {
        warn!(file = name, "config file missing, using shipped defaults");
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("invalid YAML in {}", path.display()))
}

// =============================================================================
// fees.yaml
// =============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FeesConfig {
    pub trading_fees: HashMap<String, FeeTier>,
    pub hedge_fees: HedgeFees,
    pub withdrawal_fees: HashMap<String, WithdrawalFee>,
    pub cost_thresholds: CostThresholds,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FeeTier {
    pub maker: f64,
    pub taker: f64,
}

impl Default for FeeTier {
    fn default() -> Self {
        Self { maker: 0.0005, taker: 0.0005 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HedgeFees {
    pub cex_perpetual: CexPerpFees,
    pub dex_perpetual: DexPerpFees,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CexPerpFees {
    pub taker: f64,
    pub funding_8h_avg: f64,
}

impl Default for CexPerpFees {
    fn default() -> Self {
        Self { taker: 0.0005, funding_8h_avg: 0.0001 }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DexPerpFees {
    pub taker: f64,
}

impl Default for DexPerpFees {
    fn default() -> Self {
        Self { taker: 0.0005 }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WithdrawalFee {
    pub usdt: f64,
}

impl Default for WithdrawalFee {
    fn default() -> Self {
        Self { usdt: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CostThresholds {
    pub gas_warn_pct: f64,
}

impl Default for CostThresholds {
    fn default() -> Self {
        Self { gas_warn_pct: 0.01 }
    }
}

impl FeesConfig {
    pub fn taker_fee(&self, exchange: &str) -> f64 {
        self.trading_fees
            .get(exchange)
            .map(|t| t.taker)
            .unwrap_or_else(|| FeeTier::default().taker)
    }

    pub fn withdrawal_fee_usdt(&self, network: &str) -> f64 {
        self.withdrawal_fees
            .get(network)
            .map(|w| w.usdt)
            .unwrap_or_else(|| WithdrawalFee::default().usdt)
    }
}

// =============================================================================
// networks.yaml
// =============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NetworksConfig {
    pub networks: HashMap<String, NetworkInfo>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct NetworkInfo {
    pub avg_transfer_min: f64,
}

impl Default for NetworkInfo {
    fn default() -> Self {
        Self { avg_transfer_min: 5.0 }
    }
}

impl NetworksConfig {
    pub fn avg_transfer_min(&self, network: &str) -> f64 {
        self.networks
            .get(network)
            .map(|n| n.avg_transfer_min)
            .unwrap_or_else(|| NetworkInfo::default().avg_transfer_min)
    }
}

// =============================================================================
// exchanges.yaml (fx section)
// =============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct ExchangesFile {
    fx: FxConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FxConfig {
    pub cache_ttl_sec: f64,
    pub fallback_rate: f64,
}

impl Default for FxConfig {
    fn default() -> Self {
        Self { cache_ttl_sec: 300.0, fallback_rate: 1350.0 }
    }
}

// =============================================================================
// vasp_matrix.yaml
// =============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VaspMatrix {
    pub vasp_matrix: HashMap<String, HashMap<String, VaspRoute>>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(default)]
pub struct VaspRoute {
    pub status: VaspStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VaspStatus {
    Ok,
    Partial,
    Blocked,
    #[default]
    Unknown,
}

impl VaspMatrix {
    /// Route status between the listing exchange and the global venue.
    pub fn route_status(&self, from_exchange: &str, to_exchange: &str) -> VaspStatus {
        if to_exchange.is_empty() {
            return VaspStatus::Unknown;
        }
        self.vasp_matrix
            .get(from_exchange)
            .and_then(|routes| routes.get(to_exchange))
            .map(|r| r.status)
            .unwrap_or(VaspStatus::Unknown)
    }
}

// =============================================================================
// features.yaml
// =============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct FeaturesFile {
    features: Features,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Features {
    pub scenario_planner: bool,
    pub supply_classifier: bool,
    pub notice_poller: bool,
    pub hot_wallet_probe: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            scenario_planner: true,
            supply_classifier: true,
            notice_poller: true,
            hot_wallet_probe: false,
        }
    }
}

// =============================================================================
// thresholds.yaml
// =============================================================================

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Thresholds {
    pub scenario_coefficients: HashMap<String, f64>,
    pub scenario_sample_counts: HashMap<String, u32>,
    pub coefficient_governance: CoefficientGovernance,
    pub supply_classifier_weights: HashMap<String, f64>,
    pub turnover_ratio: TurnoverThresholds,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CoefficientGovernance {
    pub min_sample_size: u32,
}

impl Default for CoefficientGovernance {
    fn default() -> Self {
        Self { min_sample_size: 10 }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TurnoverThresholds {
    pub extreme_high: f64,
    pub high: f64,
    pub normal: f64,
    pub low: f64,
}

impl Default for TurnoverThresholds {
    fn default() -> Self {
        Self { extreme_high: 10.0, high: 5.0, normal: 2.1, low: 1.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dir_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.fx.fallback_rate, 1350.0);
        assert_eq!(cfg.fees.cost_thresholds.gas_warn_pct, 0.01);
        assert_eq!(cfg.thresholds.coefficient_governance.min_sample_size, 10);
    }

    #[test]
    fn invalid_yaml_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fees.yaml"), "trading_fees: [not: a map").unwrap();
        assert!(AppConfig::load(dir.path()).is_err());
    }

    #[test]
    fn shipped_config_parses() {
        let cfg = AppConfig::load(&AppConfig::default_dir()).unwrap();
        assert!(cfg.fees.taker_fee("upbit") > 0.0);
        assert!(cfg.networks.avg_transfer_min("solana") <= 5.0);
        assert_eq!(cfg.vasp.route_status("upbit", "binance"), VaspStatus::Ok);
        assert_eq!(cfg.vasp.route_status("upbit", ""), VaspStatus::Unknown);
    }

    #[test]
    fn vasp_unknown_for_unlisted_route() {
        let cfg = VaspMatrix::default();
        assert_eq!(cfg.route_status("upbit", "kraken"), VaspStatus::Unknown);
    }
}
