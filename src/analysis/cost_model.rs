//! Total-cost model: slippage, exchange fees, gas and hedge cost.
//!
//! Net profit is exactly `premium - total_cost`; there are no hidden terms.

use crate::config::FeesConfig;
use crate::models::{HedgeType, Orderbook};

/// Conservative slippage when no orderbook is available (percent).
const DEFAULT_SLIPPAGE_PCT: f64 = 1.0;
/// Extra slippage per unfilled-amount ratio when the book runs dry.
const UNFILLED_PENALTY_PCT: f64 = 5.0;

/// Cost breakdown, every percentage rounded to 4 decimals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostResult {
    pub slippage_pct: f64,
    pub gas_cost_krw: f64,
    pub exchange_fee_pct: f64,
    pub hedge_cost_pct: f64,
    pub total_cost_pct: f64,
    pub net_profit_pct: f64,
    pub gas_warn: bool,
}

/// Hedge-leg cost.
#[derive(Debug, Clone, Copy)]
pub struct HedgeCost {
    pub hedge_type: HedgeType,
    pub fee_pct: f64,
    pub funding_cost_pct: f64,
}

pub struct CostModel {
    fees: FeesConfig,
}

impl CostModel {
    pub fn new(fees: FeesConfig) -> Self {
        Self { fees }
    }

    /// Hedge cost per type: cex = taker + 8h-average funding, dex_only =
    /// taker with funding assumed neutral, none = zero.
    pub fn hedge_cost(&self, hedge_type: HedgeType) -> HedgeCost {
        match hedge_type {
            HedgeType::Cex => {
                let cex = self.fees.hedge_fees.cex_perpetual;
                HedgeCost {
                    hedge_type,
                    fee_pct: cex.taker * 100.0,
                    funding_cost_pct: cex.funding_8h_avg * 100.0,
                }
            }
            HedgeType::DexOnly => HedgeCost {
                hedge_type,
                fee_pct: self.fees.hedge_fees.dex_perpetual.taker * 100.0,
                funding_cost_pct: 0.0,
            },
            HedgeType::None => HedgeCost { hedge_type, fee_pct: 0.0, funding_cost_pct: 0.0 },
        }
    }

    /// Ask-side walkthrough: consume levels until `amount_krw` fills,
    /// measuring the average fill price against the best ask. An unfilled
    /// remainder adds `unfilled_ratio * 5` percentage points.
    pub fn estimate_slippage(&self, orderbook: Option<&Orderbook>, amount_krw: f64) -> f64 {
        let Some(book) = orderbook else {
            return DEFAULT_SLIPPAGE_PCT;
        };
        let Some(best_ask) = book.best_ask().filter(|p| *p > 0.0) else {
            return DEFAULT_SLIPPAGE_PCT;
        };

        let mut remaining = amount_krw;
        let mut total_cost = 0.0;
        let mut total_qty = 0.0;

        for level in &book.asks {
            let level_value = level.price * level.qty;
            if remaining <= level_value {
                total_cost += remaining;
                total_qty += remaining / level.price;
                remaining = 0.0;
                break;
            }
            total_cost += level_value;
            total_qty += level.qty;
            remaining -= level_value;
        }

        if total_qty <= 0.0 {
            return DEFAULT_SLIPPAGE_PCT;
        }

        let avg_price = total_cost / total_qty;
        let mut slippage_pct = (avg_price - best_ask) / best_ask * 100.0;

        if remaining > 0.0 && amount_krw > 0.0 {
            slippage_pct += remaining / amount_krw * UNFILLED_PENALTY_PCT;
        }

        slippage_pct.max(0.0)
    }

    /// Network withdrawal fee (quoted in USDT) converted to KRW.
    pub fn gas_cost_krw(&self, network: &str, fx_rate: f64) -> f64 {
        self.fees.withdrawal_fee_usdt(network) * fx_rate
    }

    /// Full cost composition for a domestic buy + global sell round trip.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_total_cost(
        &self,
        premium_pct: f64,
        network: &str,
        amount_krw: f64,
        hedge_type: HedgeType,
        fx_rate: f64,
        orderbook: Option<&Orderbook>,
        domestic_exchange: &str,
        global_exchange: &str,
    ) -> CostResult {
        let domestic_fee = self.fees.taker_fee(domestic_exchange);
        let global_fee = self.fees.taker_fee(global_exchange);
        let exchange_fee_pct = (domestic_fee + global_fee) * 100.0;

        let slippage_pct = self.estimate_slippage(orderbook, amount_krw);

        let gas_cost_krw = self.gas_cost_krw(network, fx_rate);
        let gas_cost_pct = if amount_krw > 0.0 { gas_cost_krw / amount_krw * 100.0 } else { 0.0 };

        let hedge = self.hedge_cost(hedge_type);
        let hedge_cost_pct = hedge.fee_pct + hedge.funding_cost_pct;

        let total_cost_pct = exchange_fee_pct + slippage_pct + gas_cost_pct + hedge_cost_pct;
        let net_profit_pct = premium_pct - total_cost_pct;

        let gas_warn_pct = self.fees.cost_thresholds.gas_warn_pct * 100.0;
        let gas_warn = gas_cost_pct > gas_warn_pct;

        CostResult {
            slippage_pct: round4(slippage_pct),
            gas_cost_krw: round2(gas_cost_krw),
            exchange_fee_pct: round4(exchange_fee_pct),
            hedge_cost_pct: round4(hedge_cost_pct),
            total_cost_pct: round4(total_cost_pct),
            net_profit_pct: round4(net_profit_pct),
            gas_warn,
        }
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::models::PriceLevel;

    fn model() -> CostModel {
        CostModel::new(AppConfig::load(&AppConfig::default_dir()).unwrap().fees)
    }

    fn book(asks: &[(f64, f64)]) -> Orderbook {
        Orderbook {
            asks: asks.iter().map(|(p, q)| PriceLevel { price: *p, qty: *q }).collect(),
            bids: Vec::new(),
        }
    }

    #[test]
    fn single_deep_level_has_zero_slippage() {
        let m = model();
        let book = book(&[(10_000.0, 1_000.0)]);
        assert_eq!(m.estimate_slippage(Some(&book), 1_000_000.0), 0.0);
    }

    #[test]
    fn missing_orderbook_uses_default() {
        let m = model();
        assert_eq!(m.estimate_slippage(None, 10_000_000.0), DEFAULT_SLIPPAGE_PCT);
        assert_eq!(m.estimate_slippage(Some(&book(&[])), 1.0), DEFAULT_SLIPPAGE_PCT);
    }

    #[test]
    fn walkthrough_averages_across_levels() {
        let m = model();
        // 10M KRW against the reference ladder.
        let book = book(&[(10_000.0, 1.0), (10_010.0, 2.0), (10_020.0, 3.0), (10_050.0, 5.0)]);
        let slip = m.estimate_slippage(Some(&book), 100_000.0);
        assert!(slip > 0.0);
        assert!(slip < 0.5);
    }

    #[test]
    fn dry_book_adds_unfilled_penalty() {
        let m = model();
        // Book holds only half of the order value.
        let book = book(&[(100.0, 50.0)]);
        let slip = m.estimate_slippage(Some(&book), 10_000.0);
        // Zero walk slippage plus 0.5 * 5 percentage points.
        assert!((slip - 2.5).abs() < 1e-9);
    }

    #[test]
    fn net_profit_is_premium_minus_total_cost() {
        let m = model();
        let r = m.calculate_total_cost(
            5.0,
            "solana",
            10_000_000.0,
            HedgeType::Cex,
            1350.0,
            None,
            "upbit",
            "binance",
        );
        assert!((r.net_profit_pct - (5.0 - r.total_cost_pct)).abs() < 1e-9);
        assert!(r.total_cost_pct > 0.0);
        assert!(!r.gas_warn);
    }

    #[test]
    fn expensive_network_on_small_order_warns() {
        let m = model();
        // 10 USDT ethereum withdrawal against a 1M KRW order: ~1.35%.
        let r = m.calculate_total_cost(
            5.0,
            "ethereum",
            1_000_000.0,
            HedgeType::None,
            1350.0,
            None,
            "upbit",
            "binance",
        );
        assert!(r.gas_warn);
        assert!(r.gas_cost_krw > 10_000.0);
    }

    #[test]
    fn hedge_cost_by_type() {
        let m = model();
        let cex = m.hedge_cost(HedgeType::Cex);
        assert!(cex.fee_pct > 0.0 && cex.funding_cost_pct > 0.0);

        let dex = m.hedge_cost(HedgeType::DexOnly);
        assert!(dex.fee_pct > 0.0);
        assert_eq!(dex.funding_cost_pct, 0.0);

        let none = m.hedge_cost(HedgeType::None);
        assert_eq!(none.fee_pct + none.funding_cost_pct, 0.0);
    }
}
