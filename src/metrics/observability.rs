//! Gate decision logging.
//!
//! Every gate decision becomes one `gate_analysis_log` row; new listings
//! additionally get a `listing_history` row (critical priority: these are
//! the ground truth for later outcome labelling).

use chrono::Utc;
use rusqlite::types::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::analysis::gate::GateResult;
use crate::store::writer::{DatabaseWriter, Priority};

const INSERT_GATE_LOG_SQL: &str = "INSERT INTO gate_analysis_log (\
     timestamp, symbol, exchange, can_proceed, alert_level, \
     premium_pct, net_profit_pct, total_cost_pct, fx_rate, fx_source, \
     blockers_json, warnings_json, hedge_type, network, global_volume_usd, \
     gate_duration_ms, domestic_price_krw, global_price_usd) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)";

const INSERT_LISTING_HISTORY_SQL: &str = "INSERT OR REPLACE INTO listing_history (\
     symbol, exchange, listing_time, listing_type, \
     top_exchange, global_volume_usd, gate_can_proceed, \
     premium_pct, net_profit_pct, hedge_type, network, created_at, updated_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, datetime('now'), datetime('now'))";

/// Append one gate decision to `gate_analysis_log`.
pub fn log_gate_analysis(writer: &Arc<DatabaseWriter>, result: &GateResult, duration_ms: f64) {
    let blockers_json = serde_json::to_string(&result.blockers).unwrap_or_else(|_| "[]".into());
    let warnings_json = serde_json::to_string(&result.warnings).unwrap_or_else(|_| "[]".into());

    let params = match &result.gate_input {
        Some(gi) => vec![
            Value::from(now_ts()),
            Value::from(result.symbol.clone()),
            Value::from(result.exchange.clone()),
            Value::from(result.can_proceed as i64),
            Value::from(result.alert_level.as_str().to_string()),
            Value::from(gi.premium_pct),
            Value::from(gi.cost.net_profit_pct),
            Value::from(gi.cost.total_cost_pct),
            Value::from(gi.fx_rate),
            Value::from(gi.fx_source.as_str().to_string()),
            Value::from(blockers_json),
            Value::from(warnings_json),
            Value::from(gi.hedge_type.as_str().to_string()),
            Value::from(gi.network.clone()),
            Value::from(gi.global_volume_usd),
            Value::from(duration_ms),
            Value::from(gi.domestic_price_krw),
            Value::from(gi.global_price_usd),
        ],
        // Early failures still leave a decision trail.
        None => vec![
            Value::from(now_ts()),
            Value::from(result.symbol.clone()),
            Value::from(result.exchange.clone()),
            Value::from(result.can_proceed as i64),
            Value::from(result.alert_level.as_str().to_string()),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Null,
            Value::from(blockers_json),
            Value::from(warnings_json),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::from(duration_ms),
            Value::Null,
            Value::Null,
        ],
    };

    writer.enqueue(INSERT_GATE_LOG_SQL, params, Priority::Normal);
    debug!(
        symbol = %result.symbol,
        exchange = %result.exchange,
        decision = if result.can_proceed { "GO" } else { "NO-GO" },
        duration_ms,
        "gate analysis logged"
    );
}

/// Record a listing in `listing_history`. Critical priority: never dropped.
pub fn record_listing_history(
    writer: &Arc<DatabaseWriter>,
    result: &GateResult,
    listing_time: Option<String>,
) {
    let listing_time = listing_time.unwrap_or_else(|| Utc::now().to_rfc3339());
    let listing_type = result
        .listing_type
        .as_ref()
        .map(|lt| lt.listing_type.as_str())
        .unwrap_or("UNKNOWN");

    let params = match &result.gate_input {
        Some(gi) => vec![
            Value::from(result.symbol.clone()),
            Value::from(result.exchange.clone()),
            Value::from(listing_time),
            Value::from(listing_type.to_string()),
            Value::from(gi.top_exchange.clone()),
            Value::from(gi.global_volume_usd),
            Value::from(result.can_proceed as i64),
            Value::from(gi.premium_pct),
            Value::from(gi.cost.net_profit_pct),
            Value::from(gi.hedge_type.as_str().to_string()),
            Value::from(gi.network.clone()),
        ],
        None => vec![
            Value::from(result.symbol.clone()),
            Value::from(result.exchange.clone()),
            Value::from(listing_time),
            Value::from(listing_type.to_string()),
            Value::Null,
            Value::Null,
            Value::from(result.can_proceed as i64),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Null,
        ],
    };

    writer.enqueue(INSERT_LISTING_HISTORY_SQL, params, Priority::Critical);
    info!(
        symbol = %result.symbol,
        exchange = %result.exchange,
        listing_type,
        "listing history recorded"
    );
}

fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
