//! Token identity registry.
//!
//! Read-mostly lookups go through a dedicated read connection; inserts flow
//! through the writer queue. CoinGecko supplies best-effort enrichment: a
//! startup bootstrap of the top tokens plus per-symbol lookups when a new
//! listing appears. Both are skipped or degraded to a minimal row when the
//! API is unavailable.

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::store::writer::{DatabaseWriter, Priority};

// first_seen_at sticks to the first insert: later INSERT OR IGNOREs for the
// same (symbol, chain) never touch it.
const INSERT_TOKEN_SQL: &str = "INSERT OR IGNORE INTO token_registry \
     (symbol, coingecko_id, name, chain, contract_address, decimals, first_seen_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))";

const CG_MARKETS_URL: &str = "https://api.coingecko.com/api/v3/coins/markets";
const CG_SEARCH_URL: &str = "https://api.coingecko.com/api/v3/search";

/// One chain binding of a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainInfo {
    pub chain: String,
    pub contract_address: String,
    pub decimals: i64,
}

/// Canonical token identity.
#[derive(Debug, Clone, Default)]
pub struct TokenIdentity {
    pub symbol: String,
    pub coingecko_id: Option<String>,
    pub name: Option<String>,
    pub chains: Vec<ChainInfo>,
    /// When this symbol first entered the registry (UTC).
    pub first_seen_at: Option<DateTime<Utc>>,
}

impl TokenIdentity {
    pub fn minimal(symbol: &str) -> Self {
        Self { symbol: symbol.to_string(), ..Default::default() }
    }
}

/// Registry backed by the shared store.
pub struct TokenRegistry {
    read_conn: Mutex<Connection>,
    writer: Arc<DatabaseWriter>,
}

impl TokenRegistry {
    pub fn new(read_conn: Connection, writer: Arc<DatabaseWriter>) -> Self {
        Self { read_conn: Mutex::new(read_conn), writer }
    }

    /// Look up a token by symbol; all chain bindings are collected and the
    /// earliest first-seen timestamp wins.
    pub fn get_by_symbol(&self, symbol: &str) -> Result<Option<TokenIdentity>> {
        let conn = self.read_conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol, coingecko_id, name, chain, contract_address, decimals, first_seen_at \
             FROM token_registry WHERE symbol = ?1 ORDER BY first_seen_at ASC",
        )?;
        let mut rows = stmt.query([symbol])?;

        let mut token: Option<TokenIdentity> = None;
        while let Some(row) = rows.next()? {
            let t = token.get_or_insert_with(|| TokenIdentity {
                symbol: row.get(0).unwrap_or_default(),
                coingecko_id: row.get(1).unwrap_or(None),
                name: row.get(2).unwrap_or(None),
                chains: Vec::new(),
                first_seen_at: None,
            });
            if t.first_seen_at.is_none() {
                t.first_seen_at = row
                    .get::<_, Option<String>>(6)
                    .unwrap_or(None)
                    .as_deref()
                    .and_then(parse_db_datetime);
            }
            let chain: String = row.get(3)?;
            if !chain.is_empty() {
                t.chains.push(ChainInfo {
                    chain,
                    contract_address: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    decimals: row.get::<_, Option<i64>>(5)?.unwrap_or(18),
                });
            }
        }
        Ok(token)
    }

    /// Queue registration through the writer. One row per chain binding,
    /// or a single chainless row when no bindings are known.
    pub fn insert(&self, token: &TokenIdentity) {
        if token.chains.is_empty() {
            self.writer.enqueue(
                INSERT_TOKEN_SQL,
                vec![
                    Value::from(token.symbol.clone()),
                    Value::from(token.coingecko_id.clone()),
                    Value::from(token.name.clone()),
                    Value::from(String::new()),
                    Value::from(String::new()),
                    Value::from(18i64),
                ],
                Priority::Normal,
            );
        } else {
            for ci in &token.chains {
                self.writer.enqueue(
                    INSERT_TOKEN_SQL,
                    vec![
                        Value::from(token.symbol.clone()),
                        Value::from(token.coingecko_id.clone()),
                        Value::from(token.name.clone()),
                        Value::from(ci.chain.clone()),
                        Value::from(ci.contract_address.clone()),
                        Value::from(ci.decimals),
                    ],
                    Priority::Normal,
                );
            }
        }
        info!(symbol = %token.symbol, chains = token.chains.len(), "token registered");
    }
}

/// SQLite `datetime('now')` text -> UTC.
fn parse_db_datetime(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

// =============================================================================
// CoinGecko enrichment
// =============================================================================

#[derive(Debug, Deserialize)]
struct CgMarketRow {
    symbol: String,
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CgSearchResponse {
    #[serde(default)]
    coins: Vec<CgSearchCoin>,
}

#[derive(Debug, Deserialize)]
struct CgSearchCoin {
    id: String,
    symbol: String,
    name: String,
}

fn cg_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(Duration::from_secs(15)).build()?)
}

/// Search CoinGecko for a symbol. Best-effort: any failure yields `None`.
pub async fn fetch_token_by_symbol(symbol: &str) -> Option<TokenIdentity> {
    let client = cg_client().ok()?;
    let resp = client
        .get(CG_SEARCH_URL)
        .query(&[("query", symbol)])
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        debug!(symbol, status = %resp.status(), "coingecko search failed");
        return None;
    }
    let body: CgSearchResponse = resp.json().await.ok()?;
    let hit = body
        .coins
        .into_iter()
        .find(|c| c.symbol.eq_ignore_ascii_case(symbol))?;
    Some(TokenIdentity {
        symbol: symbol.to_uppercase(),
        coingecko_id: Some(hit.id),
        name: Some(hit.name),
        ..Default::default()
    })
}

/// Preload the top tokens by market cap so most listings resolve locally.
///
/// Called once at startup in a background task. Returns the number of rows
/// queued for insertion.
pub async fn bootstrap_top_tokens(registry: &TokenRegistry, limit: usize) -> Result<usize> {
    let client = cg_client()?;
    let mut total = 0usize;
    let per_page = 250usize.min(limit);
    let pages = limit.div_ceil(per_page);

    for page in 1..=pages {
        let resp = client
            .get(CG_MARKETS_URL)
            .query(&[
                ("vs_currency", "usd"),
                ("order", "market_cap_desc"),
                ("per_page", &per_page.to_string()),
                ("page", &page.to_string()),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("coingecko markets returned HTTP {}", resp.status());
        }
        let rows: Vec<CgMarketRow> = resp.json().await?;
        if rows.is_empty() {
            break;
        }
        for row in rows {
            registry.insert(&TokenIdentity {
                symbol: row.symbol.to_uppercase(),
                coingecko_id: Some(row.id),
                name: Some(row.name),
                ..Default::default()
            });
            total += 1;
        }
        // Free-tier rate limit headroom.
        tokio::time::sleep(Duration::from_millis(1500)).await;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::database::{apply_migrations, default_migrations_dir, open_connection};

    fn setup() -> (tempfile::TempDir, TokenRegistry, Arc<DatabaseWriter>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db").to_string_lossy().to_string();
        let conn = open_connection(&path).unwrap();
        apply_migrations(&conn, &default_migrations_dir()).unwrap();
        let writer = DatabaseWriter::new(conn, 1000);
        writer.start();
        let read = open_connection(&path).unwrap();
        (dir, TokenRegistry::new(read, writer.clone()), writer)
    }

    #[test]
    fn insert_and_lookup_multichain() {
        let (_dir, registry, writer) = setup();

        registry.insert(&TokenIdentity {
            symbol: "XYZ".into(),
            coingecko_id: Some("xyz-protocol".into()),
            name: Some("XYZ Protocol".into()),
            chains: vec![
                ChainInfo { chain: "ethereum".into(), contract_address: "0xabc".into(), decimals: 18 },
                ChainInfo { chain: "solana".into(), contract_address: "So111".into(), decimals: 9 },
            ],
            ..Default::default()
        });
        writer.shutdown();

        let token = registry.get_by_symbol("XYZ").unwrap().unwrap();
        assert_eq!(token.coingecko_id.as_deref(), Some("xyz-protocol"));
        assert_eq!(token.chains.len(), 2);
        // Stamped by the insert.
        let first_seen = token.first_seen_at.unwrap();
        assert!((Utc::now() - first_seen).num_seconds().abs() < 60);
    }

    #[test]
    fn minimal_row_when_unknown() {
        let (_dir, registry, writer) = setup();
        registry.insert(&TokenIdentity::minimal("NEWCOIN"));
        writer.shutdown();

        let token = registry.get_by_symbol("NEWCOIN").unwrap().unwrap();
        assert!(token.coingecko_id.is_none());
        assert!(token.chains.is_empty());
    }

    #[test]
    fn missing_symbol_is_none() {
        let (_dir, registry, _writer) = setup();
        assert!(registry.get_by_symbol("NOPE").unwrap().is_none());
    }

    #[test]
    fn reinsert_keeps_first_seen() {
        let (_dir, registry, writer) = setup();
        registry.insert(&TokenIdentity::minimal("DUP"));
        registry.insert(&TokenIdentity::minimal("DUP"));
        writer.shutdown();

        let token = registry.get_by_symbol("DUP").unwrap().unwrap();
        assert!(token.first_seen_at.is_some());
        assert!(token.chains.is_empty());
    }
}
