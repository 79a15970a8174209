//! Listing-type classification.
//!
//! - TGE: first-ever listing anywhere (no global venue; token first seen
//!   recently, or no data at all, in which case TGE is assumed at low
//!   confidence)
//! - DIRECT: already trading abroad, first domestic listing
//! - SIDE: the other domestic exchange listed it first
//! - UNKNOWN: venue-less but first seen long ago (downstream treats this as
//!   watch-only pressure)

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, warn};

/// Days since first listing below which a venue-less token counts as TGE.
const TGE_DAYS_THRESHOLD: i64 = 7;

const DOMESTIC_EXCHANGES: [&str; 2] = ["upbit", "bithumb"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingType {
    Tge,
    Direct,
    Side,
    Unknown,
}

impl ListingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingType::Tge => "TGE",
            ListingType::Direct => "DIRECT",
            ListingType::Side => "SIDE",
            ListingType::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListingTypeResult {
    pub listing_type: ListingType,
    pub confidence: f64,
    pub top_exchange: String,
    pub domestic_competitor: Option<String>,
    pub reason: String,
}

/// Classifier with an optional read connection for domestic history.
pub struct ListingTypeClassifier {
    read_conn: Option<Mutex<Connection>>,
}

impl ListingTypeClassifier {
    pub fn new(read_conn: Option<Connection>) -> Self {
        Self { read_conn: read_conn.map(Mutex::new) }
    }

    /// Priority: SIDE > TGE > DIRECT > UNKNOWN.
    pub fn classify(
        &self,
        symbol: &str,
        exchange: &str,
        top_exchange: &str,
        first_listed_at: Option<DateTime<Utc>>,
    ) -> ListingTypeResult {
        if let Some(competitor) = self.domestic_competitor(symbol, exchange) {
            return ListingTypeResult {
                listing_type: ListingType::Side,
                confidence: 0.95,
                top_exchange: top_exchange.to_string(),
                domestic_competitor: Some(competitor.clone()),
                reason: format!("already listed domestically on {}", competitor),
            };
        }

        if is_tge(top_exchange, first_listed_at) {
            let (confidence, reason) = if first_listed_at.is_some() {
                (0.85, "no global venue, token first seen within 7 days".to_string())
            } else {
                // No data at all: assume TGE at low confidence.
                (0.6, "no venue or first-listing data, assuming TGE".to_string())
            };
            return ListingTypeResult {
                listing_type: ListingType::Tge,
                confidence,
                top_exchange: top_exchange.to_string(),
                domestic_competitor: None,
                reason,
            };
        }

        if !top_exchange.is_empty() && !is_domestic(top_exchange) {
            return ListingTypeResult {
                listing_type: ListingType::Direct,
                confidence: 0.9,
                top_exchange: top_exchange.to_string(),
                domestic_competitor: None,
                reason: format!("already trading on {}", top_exchange),
            };
        }

        warn!(symbol, exchange, "listing type unclassifiable");
        ListingTypeResult {
            listing_type: ListingType::Unknown,
            confidence: 0.0,
            top_exchange: top_exchange.to_string(),
            domestic_competitor: None,
            reason: "unclassifiable".into(),
        }
    }

    /// Check `listing_history` for a prior listing on the other domestic
    /// exchange. Absent a connection (or on query failure), assume none.
    fn domestic_competitor(&self, symbol: &str, exchange: &str) -> Option<String> {
        let conn = self.read_conn.as_ref()?;
        for other in DOMESTIC_EXCHANGES {
            if other == exchange {
                continue;
            }
            let conn = conn.lock();
            let found: Result<i64, _> = conn.query_row(
                "SELECT COUNT(*) FROM listing_history WHERE symbol = ?1 AND exchange = ?2",
                rusqlite::params![symbol, other],
                |row| row.get(0),
            );
            match found {
                Ok(n) if n > 0 => return Some(other.to_string()),
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "listing_history lookup failed");
                    return None;
                }
            }
        }
        debug!(symbol, "no domestic competitor found");
        None
    }
}

fn is_domestic(exchange: &str) -> bool {
    DOMESTIC_EXCHANGES.iter().any(|d| exchange.eq_ignore_ascii_case(d))
}

/// TGE when there is no real global venue (none, or only a domestic one)
/// and the token was first seen within the threshold, or there is no
/// first-seen data at all.
fn is_tge(top_exchange: &str, first_listed_at: Option<DateTime<Utc>>) -> bool {
    if !top_exchange.is_empty() && !is_domestic(top_exchange) {
        return false;
    }
    match first_listed_at {
        None => true,
        Some(first) => Utc::now() - first < Duration::days(TGE_DAYS_THRESHOLD),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::database::{apply_migrations, default_migrations_dir, open_memory};

    #[test]
    fn venue_less_recent_token_is_tge() {
        let c = ListingTypeClassifier::new(None);
        let r = c.classify("XYZ", "upbit", "", Some(Utc::now() - Duration::days(2)));
        assert_eq!(r.listing_type, ListingType::Tge);
        assert_eq!(r.confidence, 0.85);
    }

    #[test]
    fn no_data_assumes_tge_with_low_confidence() {
        let c = ListingTypeClassifier::new(None);
        let r = c.classify("XYZ", "upbit", "", None);
        assert_eq!(r.listing_type, ListingType::Tge);
        assert_eq!(r.confidence, 0.6);
        assert!(r.reason.contains("assuming TGE"));
    }

    #[test]
    fn venue_less_old_token_is_unknown() {
        let c = ListingTypeClassifier::new(None);
        let r = c.classify("XYZ", "upbit", "", Some(Utc::now() - Duration::days(30)));
        assert_eq!(r.listing_type, ListingType::Unknown);
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn domestic_top_exchange_counts_as_venue_less() {
        let c = ListingTypeClassifier::new(None);
        let r = c.classify("XYZ", "upbit", "bithumb", None);
        assert_eq!(r.listing_type, ListingType::Tge);
        assert_eq!(r.confidence, 0.6);
    }

    #[test]
    fn global_venue_means_direct() {
        let c = ListingTypeClassifier::new(None);
        let r = c.classify("XYZ", "upbit", "binance", None);
        assert_eq!(r.listing_type, ListingType::Direct);
        assert_eq!(r.confidence, 0.9);
        assert_eq!(r.top_exchange, "binance");
    }

    #[test]
    fn domestic_history_wins_as_side() {
        let conn = open_memory().unwrap();
        apply_migrations(&conn, &default_migrations_dir()).unwrap();
        conn.execute(
            "INSERT INTO listing_history (symbol, exchange, listing_time) \
             VALUES ('XYZ', 'bithumb', '2024-01-01T00:00:00')",
            [],
        )
        .unwrap();

        let c = ListingTypeClassifier::new(Some(conn));
        let r = c.classify("XYZ", "upbit", "binance", None);
        assert_eq!(r.listing_type, ListingType::Side);
        assert_eq!(r.confidence, 0.95);
        assert_eq!(r.domestic_competitor.as_deref(), Some("bithumb"));
    }
}
