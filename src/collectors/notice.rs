//! Exchange notice parsing and polling.
//!
//! The catalog diff is authoritative for listings; notices provide earlier
//! pre-detection plus event types the catalog cannot see (trading halts,
//! migrations, depegs). The parser is pure regex over title/body text so it
//! stays unit-testable without I/O.

use parking_lot::Mutex;
use regex::Regex;
use rusqlite::types::Value;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alerts::telegram::TelegramAlert;
use crate::models::AlertLevel;
use crate::store::writer::{DatabaseWriter, Priority};

/// Notice taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeType {
    Listing,
    Warning,
    Halt,
    Migration,
    Depeg,
    Unknown,
}

impl NoticeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeType::Listing => "listing",
            NoticeType::Warning => "warning",
            NoticeType::Halt => "halt",
            NoticeType::Migration => "migration",
            NoticeType::Depeg => "depeg",
            NoticeType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl NoticeSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeSeverity::Low => "LOW",
            NoticeSeverity::Medium => "MEDIUM",
            NoticeSeverity::High => "HIGH",
            NoticeSeverity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeAction {
    None,
    Monitor,
    Alert,
    Trade,
}

impl NoticeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeAction::None => "NONE",
            NoticeAction::Monitor => "MONITOR",
            NoticeAction::Alert => "ALERT",
            NoticeAction::Trade => "TRADE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NoticeParseResult {
    pub symbols: Vec<String>,
    pub listing_time: Option<String>,
    pub notice_type: NoticeType,
    pub severity: NoticeSeverity,
    pub action: NoticeAction,
    pub raw_title: String,
}

/// Regex-based notice parser. Pattern lists are ordered by priority.
pub struct NoticeParser {
    symbol_patterns: Vec<Regex>,
    hm_pattern: Regex,
    pm_pattern: Regex,
    am_pattern: Regex,
}

impl NoticeParser {
    pub fn new() -> Self {
        Self {
            symbol_patterns: vec![
                // "비트코인(BTC) 원화 마켓 추가"
                Regex::new(r"\(([A-Z0-9]{2,10})\)").unwrap(),
                // "BTC/KRW 마켓 추가"
                Regex::new(r"([A-Z0-9]{2,10})/KRW").unwrap(),
                // "BTC 원화 마켓"
                Regex::new(r"([A-Z0-9]{2,10})\s*원화").unwrap(),
                // "BTC_KRW 마켓 추가"
                Regex::new(r"([A-Z0-9]{2,10})_KRW").unwrap(),
            ],
            hm_pattern: Regex::new(r"(\d{1,2}):(\d{2})").unwrap(),
            pm_pattern: Regex::new(r"오후\s*(\d{1,2})시(?:\s*(\d{1,2})분)?").unwrap(),
            am_pattern: Regex::new(r"오전\s*(\d{1,2})시(?:\s*(\d{1,2})분)?").unwrap(),
        }
    }

    pub fn parse(&self, title: &str, content: &str) -> NoticeParseResult {
        let notice_type = classify_title(title);
        let (severity, action) = severity_and_action(notice_type);

        if notice_type == NoticeType::Unknown {
            return NoticeParseResult {
                symbols: Vec::new(),
                listing_time: None,
                notice_type,
                severity,
                action,
                raw_title: title.to_string(),
            };
        }

        let mut symbols = self.extract_symbols(title);
        if symbols.is_empty() && !content.is_empty() {
            symbols = self.extract_symbols(content);
        }

        let mut listing_time = None;
        if notice_type == NoticeType::Listing {
            listing_time = self.extract_time(content).or_else(|| self.extract_time(title));
            // Date-less notices refer to today (KST).
            if let Some(time) = &listing_time {
                let today = chrono::Utc::now()
                    .with_timezone(&chrono::FixedOffset::east_opt(9 * 3600).expect("KST"))
                    .format("%Y-%m-%d");
                listing_time = Some(format!("{} {}", today, time));
            }
        }

        NoticeParseResult {
            symbols,
            listing_time,
            notice_type,
            severity,
            action,
            raw_title: title.to_string(),
        }
    }

    fn extract_symbols(&self, text: &str) -> Vec<String> {
        let mut symbols: Vec<String> = Vec::new();
        for pattern in &self.symbol_patterns {
            for cap in pattern.captures_iter(text) {
                if let Some(m) = cap.get(1) {
                    let sym = m.as_str().to_string();
                    if sym != "KRW" && !symbols.contains(&sym) {
                        symbols.push(sym);
                    }
                }
            }
            if !symbols.is_empty() {
                break;
            }
        }
        symbols
    }

    /// "HH:MM:SS" (KST wall clock) or None.
    fn extract_time(&self, text: &str) -> Option<String> {
        if let Some(cap) = self.pm_pattern.captures(text) {
            let mut hour: u32 = cap.get(1)?.as_str().parse().ok()?;
            let minute: u32 = cap.get(2).map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);
            if hour < 12 {
                hour += 12;
            }
            return Some(format!("{:02}:{:02}:00", hour, minute));
        }
        if let Some(cap) = self.am_pattern.captures(text) {
            let hour: u32 = cap.get(1)?.as_str().parse().ok()?;
            let minute: u32 = cap.get(2).map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);
            return Some(format!("{:02}:{:02}:00", hour, minute));
        }
        // Bare HH:MM last: the most general pattern, most prone to noise.
        if let Some(cap) = self.hm_pattern.captures(text) {
            let hour: u32 = cap.get(1)?.as_str().parse().ok()?;
            let minute: u32 = cap.get(2)?.as_str().parse().ok()?;
            if hour <= 23 && minute <= 59 {
                return Some(format!("{:02}:{:02}:00", hour, minute));
            }
        }
        None
    }
}

impl Default for NoticeParser {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_title(title: &str) -> NoticeType {
    const LISTING: [&str; 4] = ["마켓 추가", "신규 상장", "마켓 오픈", "상장"];
    const WARNING: [&str; 3] = ["투자유의", "유의종목", "투자 유의"];
    const HALT: [&str; 4] = ["거래지원 종료", "상장폐지", "거래 중단", "입출금 일시 중단"];
    const MIGRATION: [&str; 3] = ["토큰 스왑", "리브랜딩", "메인넷 전환"];
    const DEPEG: [&str; 2] = ["디페깅", "페깅 이탈"];

    // Halt/warning keywords outrank listing: "상장폐지" contains "상장".
    if DEPEG.iter().any(|k| title.contains(k)) {
        return NoticeType::Depeg;
    }
    if HALT.iter().any(|k| title.contains(k)) {
        return NoticeType::Halt;
    }
    if WARNING.iter().any(|k| title.contains(k)) {
        return NoticeType::Warning;
    }
    if MIGRATION.iter().any(|k| title.contains(k)) {
        return NoticeType::Migration;
    }
    if LISTING.iter().any(|k| title.contains(k)) {
        return NoticeType::Listing;
    }
    NoticeType::Unknown
}

fn severity_and_action(notice_type: NoticeType) -> (NoticeSeverity, NoticeAction) {
    match notice_type {
        NoticeType::Listing => (NoticeSeverity::High, NoticeAction::Trade),
        NoticeType::Halt => (NoticeSeverity::High, NoticeAction::Alert),
        NoticeType::Depeg => (NoticeSeverity::Critical, NoticeAction::Alert),
        NoticeType::Warning => (NoticeSeverity::Medium, NoticeAction::Monitor),
        NoticeType::Migration => (NoticeSeverity::Medium, NoticeAction::Monitor),
        NoticeType::Unknown => (NoticeSeverity::Low, NoticeAction::None),
    }
}

// =============================================================================
// Poller
// =============================================================================

const NOTICE_POLL_INTERVAL: Duration = Duration::from_secs(60);
const BITHUMB_NOTICE_URL: &str = "https://feed.bithumb.com/notice";

const INSERT_NOTICE_SQL: &str = "INSERT INTO notice_events \
     (exchange, notice_type, title, symbols_json, notice_ts, source, severity, action, raw_json) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

/// Polls the Bithumb notice board, parses titles and pre-alerts.
pub struct NoticePoller {
    client: reqwest::Client,
    parser: NoticeParser,
    writer: Arc<DatabaseWriter>,
    read_conn: Mutex<Connection>,
    alert: Arc<TelegramAlert>,
    link_re: Regex,
}

impl NoticePoller {
    pub fn new(
        writer: Arc<DatabaseWriter>,
        read_conn: Connection,
        alert: Arc<TelegramAlert>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            parser: NoticeParser::new(),
            writer,
            read_conn: Mutex::new(read_conn),
            alert,
            link_re: Regex::new(r#"<a[^>]+href="([^"]+)"[^>]*>([^<]{4,200})</a>"#).unwrap(),
        }
    }

    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(NOTICE_POLL_INTERVAL) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                    continue;
                }
            }

            match self.poll_once().await {
                Ok(count) if count > 0 => info!(count, "new notices processed"),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "notice poll failed"),
            }
        }
    }

    async fn poll_once(&self) -> anyhow::Result<usize> {
        let html = self
            .client
            .get(BITHUMB_NOTICE_URL)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let mut processed = 0usize;
        for cap in self.link_re.captures_iter(&html) {
            let url = cap.get(1).map(|m| m.as_str()).unwrap_or("");
            let title = cap.get(2).map(|m| m.as_str().trim()).unwrap_or("");
            let parsed = self.parser.parse(title, "");
            if parsed.notice_type == NoticeType::Unknown {
                continue;
            }
            if self.handle_notice("bithumb", url, &parsed).await {
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Returns true when the notice was new (inserted + alerted).
    async fn handle_notice(&self, exchange: &str, url: &str, parsed: &NoticeParseResult) -> bool {
        if self.is_duplicate(exchange, url, parsed) {
            return false;
        }

        let symbols_json =
            serde_json::to_string(&parsed.symbols).unwrap_or_else(|_| "[]".into());
        self.writer.enqueue(
            INSERT_NOTICE_SQL,
            vec![
                Value::from(exchange.to_string()),
                Value::from(parsed.notice_type.as_str().to_string()),
                Value::from(parsed.raw_title.clone()),
                Value::from(symbols_json),
                Value::from(parsed.listing_time.clone()),
                Value::from(url.to_string()),
                Value::from(parsed.severity.as_str().to_string()),
                Value::from(parsed.action.as_str().to_string()),
                Value::from("{}".to_string()),
            ],
            Priority::Normal,
        );

        if parsed.action != NoticeAction::None {
            let message = format!(
                "notice [{}] {} | symbols: {}",
                parsed.notice_type.as_str(),
                parsed.raw_title,
                if parsed.symbols.is_empty() { "?".into() } else { parsed.symbols.join(", ") },
            );
            // Pre-detection only: the catalog diff remains authoritative,
            // so notices go out debounced at MEDIUM.
            let key = format!("notice:{}:{}", parsed.notice_type.as_str(),
                parsed.symbols.first().map(String::as_str).unwrap_or(url));
            self.alert.send(AlertLevel::Medium, &message, Some(&key)).await;
        }
        true
    }

    /// Dedup: a stable source URL/id wins; title+timestamp is the fallback.
    fn is_duplicate(&self, exchange: &str, url: &str, parsed: &NoticeParseResult) -> bool {
        let conn = self.read_conn.lock();
        let source_stable = !url.trim().is_empty() && url != "notice";
        if source_stable {
            let count: Result<i64, _> = conn.query_row(
                "SELECT COUNT(*) FROM notice_events \
                 WHERE exchange = ?1 AND notice_type = ?2 AND source = ?3",
                rusqlite::params![exchange, parsed.notice_type.as_str(), url],
                |r| r.get(0),
            );
            if matches!(count, Ok(n) if n > 0) {
                return true;
            }
        }
        let count: Result<i64, _> = conn.query_row(
            "SELECT COUNT(*) FROM notice_events \
             WHERE exchange = ?1 AND notice_type = ?2 AND title = ?3 AND notice_ts IS ?4",
            rusqlite::params![
                exchange,
                parsed.notice_type.as_str(),
                parsed.raw_title,
                parsed.listing_time
            ],
            |r| r.get(0),
        );
        match count {
            Ok(n) => n > 0,
            Err(e) => {
                warn!(error = %e, "notice dedup lookup failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_notice_with_symbol_and_time() {
        let parser = NoticeParser::new();
        let r = parser.parse("[마켓 추가] 비트코인(BTC) 원화 마켓 추가", "오후 2시 30분 거래 오픈");
        assert_eq!(r.notice_type, NoticeType::Listing);
        assert_eq!(r.symbols, vec!["BTC"]);
        assert_eq!(r.severity, NoticeSeverity::High);
        assert_eq!(r.action, NoticeAction::Trade);
        let time = r.listing_time.unwrap();
        assert!(time.ends_with("14:30:00"));
    }

    #[test]
    fn slash_krw_and_underscore_patterns() {
        let parser = NoticeParser::new();
        let r = parser.parse("XYZ/KRW 마켓 추가 안내", "");
        assert_eq!(r.symbols, vec!["XYZ"]);

        let r = parser.parse("신규 상장: ABC_KRW 오픈", "");
        assert_eq!(r.symbols, vec!["ABC"]);
    }

    #[test]
    fn morning_time_and_bare_hhmm() {
        let parser = NoticeParser::new();
        let r = parser.parse("DEF 원화 마켓 추가", "오전 11시 상장");
        assert!(r.listing_time.unwrap().ends_with("11:00:00"));

        let r = parser.parse("GHI 원화 마켓 추가", "14:00 부터 거래");
        assert!(r.listing_time.unwrap().ends_with("14:00:00"));
    }

    #[test]
    fn taxonomy_classification() {
        assert_eq!(classify_title("비트코인(BTC) 거래지원 종료 안내"), NoticeType::Halt);
        assert_eq!(classify_title("XYZ 상장폐지 안내"), NoticeType::Halt);
        assert_eq!(classify_title("ABC 투자유의 종목 지정"), NoticeType::Warning);
        assert_eq!(classify_title("DEF 토큰 스왑 지원 안내"), NoticeType::Migration);
        assert_eq!(classify_title("USDX 디페깅 관련 안내"), NoticeType::Depeg);
        assert_eq!(classify_title("점검 안내"), NoticeType::Unknown);
    }

    #[test]
    fn severity_mapping() {
        assert_eq!(severity_and_action(NoticeType::Depeg).0, NoticeSeverity::Critical);
        assert_eq!(severity_and_action(NoticeType::Listing).1, NoticeAction::Trade);
        assert_eq!(severity_and_action(NoticeType::Unknown).1, NoticeAction::None);
    }

    #[test]
    fn unknown_title_extracts_nothing() {
        let parser = NoticeParser::new();
        let r = parser.parse("서버 점검 안내 (BTC)", "");
        assert_eq!(r.notice_type, NoticeType::Unknown);
        assert!(r.symbols.is_empty());
        assert!(r.listing_time.is_none());
    }
}
