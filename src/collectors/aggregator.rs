//! 1s -> 1m rollup, self-healing and retention.
//!
//! Runs at every minute boundary: rolls the preceding minute's 1-second rows
//! into one 1-minute row per market and queues deletion of 1-second rows
//! older than 10 minutes. `INSERT OR REPLACE` keeps re-rollups idempotent,
//! so a restart can safely re-roll recent minutes with more complete data.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::store::writer::{DatabaseWriter, Priority};

const INSERT_TRADE_1M: &str = "INSERT OR REPLACE INTO trade_snapshot_1m \
     (market, ts, open, high, low, close, volume, volume_krw) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

const DELETE_OLD_1S: &str =
    "DELETE FROM trade_snapshot_1s WHERE ts < datetime('now', '-10 minutes')";

/// Minutes re-rolled on startup to repair a prior crash.
const SELF_HEAL_MINUTES: i64 = 15;

pub struct Aggregator {
    read_conn: Mutex<Connection>,
    writer: Arc<DatabaseWriter>,
}

impl Aggregator {
    /// `read_conn` serves the SELECT side; all writes go through the queue.
    pub fn new(read_conn: Connection, writer: Arc<DatabaseWriter>) -> Self {
        Self { read_conn: Mutex::new(read_conn), writer }
    }

    /// Periodic loop: self-heal once, then roll up each completed minute.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        self.self_heal();

        if wait_until_next_minute(&mut stop).await {
            return;
        }

        loop {
            let prev_minute = minute_floor(Utc::now() - ChronoDuration::minutes(1));
            let minute_ts = prev_minute.format("%Y-%m-%d %H:%M:%S").to_string();

            let count = self.rollup_minute(&minute_ts);
            if count > 0 {
                info!(minute = %minute_ts, markets = count, "rollup complete");
            }

            self.purge_old_data();

            if wait_until_next_minute(&mut stop).await {
                return;
            }
        }
    }

    /// Re-roll the last [`SELF_HEAL_MINUTES`] minutes after a restart.
    pub fn self_heal(&self) {
        let now = minute_floor(Utc::now());
        let mut rolled = 0usize;
        let mut empty = 0usize;

        for i in 1..=SELF_HEAL_MINUTES {
            let target = now - ChronoDuration::minutes(i);
            let minute_ts = target.format("%Y-%m-%d %H:%M:%S").to_string();
            if self.rollup_minute(&minute_ts) > 0 {
                rolled += 1;
            } else {
                empty += 1;
            }
        }

        info!(rolled, empty, "self-heal finished");
    }

    /// Roll up one minute. `minute_ts` must have seconds = 00.
    ///
    /// Returns the number of markets rolled.
    pub fn rollup_minute(&self, minute_ts: &str) -> usize {
        let Some(end) = minute_end(minute_ts) else {
            warn!(minute = %minute_ts, "unparseable minute timestamp");
            return 0;
        };

        let conn = self.read_conn.lock();
        let markets: Vec<String> = {
            let mut stmt = match conn.prepare(
                "SELECT DISTINCT market FROM trade_snapshot_1s WHERE ts >= ?1 AND ts < ?2",
            ) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "rollup market scan failed");
                    return 0;
                }
            };
            match stmt
                .query_map([minute_ts, end.as_str()], |row| row.get(0))
                .and_then(|rows| rows.collect())
            {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "rollup market scan failed");
                    return 0;
                }
            }
        };

        let mut count = 0usize;
        for market in markets {
            let agg = conn.query_row(
                "SELECT
                    (SELECT open FROM trade_snapshot_1s
                     WHERE market = ?1 AND ts >= ?2 AND ts < ?3
                     ORDER BY ts ASC LIMIT 1),
                    MAX(high),
                    MIN(low),
                    (SELECT close FROM trade_snapshot_1s
                     WHERE market = ?1 AND ts >= ?2 AND ts < ?3
                     ORDER BY ts DESC LIMIT 1),
                    SUM(volume),
                    SUM(volume_krw)
                 FROM trade_snapshot_1s
                 WHERE market = ?1 AND ts >= ?2 AND ts < ?3",
                rusqlite::params![market, minute_ts, end],
                |row| {
                    Ok((
                        row.get::<_, Option<f64>>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                    ))
                },
            );

            match agg {
                Ok((Some(open), Some(high), Some(low), Some(close), Some(volume), Some(volume_krw))) => {
                    self.writer.enqueue(
                        INSERT_TRADE_1M,
                        vec![
                            Value::from(market),
                            Value::from(minute_ts.to_string()),
                            Value::from(open),
                            Value::from(high),
                            Value::from(low),
                            Value::from(close),
                            Value::from(volume),
                            Value::from(volume_krw),
                        ],
                        Priority::Normal,
                    );
                    count += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "rollup aggregation failed"),
            }
        }

        count
    }

    /// Queue deletion of 1-second rows past retention.
    pub fn purge_old_data(&self) {
        self.writer.enqueue(DELETE_OLD_1S, vec![], Priority::Normal);
        debug!("1s retention purge queued");
    }

    /// Roll the in-progress minute (graceful shutdown).
    pub fn force_rollup_current(&self) {
        let minute_ts = minute_floor(Utc::now()).format("%Y-%m-%d %H:%M:%S").to_string();
        let count = self.rollup_minute(&minute_ts);
        if count > 0 {
            info!(minute = %minute_ts, markets = count, "forced rollup on shutdown");
        }
    }
}

fn minute_floor(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.duration_trunc(ChronoDuration::minutes(1)).unwrap_or(dt)
}

fn minute_end(minute_ts: &str) -> Option<String> {
    let naive = NaiveDateTime::parse_from_str(minute_ts, "%Y-%m-%d %H:%M:%S").ok()?;
    Some((naive + ChronoDuration::minutes(1)).format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Sleep until the next minute boundary; returns true when stopped.
async fn wait_until_next_minute(stop: &mut watch::Receiver<bool>) -> bool {
    let now = Utc::now();
    let next = minute_floor(now) + ChronoDuration::minutes(1);
    let wait = (next - now).to_std().unwrap_or_default();

    tokio::select! {
        _ = tokio::time::sleep(wait) => false,
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::database::{apply_migrations, default_migrations_dir, open_connection};

    fn setup() -> (tempfile::TempDir, String, Aggregator, Arc<DatabaseWriter>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agg.db").to_string_lossy().to_string();
        let conn = open_connection(&path).unwrap();
        apply_migrations(&conn, &default_migrations_dir()).unwrap();
        let writer = DatabaseWriter::new(conn, 1000);
        writer.start();
        let read = open_connection(&path).unwrap();
        (dir, path, Aggregator::new(read, writer.clone()), writer)
    }

    fn insert_1s(path: &str, market: &str, ts: &str, o: f64, h: f64, l: f64, c: f64, v: f64) {
        let conn = open_connection(path).unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO trade_snapshot_1s \
             (market, ts, open, high, low, close, volume, volume_krw) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![market, ts, o, h, l, c, v, v * c],
        )
        .unwrap();
    }

    #[test]
    fn rollup_first_open_last_close_extrema_sums() {
        let (_dir, path, agg, writer) = setup();
        insert_1s(&path, "UPBIT:KRW-BTC", "2024-01-15 12:34:00", 100.0, 105.0, 99.0, 104.0, 1.0);
        insert_1s(&path, "UPBIT:KRW-BTC", "2024-01-15 12:34:30", 104.0, 110.0, 103.0, 108.0, 2.0);
        insert_1s(&path, "UPBIT:KRW-BTC", "2024-01-15 12:34:59", 108.0, 109.0, 95.0, 96.0, 3.0);
        // Next minute must not leak in.
        insert_1s(&path, "UPBIT:KRW-BTC", "2024-01-15 12:35:00", 500.0, 500.0, 500.0, 500.0, 1.0);

        assert_eq!(agg.rollup_minute("2024-01-15 12:34:00"), 1);
        writer.shutdown();

        let read = open_connection(&path).unwrap();
        let (open, high, low, close, volume): (f64, f64, f64, f64, f64) = read
            .query_row(
                "SELECT open, high, low, close, volume FROM trade_snapshot_1m \
                 WHERE market = 'UPBIT:KRW-BTC' AND ts = '2024-01-15 12:34:00'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .unwrap();
        assert_eq!(open, 100.0);
        assert_eq!(high, 110.0);
        assert_eq!(low, 95.0);
        assert_eq!(close, 96.0);
        assert_eq!(volume, 6.0);
    }

    #[test]
    fn rollup_is_idempotent() {
        let (_dir, path, agg, writer) = setup();
        insert_1s(&path, "BITHUMB:XYZ_KRW", "2024-01-15 12:34:10", 10.0, 12.0, 9.0, 11.0, 5.0);

        assert_eq!(agg.rollup_minute("2024-01-15 12:34:00"), 1);
        assert_eq!(agg.rollup_minute("2024-01-15 12:34:00"), 1);
        writer.shutdown();

        let read = open_connection(&path).unwrap();
        let count: i64 = read
            .query_row("SELECT COUNT(*) FROM trade_snapshot_1m", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let (open, close): (f64, f64) = read
            .query_row("SELECT open, close FROM trade_snapshot_1m", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!((open, close), (10.0, 11.0));
    }

    #[test]
    fn empty_minute_rolls_nothing() {
        let (_dir, _path, agg, writer) = setup();
        assert_eq!(agg.rollup_minute("2024-01-15 12:34:00"), 0);
        writer.shutdown();
    }

    #[test]
    fn purge_removes_stale_1s_rows() {
        let (_dir, path, agg, writer) = setup();
        insert_1s(&path, "UPBIT:KRW-BTC", "2000-01-01 00:00:00", 1.0, 1.0, 1.0, 1.0, 1.0);
        let fresh = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        insert_1s(&path, "UPBIT:KRW-BTC", &fresh, 1.0, 1.0, 1.0, 1.0, 1.0);

        agg.purge_old_data();
        writer.shutdown();

        let read = open_connection(&path).unwrap();
        let count: i64 = read
            .query_row("SELECT COUNT(*) FROM trade_snapshot_1s", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
