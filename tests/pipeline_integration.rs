//! End-to-end pipeline checks against a real on-disk database:
//! trades -> 1s buckets -> writer -> 1m rollup -> retention, plus the
//! writer's poison-batch recovery and the debounced alert path.

use std::sync::Arc;
use std::time::Duration;

use kimp_radar::alerts::TelegramAlert;
use kimp_radar::collectors::{Aggregator, SecondBucket};
use kimp_radar::store::database::{apply_migrations, default_migrations_dir, open_connection};
use kimp_radar::store::writer::{DatabaseWriter, Priority};

use rusqlite::types::Value;

fn setup_db() -> (tempfile::TempDir, String, Arc<DatabaseWriter>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.db").to_string_lossy().to_string();
    let conn = open_connection(&path).unwrap();
    apply_migrations(&conn, &default_migrations_dir()).unwrap();
    let writer = DatabaseWriter::new(conn, 10_000);
    writer.start();
    (dir, path, writer)
}

fn settle(writer: &Arc<DatabaseWriter>) {
    while writer.queue_size() > 0 {
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(30));
}

#[test]
fn trades_flow_to_minute_bars() {
    let (_dir, path, writer) = setup_db();

    // One minute of trades on two markets starting 2024-01-15 12:34:00 UTC.
    let minute_start: i64 = 1_705_322_040;
    let mut bucket = SecondBucket::new(writer.clone());
    for i in 0..60 {
        let ts = minute_start + i;
        let price = 100.0 + i as f64;
        bucket.add_trade("UPBIT:KRW-XYZ", price, 1.0, ts);
        bucket.add_trade("BITHUMB:XYZ_KRW", price * 1.01, 2.0, ts);
    }
    assert_eq!(bucket.flush_completed(minute_start + 60), 120);
    settle(&writer);

    let aggregator = Aggregator::new(open_connection(&path).unwrap(), writer.clone());
    assert_eq!(aggregator.rollup_minute("2024-01-15 12:34:00"), 2);
    // Idempotence: a re-rollup supersedes rather than duplicates.
    assert_eq!(aggregator.rollup_minute("2024-01-15 12:34:00"), 2);
    writer.shutdown();

    let read = open_connection(&path).unwrap();
    let count_1m: i64 = read
        .query_row("SELECT COUNT(*) FROM trade_snapshot_1m", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count_1m, 2);

    let (open, high, low, close, volume): (f64, f64, f64, f64, f64) = read
        .query_row(
            "SELECT open, high, low, close, volume FROM trade_snapshot_1m \
             WHERE market = 'UPBIT:KRW-XYZ'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .unwrap();
    assert_eq!(open, 100.0);
    assert_eq!(close, 159.0);
    assert_eq!(high, 159.0);
    assert_eq!(low, 100.0);
    assert_eq!(volume, 60.0);
    assert!(low <= open && open <= high && low <= close && close <= high);

    // Every persisted 1s bar satisfies the OHLC invariant.
    let violations: i64 = read
        .query_row(
            "SELECT COUNT(*) FROM trade_snapshot_1s \
             WHERE low > open OR low > close OR high < open OR high < close OR volume < 0",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(violations, 0);
}

#[test]
fn writer_survives_poison_statement_between_valid_rows() {
    let (_dir, path, writer) = setup_db();

    let insert = |market: &str| {
        (
            "INSERT OR REPLACE INTO trade_snapshot_1s \
             (market, ts, open, high, low, close, volume, volume_krw) \
             VALUES (?1, '2024-01-15 12:00:00', 1, 2, 0.5, 1.5, 1, 1.5)"
                .to_string(),
            vec![Value::from(market.to_string())],
        )
    };

    let drops_before = writer.drop_count();
    let (sql_a, params_a) = insert("ROW-A");
    writer.enqueue(sql_a, params_a, Priority::Normal);
    writer.enqueue("INSERT INTO table_that_does_not_exist VALUES (1)", vec![], Priority::Normal);
    let (sql_b, params_b) = insert("ROW-B");
    writer.enqueue(sql_b, params_b, Priority::Normal);
    writer.shutdown();

    let read = open_connection(&path).unwrap();
    let markets: Vec<String> = read
        .prepare("SELECT market FROM trade_snapshot_1s ORDER BY market")
        .unwrap()
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(markets, vec!["ROW-A".to_string(), "ROW-B".to_string()]);
    // Execution failures are not queue drops; the counter never moved.
    assert_eq!(writer.drop_count(), drops_before);
}

#[test]
fn old_seconds_are_purged_but_minutes_survive() {
    let (_dir, path, writer) = setup_db();

    {
        let conn = open_connection(&path).unwrap();
        conn.execute(
            "INSERT INTO trade_snapshot_1s \
             (market, ts, open, high, low, close, volume, volume_krw) \
             VALUES ('UPBIT:KRW-OLD', '2020-01-01 00:00:00', 1, 1, 1, 1, 1, 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO trade_snapshot_1m \
             (market, ts, open, high, low, close, volume, volume_krw) \
             VALUES ('UPBIT:KRW-OLD', '2020-01-01 00:00:00', 1, 1, 1, 1, 1, 1)",
            [],
        )
        .unwrap();
    }

    let aggregator = Aggregator::new(open_connection(&path).unwrap(), writer.clone());
    aggregator.purge_old_data();
    writer.shutdown();

    let read = open_connection(&path).unwrap();
    let count_1s: i64 = read
        .query_row("SELECT COUNT(*) FROM trade_snapshot_1s", [], |r| r.get(0))
        .unwrap();
    let count_1m: i64 = read
        .query_row("SELECT COUNT(*) FROM trade_snapshot_1m", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count_1s, 0);
    assert_eq!(count_1m, 1);
}

#[tokio::test]
async fn medium_alerts_debounce_per_key() {
    let (_dir, path, writer) = setup_db();
    let alert = TelegramAlert::new(writer.clone(), open_connection(&path).unwrap(), None, None);

    use kimp_radar::models::AlertLevel;
    alert.send(AlertLevel::Medium, "first send", Some("listing:XYZ")).await;
    settle(&writer);
    // Second send inside the TTL is swallowed; record stays intact.
    alert.send(AlertLevel::Medium, "second send", Some("listing:XYZ")).await;
    writer.shutdown();

    let read = open_connection(&path).unwrap();
    let (count, valid): (i64, i64) = read
        .query_row(
            "SELECT COUNT(*), SUM(expires_at >= last_sent_at) FROM alert_debounce",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(valid, 1);
}
