//! Single-writer database worker.
//!
//! All mutations flow through one bounded queue drained by a dedicated OS
//! thread, so SQLite never sees concurrent writers. The worker batches up to
//! [`BATCH_MAX`] statements per transaction; a failed batch is rolled back
//! and retried statement-by-statement so one poisonous row cannot starve the
//! rest.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// Maximum statements gathered into one transaction.
const BATCH_MAX: usize = 100;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 50_000;

/// Write priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Non-blocking enqueue; dropped when the queue is full.
    Normal,
    /// Blocks the caller until the queue accepts the statement.
    Critical,
}

/// A single SQL statement with bound parameters.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub sql: String,
    pub params: Vec<Value>,
}

enum QueueItem {
    Stmt(WriteRequest),
    Sentinel,
}

/// Queue handle shared by every producer.
pub struct DatabaseWriter {
    tx: Sender<QueueItem>,
    rx: Mutex<Option<Receiver<QueueItem>>>,
    conn: Mutex<Option<Connection>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    drop_count: AtomicU64,
}

impl DatabaseWriter {
    /// Wrap a connection the worker thread will own once started.
    pub fn new(conn: Connection, capacity: usize) -> Arc<Self> {
        let (tx, rx) = bounded(capacity);
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            conn: Mutex::new(Some(conn)),
            handle: Mutex::new(None),
            drop_count: AtomicU64::new(0),
        })
    }

    /// Spawn the worker thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let rx = self.rx.lock().take().expect("writer receiver already taken");
        let conn = self.conn.lock().take().expect("writer connection already taken");
        let capacity = self.tx.capacity().unwrap_or(DEFAULT_QUEUE_CAPACITY);

        *handle = Some(
            std::thread::Builder::new()
                .name("db-writer".into())
                .spawn(move || run_worker(conn, rx))
                .expect("failed to spawn db-writer thread"),
        );
        info!(capacity, "writer thread started");
    }

    /// Current queue depth.
    pub fn queue_size(&self) -> usize {
        self.tx.len()
    }

    /// Statements dropped because the queue was full. Monotonic.
    pub fn drop_count(&self) -> u64 {
        self.drop_count.load(Ordering::Relaxed)
    }

    /// Queue a statement for execution.
    pub fn enqueue(&self, sql: impl Into<String>, params: Vec<Value>, priority: Priority) {
        let item = QueueItem::Stmt(WriteRequest { sql: sql.into(), params });
        match priority {
            Priority::Critical => {
                // Blocks until the worker makes room; critical rows are never dropped.
                let _ = self.tx.send(item);
            }
            Priority::Normal => {
                if let Err(TrySendError::Full(_)) = self.tx.try_send(item) {
                    self.record_drop();
                }
            }
        }
    }

    fn record_drop(&self) {
        let c = self.drop_count.fetch_add(1, Ordering::Relaxed) + 1;
        if c == 1 || c == 10 || c == 100 || c % 1000 == 0 {
            warn!(dropped = c, "writer queue full, statement dropped");
        }
    }

    /// Send the shutdown sentinel and join the worker.
    ///
    /// Remaining queued statements are drained and committed before the
    /// thread exits.
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        info!(remaining = self.queue_size(), "writer shutdown requested");
        let _ = self.tx.send(QueueItem::Sentinel);
        if handle.join().is_err() {
            error!("writer thread panicked during shutdown");
        }
        info!(dropped_total = self.drop_count(), "writer shut down");
    }
}

fn run_worker(conn: Connection, rx: Receiver<QueueItem>) {
    info!("writer thread running");

    loop {
        // Block for the first item of the next batch.
        let first = match rx.recv() {
            Ok(QueueItem::Stmt(req)) => req,
            Ok(QueueItem::Sentinel) | Err(_) => break,
        };

        let mut batch = vec![first];
        let mut sentinel_seen = false;

        while batch.len() < BATCH_MAX {
            match rx.try_recv() {
                Ok(QueueItem::Stmt(req)) => batch.push(req),
                Ok(QueueItem::Sentinel) => {
                    sentinel_seen = true;
                    break;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        commit_batch(&conn, &batch);

        if sentinel_seen {
            break;
        }
    }

    // Drain whatever arrived after the sentinel.
    let mut remaining = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let QueueItem::Stmt(req) = item {
            remaining.push(req);
        }
    }
    if !remaining.is_empty() {
        let count = remaining.len();
        commit_batch(&conn, &remaining);
        info!(count, "remaining statements committed");
    }

    info!("writer thread exiting");
}

/// Execute a batch inside one transaction; on failure roll back and retry
/// each statement on its own.
fn commit_batch(conn: &Connection, batch: &[WriteRequest]) {
    let run_all = || -> rusqlite::Result<()> {
        conn.execute("BEGIN", [])?;
        for req in batch {
            conn.execute(&req.sql, rusqlite::params_from_iter(req.params.iter()))?;
        }
        conn.execute("COMMIT", [])?;
        Ok(())
    };

    if let Err(e) = run_all() {
        warn!(error = %e, size = batch.len(), "batch commit failed, retrying individually");
        let _ = conn.execute("ROLLBACK", []);
        commit_individually(conn, batch);
    }
}

fn commit_individually(conn: &Connection, batch: &[WriteRequest]) {
    let mut success = 0usize;
    let mut failed = 0usize;
    for req in batch {
        match conn.execute(&req.sql, rusqlite::params_from_iter(req.params.iter())) {
            Ok(_) => success += 1,
            Err(e) => {
                failed += 1;
                error!(
                    sql = &req.sql[..req.sql.len().min(80)],
                    error = %e,
                    "statement failed on individual retry"
                );
            }
        }
    }
    if failed > 0 {
        warn!(success, failed, "individual retry finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::database::{apply_migrations, default_migrations_dir, open_connection};

    fn temp_db() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("writer_test.db").to_string_lossy().to_string();
        (dir, path)
    }

    fn setup_writer(path: &str) -> Arc<DatabaseWriter> {
        let conn = open_connection(path).unwrap();
        apply_migrations(&conn, &default_migrations_dir()).unwrap();
        let writer = DatabaseWriter::new(conn, 1000);
        writer.start();
        writer
    }

    fn insert_1s(market: &str, ts: &str) -> WriteRequest {
        WriteRequest {
            sql: "INSERT OR REPLACE INTO trade_snapshot_1s \
                  (market, ts, open, high, low, close, volume, volume_krw) \
                  VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                .into(),
            params: vec![
                Value::from(market.to_string()),
                Value::from(ts.to_string()),
                Value::from(1.0),
                Value::from(2.0),
                Value::from(0.5),
                Value::from(1.5),
                Value::from(3.0),
                Value::from(4.5),
            ],
        }
    }

    #[test]
    fn batch_with_poison_row_commits_the_rest() {
        let (_dir, path) = temp_db();
        let writer = setup_writer(&path);

        let a = insert_1s("UPBIT:KRW-AAA", "2024-01-15 12:00:00");
        let b = insert_1s("UPBIT:KRW-BBB", "2024-01-15 12:00:00");
        writer.enqueue(a.sql, a.params, Priority::Normal);
        writer.enqueue("INSERT INTO no_such_table VALUES (1)", vec![], Priority::Normal);
        writer.enqueue(b.sql, b.params, Priority::Normal);

        let drops_before = writer.drop_count();
        writer.shutdown();

        let read = open_connection(&path).unwrap();
        let count: i64 = read
            .query_row("SELECT COUNT(*) FROM trade_snapshot_1s", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
        // Per-statement retry failures are not queue drops.
        assert_eq!(writer.drop_count(), drops_before);
    }

    #[test]
    fn normal_overflow_drops_and_counts() {
        let (_dir, path) = temp_db();
        let conn = open_connection(&path).unwrap();
        apply_migrations(&conn, &default_migrations_dir()).unwrap();
        // Never started: the queue only fills up.
        let writer = DatabaseWriter::new(conn, 2);

        for i in 0..5 {
            let req = insert_1s("UPBIT:KRW-AAA", &format!("2024-01-15 12:00:0{}", i));
            writer.enqueue(req.sql, req.params, Priority::Normal);
        }
        assert_eq!(writer.queue_size(), 2);
        assert_eq!(writer.drop_count(), 3);
    }

    #[test]
    fn shutdown_drains_remaining() {
        let (_dir, path) = temp_db();
        let writer = setup_writer(&path);

        for i in 0..10 {
            let req = insert_1s("BITHUMB:AAA_KRW", &format!("2024-01-15 12:00:{:02}", i));
            writer.enqueue(req.sql, req.params, Priority::Critical);
        }
        writer.shutdown();

        let read = open_connection(&path).unwrap();
        let count: i64 = read
            .query_row("SELECT COUNT(*) FROM trade_snapshot_1s", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 10);
    }
}
