//! Health snapshot file.
//!
//! Every 30 seconds a JSON snapshot of collector and writer state is
//! written via tmp + rename so external consumers never see a torn file.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::collectors::robust_ws::CollectorHandle;
use crate::store::writer::DatabaseWriter;

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct HealthSnapshot {
    heartbeat_timestamp: f64,
    schema_version: i64,
    ws_connected: std::collections::BTreeMap<&'static str, bool>,
    last_msg_time: std::collections::BTreeMap<&'static str, f64>,
    queue_size: usize,
    queue_drops: u64,
    last_trade_time: f64,
}

pub struct HealthMonitor {
    path: PathBuf,
    writer: Arc<DatabaseWriter>,
    collectors: Vec<CollectorHandle>,
    schema_version: i64,
}

impl HealthMonitor {
    /// Path falls back to `HEALTH_PATH`, then `health.json` next to the
    /// crate manifest.
    pub fn new(
        writer: Arc<DatabaseWriter>,
        collectors: Vec<CollectorHandle>,
        schema_version: i64,
        path: Option<PathBuf>,
    ) -> Self {
        let path = path
            .or_else(|| std::env::var("HEALTH_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("health.json"));
        Self { path, writer, collectors, schema_version }
    }

    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEALTH_INTERVAL) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                    continue;
                }
            }

            if let Err(e) = self.write_snapshot() {
                debug!(error = %e, "health snapshot write failed");
            }
        }
    }

    /// Serialize current state and atomically replace the health file.
    pub fn write_snapshot(&self) -> anyhow::Result<()> {
        let mut ws_connected = std::collections::BTreeMap::new();
        let mut last_msg_time = std::collections::BTreeMap::new();
        let mut last_trade_time: f64 = 0.0;
        for handle in &self.collectors {
            ws_connected.insert(handle.name, handle.is_connected());
            let last = handle.last_msg_time();
            last_msg_time.insert(handle.name, last);
            last_trade_time = last_trade_time.max(last);
        }

        let snapshot = HealthSnapshot {
            heartbeat_timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            schema_version: self.schema_version,
            ws_connected,
            last_msg_time,
            queue_size: self.writer.queue_size(),
            queue_drops: self.writer.drop_count(),
            last_trade_time,
        };

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::database::{apply_migrations, default_migrations_dir, open_connection};

    #[test]
    fn snapshot_is_valid_json_with_expected_keys() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("health.db").to_string_lossy().to_string();
        let conn = open_connection(&db).unwrap();
        apply_migrations(&conn, &default_migrations_dir()).unwrap();
        let writer = DatabaseWriter::new(conn, 100);

        let path = dir.path().join("health.json");
        let monitor = HealthMonitor::new(writer.clone(), Vec::new(), 2, Some(path.clone()));
        monitor.write_snapshot().unwrap();

        let body: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(body["schema_version"], 2);
        assert_eq!(body["queue_drops"], 0);
        assert!(body["heartbeat_timestamp"].as_f64().unwrap() > 0.0);
        assert!(body.get("ws_connected").is_some());

        // No stray tmp file after the rename.
        assert!(!path.with_extension("json.tmp").exists());
    }
}
