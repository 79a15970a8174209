//! SQLite connection setup and schema migrations.
//!
//! Every connection runs in WAL mode with NORMAL synchronous, a 30s busy
//! timeout and in-memory temp storage. Migration files are applied in
//! name-lexicographic order and recorded with a SHA-256 checksum; a checksum
//! mismatch for a previously applied version is a fatal startup error.

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default database file, anchored to the crate directory so running from a
/// different working directory does not create a stray empty DB.
pub fn default_db_path() -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join("kimp_radar.db").to_string_lossy().to_string()
}

/// Default migrations directory next to the crate manifest.
pub fn default_migrations_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations")
}

/// Resolve the database path from `DATABASE_URL` or the default.
pub fn resolve_db_path() -> Result<String> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if url.starts_with("postgres") => {
            bail!("PostgreSQL is not supported; only SQLite paths are accepted")
        }
        Ok(url) if !url.trim().is_empty() => Ok(url),
        _ => Ok(default_db_path()),
    }
}

/// Open a connection with the standard pragmas applied.
pub fn open_connection(db_path: &str) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("failed to open database: {}", db_path))?;
    apply_pragmas(&conn)?;
    info!(path = %db_path, "database connection opened (WAL)");
    Ok(conn)
}

/// Open an in-memory connection (tests).
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    apply_pragmas(&conn)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA busy_timeout = 30000;\n\
         PRAGMA temp_store = MEMORY;",
    )?;
    Ok(())
}

fn ensure_schema_version_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            filename   TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now')),
            checksum   TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

fn file_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Apply all `*.sql` migrations under `migrations_dir`.
///
/// Returns the current schema version. Files whose stem does not start with a
/// numeric version (`001_initial.sql` -> 1) are skipped with a warning.
pub fn apply_migrations(conn: &Connection, migrations_dir: &Path) -> Result<i64> {
    if !migrations_dir.is_dir() {
        bail!("migrations directory not found: {}", migrations_dir.display());
    }

    ensure_schema_version_table(conn)?;

    let mut applied: HashMap<i64, String> = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT version, checksum FROM schema_version")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
        for row in rows {
            let (version, checksum) = row?;
            applied.insert(version, checksum);
        }
    }

    let mut sql_files: Vec<PathBuf> = std::fs::read_dir(migrations_dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|e| e == "sql").unwrap_or(false))
        .collect();
    sql_files.sort();

    if sql_files.is_empty() {
        info!("no migration files to apply");
        return Ok(0);
    }

    let mut current_version: i64 = 0;

    for sql_file in sql_files {
        let name = sql_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem = sql_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let version: i64 = match stem.split('_').next().and_then(|v| v.parse().ok()) {
            Some(v) => v,
            None => {
                warn!(file = %name, "migration filename has no numeric version, skipping");
                continue;
            }
        };

        let bytes = std::fs::read(&sql_file)
            .with_context(|| format!("failed to read migration {}", name))?;
        let checksum = file_checksum(&bytes);

        if let Some(existing) = applied.get(&version) {
            if existing != &checksum {
                bail!(
                    "migration tampering detected: {} (recorded={}, current={})",
                    name, existing, checksum
                );
            }
            debug!(file = %name, "migration already applied");
            current_version = current_version.max(version);
            continue;
        }

        let sql = String::from_utf8(bytes)
            .with_context(|| format!("migration {} is not valid UTF-8", name))?;
        conn.execute_batch(&sql)
            .with_context(|| format!("migration failed: {}", name))?;
        conn.execute(
            "INSERT INTO schema_version (version, filename, checksum) VALUES (?1, ?2, ?3)",
            rusqlite::params![version, name, checksum],
        )?;
        current_version = current_version.max(version);
        info!(file = %name, version, "migration applied");
    }

    info!(version = current_version, "schema up to date");
    Ok(current_version)
}
