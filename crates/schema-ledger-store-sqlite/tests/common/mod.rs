//! Shared fixtures for the `SQLite` integration tests.

use std::path::{Path, PathBuf};
use std::sync::Once;

use rusqlite::{params, Connection};
use schema_ledger_core::EngineConfig;
use schema_ledger_store_sqlite::{SqliteRegistry, SqliteVersionStore};
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness so it shows on failure.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Temporary on-disk database and the directory holding it.
#[allow(dead_code)]
pub struct TestContext {
    pub temp_dir: TempDir,
    pub db_path: PathBuf,
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> anyhow::Result<Self> {
        init_tracing();
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("ledger.db");
        Ok(Self { temp_dir, db_path })
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn open(&self, config: &EngineConfig) -> anyhow::Result<SqliteVersionStore> {
        SqliteVersionStore::open(&self.db_path, config)
    }

    pub fn open_default(&self) -> anyhow::Result<SqliteVersionStore> {
        self.open(&EngineConfig::default())
    }
}

/// Three migrations that build a small inventory schema.
#[allow(dead_code)]
pub fn inventory_registry() -> anyhow::Result<SqliteRegistry> {
    let mut registry = SqliteRegistry::new();
    registry.register_fn(
        1,
        "create hosts",
        |conn: &Connection| {
            conn.execute_batch(
                "CREATE TABLE hosts (id INTEGER PRIMARY KEY, hostname TEXT NOT NULL, serial TEXT)",
            )?;
            Ok(())
        },
        |conn: &Connection| {
            conn.execute_batch("DROP TABLE hosts")?;
            Ok(())
        },
    )?;
    registry.register_fn(
        2,
        "create labels",
        |conn: &Connection| {
            conn.execute_batch(
                "CREATE TABLE labels (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE)",
            )?;
            Ok(())
        },
        |conn: &Connection| {
            conn.execute_batch("DROP TABLE labels")?;
            Ok(())
        },
    )?;
    registry.register_fn(
        3,
        "add hosts.platform",
        |conn: &Connection| {
            conn.execute_batch(
                "ALTER TABLE hosts ADD COLUMN platform TEXT NOT NULL DEFAULT 'linux'",
            )?;
            Ok(())
        },
        |conn: &Connection| {
            conn.execute_batch("ALTER TABLE hosts DROP COLUMN platform")?;
            Ok(())
        },
    )?;
    Ok(registry)
}

#[allow(dead_code)]
pub fn count_rows(conn: &Connection, table: &str) -> anyhow::Result<i64> {
    Ok(conn.query_row(
        &format!("SELECT COUNT(*) FROM {table}"),
        [],
        |row| row.get(0),
    )?)
}

#[allow(dead_code)]
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let found = conn.query_row(
        &format!("SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = ?1"),
        params![column],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(found > 0)
}
