//! `SQLite` Version Store for the schema-ledger engine.
//!
//! Migration steps receive the open `rusqlite` transaction as a `&Connection`
//! and may run DDL and DML through it; the version row is written through the
//! same transaction before it commits.

mod chunked;
mod ledger;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, DatabaseName};
use schema_ledger_core::{
    AppliedVersionRecord, Direction, EngineConfig, MigrationDescriptor, StepFailure, Version,
    VersionStore,
};
use time::OffsetDateTime;
use tracing::info;

pub use chunked::write_in_batches;
pub use ledger::{table_exists, VersionTable};

/// A registry whose steps run against a `SQLite` transaction.
pub type SqliteRegistry = schema_ledger_core::Registry<Connection>;

#[derive(Debug)]
pub struct SqliteVersionStore {
    conn: Connection,
    table: VersionTable,
    backup_dir: Option<PathBuf>,
    last_backup: Option<PathBuf>,
}

impl SqliteVersionStore {
    /// Open a database file, configure runtime pragmas, and make sure the
    /// configured version table exists.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, pragmas cannot be
    /// applied, or the version table cannot be created.
    pub fn open(path: &Path, config: &EngineConfig) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to enable WAL journal mode")?;
        Self::from_connection(conn, config)
    }

    /// # Errors
    /// See [`SqliteVersionStore::from_connection`].
    pub fn open_in_memory(config: &EngineConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("failed to open in-memory sqlite database")?;
        Self::from_connection(conn, config)
    }

    /// Wrap an existing connection.
    ///
    /// # Errors
    /// Returns an error when the config is invalid, pragmas cannot be applied,
    /// or the version table cannot be created.
    pub fn from_connection(conn: Connection, config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        conn.execute_batch(&format!(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            config.busy_timeout_ms
        ))
        .context("failed to configure sqlite pragmas")?;

        let table = VersionTable::new(&config.version_table)?;
        table.ensure(&conn)?;
        Ok(Self {
            conn,
            table,
            backup_dir: config.backup_dir.clone(),
            last_backup: None,
        })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    #[must_use]
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    #[must_use]
    pub fn version_table(&self) -> &VersionTable {
        &self.table
    }

    /// Path of the backup written by the most recent run, if any.
    #[must_use]
    pub fn last_backup(&self) -> Option<&Path> {
        self.last_backup.as_deref()
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create parent directory for backup file {}",
                    out_file.display()
                )
            })?;
        }
        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }
}

impl VersionStore for SqliteVersionStore {
    type Handle = Connection;

    fn applied_versions(&mut self) -> Result<Vec<AppliedVersionRecord>> {
        self.table.applied(&self.conn)
    }

    fn current_version(&mut self) -> Result<Version> {
        self.table.current_version(&self.conn)
    }

    fn execute_step(
        &mut self,
        descriptor: &MigrationDescriptor<Connection>,
        direction: Direction,
    ) -> Result<(), StepFailure> {
        let version = descriptor.version;
        // Dropping `tx` on any early return rolls it back.
        let tx = self.conn.transaction().map_err(StepFailure::begin)?;

        descriptor
            .step(direction)
            .run(&tx)
            .with_context(|| format!("migration {version} ({}) {direction} step", descriptor.name))
            .map_err(StepFailure::step)?;

        let recorded = match direction {
            Direction::Forward => self.table.record_applied(&tx, version, &descriptor.name),
            Direction::Reverse => self.table.record_rolled_back(&tx, version),
        };
        recorded.map_err(StepFailure::bookkeeping)?;

        tx.commit().map_err(StepFailure::commit)
    }

    fn before_run(&mut self, pending: &[Version], direction: Direction) -> Result<()> {
        let Some(dir) = self.backup_dir.as_ref() else {
            return Ok(());
        };
        let first = pending.first().copied().unwrap_or(Version::ZERO);
        let out_file = dir.join(format!(
            "{}-pre-{direction}-{first}-{}.sqlite3",
            self.table.name(),
            OffsetDateTime::now_utc().unix_timestamp_nanos()
        ));
        self.backup_database(&out_file)?;
        info!(
            path = %out_file.display(),
            %direction,
            steps = pending.len(),
            "wrote pre-migration backup"
        );
        self.last_backup = Some(out_file);
        Ok(())
    }
}
