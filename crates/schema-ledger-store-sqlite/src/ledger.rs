use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use schema_ledger_core::{validate_identifier, AppliedVersionRecord, Version};
use time::OffsetDateTime;
use tracing::debug;

/// The applied-version table of one ledger. Several ledgers can live in the
/// same database under different table names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTable {
    name: String,
}

impl VersionTable {
    /// # Errors
    /// Returns an error when `name` is not a plain SQL identifier.
    pub fn new(name: &str) -> Result<Self> {
        validate_identifier(name)?;
        Ok(Self {
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the table if needed. A table created by an older layout without
    /// the `name` column is upgraded in place.
    ///
    /// # Errors
    /// Returns an error when the DDL fails.
    pub fn ensure(&self, conn: &Connection) -> Result<()> {
        let table = &self.name;
        if table_exists(conn, table)? {
            if !table_has_column(conn, table, "name")? {
                conn.execute_batch(&format!(
                    "ALTER TABLE {table} ADD COLUMN name TEXT NOT NULL DEFAULT ''"
                ))
                .with_context(|| format!("failed to add name column to {table}"))?;
                debug!(table = %table, "upgraded version table with name column");
            }
            return Ok(());
        }

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
               version INTEGER PRIMARY KEY,
               name TEXT NOT NULL DEFAULT '',
               applied_at TEXT NOT NULL
             );"
        ))
        .with_context(|| format!("failed to create version table {table}"))?;
        debug!(table = %table, "created version table");
        Ok(())
    }

    /// # Errors
    /// Returns an error when the table cannot be read or a row is malformed.
    pub fn applied(&self, conn: &Connection) -> Result<Vec<AppliedVersionRecord>> {
        let table = &self.name;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT version, name, applied_at FROM {table} ORDER BY version ASC"
            ))
            .with_context(|| format!("failed to prepare read of {table}"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .with_context(|| format!("failed to query {table}"))?;

        let mut records = Vec::new();
        for row in rows {
            let (version, name, applied_at) =
                row.with_context(|| format!("failed to decode row of {table}"))?;
            records.push(AppliedVersionRecord {
                version: Version(version),
                name,
                applied_at: parse_rfc3339(&applied_at)?,
            });
        }
        Ok(records)
    }

    /// # Errors
    /// Returns an error when the table cannot be read.
    pub fn current_version(&self, conn: &Connection) -> Result<Version> {
        let table = &self.name;
        let version = conn
            .query_row(
                &format!("SELECT COALESCE(MAX(version), 0) FROM {table}"),
                [],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to read current version from {table}"))?;
        Ok(Version(version))
    }

    /// Insert the row for `version`. A row that already exists is an error,
    /// never silently ignored.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn record_applied(&self, conn: &Connection, version: Version, name: &str) -> Result<()> {
        let table = &self.name;
        let now = now_rfc3339()?;
        conn.execute(
            &format!("INSERT INTO {table}(version, name, applied_at) VALUES (?1, ?2, ?3)"),
            params![version.get(), name, now],
        )
        .with_context(|| format!("failed to record migration version {version} in {table}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the delete fails or no row existed for `version`.
    pub fn record_rolled_back(&self, conn: &Connection, version: Version) -> Result<()> {
        let table = &self.name;
        let deleted = conn
            .execute(
                &format!("DELETE FROM {table} WHERE version = ?1"),
                params![version.get()],
            )
            .with_context(|| format!("failed to delete migration version {version} from {table}"))?;
        if deleted == 0 {
            return Err(anyhow!("migration version {version} is not recorded in {table}"));
        }
        Ok(())
    }
}

/// # Errors
/// Returns an error when `sqlite_master` cannot be queried.
pub fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect columns of {table}"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .with_context(|| format!("failed to list columns of {table}"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to decode columns of {table}"))?;
    Ok(columns.iter().any(|name| name == column))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
