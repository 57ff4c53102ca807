//! Additive schema migrations with a per-store version table.
//!
//! Each store declares an ordered list of [`MigrationStep`]s. The
//! `schema_migrations` table records every applied step. Databases created
//! before the version table existed are recognized by probing column
//! presence for columns introduced in later steps, and their baseline
//! version is recorded without re-running the steps.

use rusqlite::{params, Connection, OptionalExtension};

/// One additive migration step.
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    pub version: i64,
    /// Executed with `execute_batch`; may contain several statements.
    pub sql: &'static str,
}

/// Whether a table exists in the open database.
pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Whether a column exists on a table. Used to infer the schema version of
/// pre-versioned databases.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM pragma_table_info(?1) WHERE name = ?2",
            params![table, column],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Highest applied migration version, or `None` when the version table does
/// not exist yet.
pub fn current_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(None);
    }
    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(Some(version))
}

/// Applies all pending steps inside one transaction.
///
/// `baseline` is consulted only when the version table is absent: it
/// inspects the existing schema (column probing) and returns the version the
/// database is already at -- 0 for a fresh database.
pub fn run(
    conn: &mut Connection,
    steps: &[MigrationStep],
    baseline: impl Fn(&Connection) -> rusqlite::Result<i64>,
    now_ns: i64,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;

    let mut version = match current_version(&tx)? {
        Some(version) => version,
        None => {
            tx.execute_batch(
                "CREATE TABLE schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at_ns INTEGER NOT NULL
                )",
            )?;
            let baseline = baseline(&tx)?;
            for step in steps.iter().filter(|s| s.version <= baseline) {
                tx.execute(
                    "INSERT INTO schema_migrations (version, applied_at_ns) VALUES (?1, ?2)",
                    params![step.version, now_ns],
                )?;
            }
            baseline
        }
    };

    for step in steps {
        if step.version <= version {
            continue;
        }
        tx.execute_batch(step.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at_ns) VALUES (?1, ?2)",
            params![step.version, now_ns],
        )?;
        version = step.version;
    }

    tx.commit()
}
