use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::store::unix_timestamp;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "requests_pages",
        sql: include_str!("migrations/v001_requests_pages.sql"),
    },
    Migration {
        version: 2,
        name: "completed_at",
        sql: include_str!("migrations/v002_completed_at.sql"),
    },
];

#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

/// Bring the family store at `db_path` up to the latest schema, creating it if needed.
pub fn migrate_store(db_path: &Path) -> Result<MigrateReport> {
    ensure_db_parent(db_path)?;
    let mut connection = open_connection(db_path)?;
    run_migrations(&mut connection)
}

/// Apply every migration newer than the recorded version, each inside its own savepoint.
pub(crate) fn run_migrations(connection: &mut Connection) -> Result<MigrateReport> {
    let start = recorded_version(connection)?;
    let mut applied = Vec::new();
    for migration in MIGRATIONS.iter().filter(|migration| migration.version > start) {
        apply_migration(connection, migration)
            .with_context(|| format!("migration v{:03}_{} failed", migration.version, migration.name))?;
        applied.push(AppliedMigration {
            version: migration.version,
            name: migration.name.to_string(),
        });
    }
    Ok(MigrateReport {
        applied,
        current_version: current_version(connection)?,
    })
}

pub fn pending_migration_count(db_path: &Path) -> Result<usize> {
    if !db_path.exists() {
        return Ok(MIGRATIONS.len());
    }
    let current = recorded_version(&open_connection(db_path)?)?;
    Ok(MIGRATIONS
        .iter()
        .filter(|migration| migration.version > current)
        .count())
}

/// Highest applied migration, 0 on a fresh store.
pub fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read schema version")?;
    u32::try_from(version).context("schema version out of range")
}

fn recorded_version(connection: &Connection) -> Result<u32> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations")?;
    current_version(connection)
}

fn apply_migration(connection: &mut Connection, migration: &Migration) -> Result<()> {
    let savepoint = connection
        .savepoint()
        .context("failed to open migration savepoint")?;
    savepoint
        .execute_batch(migration.sql)
        .context("schema statements failed")?;
    savepoint
        .execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![i64::from(migration.version), migration.name, unix_timestamp()?],
        )
        .context("failed to record migration")?;
    savepoint
        .commit()
        .context("failed to release migration savepoint")
}

pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    // Page rows rely on ON DELETE CASCADE.
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign keys")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to switch to WAL")?;
    Ok(connection)
}

pub(crate) fn ensure_db_parent(db_path: &Path) -> Result<()> {
    match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display())),
        _ => Ok(()),
    }
}
