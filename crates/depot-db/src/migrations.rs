//! Versioned schema migrations with rollback.
//!
//! Applied versions are tracked in the `schema_version` ledger table. Each
//! migration runs in its own transaction together with its ledger insert (or
//! delete, on rollback), so the ledger only ever lists fully committed steps.
//! A failing step is rolled back and aborts the rest of the batch.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// A reversible schema change identified by a positive version number.
///
/// `up` and `down` run inside a transaction owned by the
/// [`MigrationManager`] and must not commit on their own. Both should
/// tolerate a schema that already reflects a partial earlier attempt.
pub trait Migration: Send + Sync {
    /// Unique, positive version number.
    fn version(&self) -> u32;

    /// Human-readable summary recorded in the ledger.
    fn description(&self) -> &str;

    /// Applies the change.
    fn up(&self, conn: &Connection) -> rusqlite::Result<()>;

    /// Reverts the change.
    fn down(&self, conn: &Connection) -> rusqlite::Result<()>;
}

/// A migration written as plain SQL batches.
#[derive(Debug, Clone, Copy)]
pub struct SqlMigration {
    pub version: u32,
    pub description: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

impl Migration for SqlMigration {
    fn version(&self) -> u32 {
        self.version
    }

    fn description(&self) -> &str {
        self.description
    }

    fn up(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(self.up_sql)
    }

    fn down(&self, conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(self.down_sql)
    }
}

/// A migration whose steps are Rust functions.
#[derive(Debug, Clone, Copy)]
pub struct FnMigration {
    pub version: u32,
    pub description: &'static str,
    pub up: fn(&Connection) -> rusqlite::Result<()>,
    pub down: fn(&Connection) -> rusqlite::Result<()>,
}

impl Migration for FnMigration {
    fn version(&self) -> u32 {
        self.version
    }

    fn description(&self) -> &str {
        self.description
    }

    fn up(&self, conn: &Connection) -> rusqlite::Result<()> {
        (self.up)(conn)
    }

    fn down(&self, conn: &Connection) -> rusqlite::Result<()> {
        (self.down)(conn)
    }
}

/// Errors that can occur during migration execution.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Two migrations share a version number.
    #[error("duplicate migration version {0}")]
    DuplicateVersion(u32),

    /// Version 0 is reserved for "nothing applied".
    #[error("migration version must be positive")]
    InvalidVersion,

    /// The requested target is not a known migration version.
    #[error("unknown target version {target}")]
    UnknownTarget {
        /// The requested version.
        target: u32,
    },

    /// Failed to create or query the `schema_version` ledger.
    #[error("failed to check migration state: {0}")]
    Ledger(#[source] rusqlite::Error),

    /// A forward step failed and was rolled back.
    #[error("migration {version} ({description}) failed: {source}")]
    Apply {
        /// The version of the migration that failed.
        version: u32,
        /// Its description.
        description: String,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// A rollback step failed and was rolled back.
    #[error("rollback of migration {version} ({description}) failed: {source}")]
    Revert {
        /// The version of the migration that failed.
        version: u32,
        /// Its description.
        description: String,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },
}

/// Whether a migration is reflected in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Applied,
    Pending,
}

/// One row of a [`MigrationStatus`] report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatusEntry {
    pub version: u32,
    pub description: String,
    pub state: MigrationState,
    /// When the ledger recorded the migration, if it did.
    pub applied_at: Option<DateTime<Utc>>,
}

/// Current ledger version and the state of every known migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub current_version: u32,
    pub migrations: Vec<MigrationStatusEntry>,
}

/// Applies and rolls back an ordered list of migrations.
///
/// The manager assumes a single caller at a time, typically once during
/// startup on a dedicated (non-pooled) connection.
pub struct MigrationManager {
    migrations: Vec<Box<dyn Migration>>,
}

impl std::fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.migrations.iter().map(|m| (m.version(), m.description())))
            .finish()
    }
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::sorted(crate::builtin::default_migrations())
    }
}

impl MigrationManager {
    /// Creates a manager over `migrations`, sorted by ascending version.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidVersion` for a version of 0 and
    /// `MigrationError::DuplicateVersion` if two migrations share a version.
    pub fn new(migrations: Vec<Box<dyn Migration>>) -> Result<Self, MigrationError> {
        let mut seen = BTreeSet::new();
        for migration in &migrations {
            let version = migration.version();
            if version == 0 {
                return Err(MigrationError::InvalidVersion);
            }
            if !seen.insert(version) {
                return Err(MigrationError::DuplicateVersion(version));
            }
        }
        Ok(Self::sorted(migrations))
    }

    fn sorted(mut migrations: Vec<Box<dyn Migration>>) -> Self {
        migrations.sort_by_key(|m| m.version());
        Self { migrations }
    }

    /// Highest known version, or 0 when the list is empty.
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map_or(0, |m| m.version())
    }

    /// Known versions in ascending order.
    pub fn versions(&self) -> Vec<u32> {
        self.migrations.iter().map(|m| m.version()).collect()
    }

    /// Returns the highest version recorded in the ledger, or 0.
    ///
    /// Creates the ledger table if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Ledger` if the ledger cannot be created or
    /// read.
    pub fn current_version(&self, conn: &Connection) -> Result<u32, MigrationError> {
        ensure_ledger(conn)?;
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(MigrationError::Ledger)
    }

    /// Applies pending migrations up to `target` (the latest known version
    /// when `None`), in ascending order. Returns how many were applied.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::UnknownTarget` for a target that is neither 0
    /// nor a known version, and `MigrationError::Apply` for the first step
    /// that fails. Steps committed before the failure stay applied.
    pub fn migrate(&self, conn: &Connection, target: Option<u32>) -> Result<usize, MigrationError> {
        let target = match target {
            Some(0) => 0,
            Some(v) if self.migrations.iter().any(|m| m.version() == v) => v,
            Some(v) => return Err(MigrationError::UnknownTarget { target: v }),
            None => self.latest_version(),
        };

        let current = self.current_version(conn)?;
        if current >= target {
            tracing::info!(current, "database schema already at version");
            return Ok(0);
        }

        let mut applied = 0;
        for migration in self
            .migrations
            .iter()
            .filter(|m| current < m.version() && m.version() <= target)
        {
            let version = migration.version();
            let description = migration.description();
            tracing::info!(version, description, "applying migration");

            apply_step(conn, migration.as_ref()).map_err(|e| {
                tracing::error!(version, description, error = %e, "migration failed");
                MigrationError::Apply {
                    version,
                    description: description.to_string(),
                    source: e,
                }
            })?;

            tracing::info!(version, "migration applied");
            applied += 1;
        }

        Ok(applied)
    }

    /// Reverts applied migrations above `target`, in descending order.
    /// Returns how many were rolled back.
    ///
    /// Ledger rows for versions this manager does not know are left alone.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Revert` for the first step that fails. Steps
    /// reverted before the failure stay reverted.
    pub fn rollback(&self, conn: &Connection, target: u32) -> Result<usize, MigrationError> {
        let current = self.current_version(conn)?;
        if current <= target {
            tracing::info!(current, target, "database schema already at or below target");
            return Ok(0);
        }

        let mut reverted = 0;
        for migration in self
            .migrations
            .iter()
            .rev()
            .filter(|m| target < m.version() && m.version() <= current)
        {
            let version = migration.version();
            let description = migration.description();
            tracing::info!(version, description, "rolling back migration");

            revert_step(conn, migration.as_ref()).map_err(|e| {
                tracing::error!(version, description, error = %e, "rollback failed");
                MigrationError::Revert {
                    version,
                    description: description.to_string(),
                    source: e,
                }
            })?;

            tracing::info!(version, "migration rolled back");
            reverted += 1;
        }

        Ok(reverted)
    }

    /// Reports the current version and whether each known migration is
    /// applied (`version <= current`) or pending.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Ledger` if the ledger cannot be read.
    pub fn status(&self, conn: &Connection) -> Result<MigrationStatus, MigrationError> {
        let current_version = self.current_version(conn)?;
        let applied_at = ledger_timestamps(conn).map_err(MigrationError::Ledger)?;

        tracing::info!(current_version, "current database schema version");

        let migrations = self
            .migrations
            .iter()
            .map(|m| {
                let version = m.version();
                let state = if version <= current_version {
                    MigrationState::Applied
                } else {
                    MigrationState::Pending
                };
                tracing::info!(version, description = m.description(), ?state, "migration");
                MigrationStatusEntry {
                    version,
                    description: m.description().to_string(),
                    state,
                    applied_at: applied_at.get(&version).copied().flatten(),
                }
            })
            .collect();

        Ok(MigrationStatus {
            current_version,
            migrations,
        })
    }
}

fn ensure_ledger(conn: &Connection) -> Result<(), MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            description TEXT,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );",
    )
    .map_err(MigrationError::Ledger)
}

fn ledger_timestamps(conn: &Connection) -> rusqlite::Result<HashMap<u32, Option<DateTime<Utc>>>> {
    let mut stmt = conn.prepare("SELECT version, applied_at FROM schema_version")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

fn apply_step(conn: &Connection, migration: &dyn Migration) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    migration.up(&tx)?;
    tx.execute(
        "INSERT INTO schema_version (version, description, applied_at) VALUES (?1, ?2, ?3)",
        params![migration.version(), migration.description(), Utc::now()],
    )?;
    tx.commit()
}

fn revert_step(conn: &Connection, migration: &dyn Migration) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    migration.down(&tx)?;
    tx.execute(
        "DELETE FROM schema_version WHERE version = ?1",
        [migration.version()],
    )?;
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .expect("should query sqlite_master")
    }

    fn ledger_count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .expect("should count ledger rows")
    }

    fn three_tables() -> Vec<Box<dyn Migration>> {
        vec![
            Box::new(SqlMigration {
                version: 3,
                description: "create gamma",
                up_sql: "CREATE TABLE IF NOT EXISTS gamma (id INTEGER PRIMARY KEY);",
                down_sql: "DROP TABLE IF EXISTS gamma;",
            }),
            Box::new(SqlMigration {
                version: 1,
                description: "create alpha",
                up_sql: "CREATE TABLE IF NOT EXISTS alpha (id INTEGER PRIMARY KEY);",
                down_sql: "DROP TABLE IF EXISTS alpha;",
            }),
            Box::new(SqlMigration {
                version: 2,
                description: "create beta",
                up_sql: "CREATE TABLE IF NOT EXISTS beta (id INTEGER PRIMARY KEY);",
                down_sql: "DROP TABLE IF EXISTS beta;",
            }),
        ]
    }

    #[test]
    fn fresh_database_is_at_version_zero() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let manager = MigrationManager::new(three_tables()).expect("valid migration list");

        assert_eq!(manager.current_version(&conn).expect("should read version"), 0);
        assert!(table_exists(&conn, "schema_version"), "ledger is created on first read");
        assert_eq!(manager.versions(), vec![1, 2, 3], "migrations are sorted by version");
    }

    #[test]
    fn migrate_applies_everything_and_is_idempotent() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let manager = MigrationManager::new(three_tables()).expect("valid migration list");

        assert_eq!(manager.migrate(&conn, None).expect("first run should succeed"), 3);
        assert_eq!(manager.current_version(&conn).expect("should read version"), 3);

        assert_eq!(
            manager.migrate(&conn, None).expect("second run should succeed"),
            0,
            "no new migrations to apply"
        );
        assert_eq!(ledger_count(&conn), 3, "no duplicate ledger rows");
    }

    #[test]
    fn migrate_to_partial_target_stops_there() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let manager = MigrationManager::new(three_tables()).expect("valid migration list");

        assert_eq!(manager.migrate(&conn, Some(2)).expect("migrate should succeed"), 2);
        assert_eq!(manager.current_version(&conn).expect("should read version"), 2);
        assert_eq!(ledger_count(&conn), 2);
        assert!(table_exists(&conn, "beta"));
        assert!(!table_exists(&conn, "gamma"), "v3 up must not run");
    }

    #[test]
    fn unknown_target_is_rejected() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let manager = MigrationManager::new(three_tables()).expect("valid migration list");

        let err = manager
            .migrate(&conn, Some(9))
            .expect_err("version 9 is not known");
        assert!(matches!(err, MigrationError::UnknownTarget { target: 9 }));
        assert_eq!(manager.current_version(&conn).expect("should read version"), 0);
    }

    #[test]
    fn duplicate_and_zero_versions_are_rejected() {
        let dup: Vec<Box<dyn Migration>> = vec![
            Box::new(SqlMigration {
                version: 1,
                description: "a",
                up_sql: "",
                down_sql: "",
            }),
            Box::new(SqlMigration {
                version: 1,
                description: "b",
                up_sql: "",
                down_sql: "",
            }),
        ];
        assert!(matches!(
            MigrationManager::new(dup),
            Err(MigrationError::DuplicateVersion(1))
        ));

        let zero: Vec<Box<dyn Migration>> = vec![Box::new(SqlMigration {
            version: 0,
            description: "zero",
            up_sql: "",
            down_sql: "",
        })];
        assert!(matches!(
            MigrationManager::new(zero),
            Err(MigrationError::InvalidVersion)
        ));
    }

    #[test]
    fn failing_step_rolls_back_and_stops_the_batch() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let migrations: Vec<Box<dyn Migration>> = vec![
            Box::new(SqlMigration {
                version: 1,
                description: "create alpha",
                up_sql: "CREATE TABLE alpha (id INTEGER PRIMARY KEY);",
                down_sql: "DROP TABLE alpha;",
            }),
            Box::new(SqlMigration {
                version: 2,
                description: "half-broken",
                up_sql: "CREATE TABLE rollback_probe (id INTEGER PRIMARY KEY);
                         INSERT INTO missing_table VALUES (1);",
                down_sql: "DROP TABLE rollback_probe;",
            }),
            Box::new(SqlMigration {
                version: 3,
                description: "create gamma",
                up_sql: "CREATE TABLE gamma (id INTEGER PRIMARY KEY);",
                down_sql: "DROP TABLE gamma;",
            }),
        ];
        let manager = MigrationManager::new(migrations).expect("valid migration list");

        let err = manager
            .migrate(&conn, None)
            .expect_err("second migration should fail");
        match err {
            MigrationError::Apply { version, .. } => assert_eq!(version, 2),
            other => panic!("unexpected error type: {other:?}"),
        }

        assert_eq!(manager.current_version(&conn).expect("should read version"), 1);
        assert!(table_exists(&conn, "alpha"), "earlier steps stay committed");
        assert!(
            !table_exists(&conn, "rollback_probe"),
            "side effects of the failed step are rolled back"
        );
        assert!(!table_exists(&conn, "gamma"), "later steps are not attempted");
    }

    #[test]
    fn failing_rollback_step_is_undone_and_stops_the_batch() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let migrations: Vec<Box<dyn Migration>> = vec![
            Box::new(SqlMigration {
                version: 1,
                description: "create alpha",
                up_sql: "CREATE TABLE alpha (id INTEGER PRIMARY KEY);",
                down_sql: "DROP TABLE alpha;",
            }),
            Box::new(SqlMigration {
                version: 2,
                description: "create beta",
                up_sql: "CREATE TABLE beta (id INTEGER PRIMARY KEY);",
                down_sql: "DROP TABLE beta; DROP TABLE missing_table;",
            }),
            Box::new(SqlMigration {
                version: 3,
                description: "create gamma",
                up_sql: "CREATE TABLE gamma (id INTEGER PRIMARY KEY);",
                down_sql: "DROP TABLE gamma;",
            }),
        ];
        let manager = MigrationManager::new(migrations).expect("valid migration list");
        manager.migrate(&conn, None).expect("migrate should succeed");

        let err = manager
            .rollback(&conn, 0)
            .expect_err("rollback of v2 should fail");
        assert!(
            matches!(err, MigrationError::Revert { version: 2, .. }),
            "unexpected error: {err:?}"
        );

        assert_eq!(manager.current_version(&conn).expect("should read version"), 2);
        assert!(!table_exists(&conn, "gamma"), "v3 was reverted before the failure");
        assert!(table_exists(&conn, "beta"), "partial down of v2 is rolled back");
        assert!(table_exists(&conn, "alpha"), "v1 is never reverted");
        assert_eq!(ledger_count(&conn), 2);
    }

    #[test]
    fn step_rolls_back_when_ledger_insert_fails() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let migrations: Vec<Box<dyn Migration>> = vec![Box::new(SqlMigration {
            version: 1,
            description: "ledger conflict",
            up_sql: "CREATE TABLE rollback_probe (id INTEGER PRIMARY KEY);
                     INSERT INTO schema_version (version) VALUES (1);",
            down_sql: "",
        })];
        let manager = MigrationManager::new(migrations).expect("valid migration list");

        let err = manager
            .migrate(&conn, None)
            .expect_err("ledger insert conflict should fail migration");
        assert!(matches!(err, MigrationError::Apply { version: 1, .. }));
        assert!(!table_exists(&conn, "rollback_probe"));
        assert_eq!(ledger_count(&conn), 0);
    }

    #[test]
    fn rollback_reverts_down_to_target() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let manager = MigrationManager::new(three_tables()).expect("valid migration list");
        manager.migrate(&conn, None).expect("migrate should succeed");

        assert_eq!(manager.rollback(&conn, 1).expect("rollback should succeed"), 2);
        assert_eq!(manager.current_version(&conn).expect("should read version"), 1);
        assert!(table_exists(&conn, "alpha"));
        assert!(!table_exists(&conn, "beta"));
        assert!(!table_exists(&conn, "gamma"));

        assert_eq!(
            manager.rollback(&conn, 1).expect("repeat rollback should succeed"),
            0
        );
    }

    #[test]
    fn status_reports_applied_and_pending() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let manager = MigrationManager::new(three_tables()).expect("valid migration list");
        manager.migrate(&conn, Some(1)).expect("migrate should succeed");

        let status = manager.status(&conn).expect("status should succeed");
        assert_eq!(status.current_version, 1);

        let states: Vec<_> = status.migrations.iter().map(|m| (m.version, m.state)).collect();
        assert_eq!(
            states,
            vec![
                (1, MigrationState::Applied),
                (2, MigrationState::Pending),
                (3, MigrationState::Pending),
            ]
        );
        assert!(status.migrations[0].applied_at.is_some());
        assert!(status.migrations[1].applied_at.is_none());
    }
}
