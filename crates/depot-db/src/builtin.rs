//! Migrations shipped with the application.
//!
//! These build on the tables created by [`crate::init_schema`]. New
//! migrations are appended to [`default_migrations`] with the next version.

use crate::migrations::{FnMigration, Migration, SqlMigration};
use rusqlite::Connection;

const ADD_INDEXES: SqlMigration = SqlMigration {
    version: 1,
    description: "Add indexes on frequently queried columns",
    up_sql: include_str!("migrations/001_add_indexes.up.sql"),
    down_sql: include_str!("migrations/001_add_indexes.down.sql"),
};

const ADD_FOREIGN_KEYS: FnMigration = FnMigration {
    version: 2,
    description: "Add foreign key constraints",
    up: enforce_foreign_keys,
    down: release_foreign_keys,
};

const ADD_AUDIT_COLUMNS: FnMigration = FnMigration {
    version: 3,
    description: "Add audit columns (created_by, updated_by)",
    up: add_audit_columns,
    down: keep_audit_columns,
};

/// All built-in migrations in version order.
pub fn default_migrations() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(ADD_INDEXES),
        Box::new(ADD_FOREIGN_KEYS),
        Box::new(ADD_AUDIT_COLUMNS),
    ]
}

/// Turns on enforcement and checks that existing rows already satisfy every
/// declared foreign key.
fn enforce_foreign_keys(conn: &Connection) -> rusqlite::Result<()> {
    // No-op inside a transaction; pooled connections enable it on open.
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let offending: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    if offending.is_empty() {
        return Ok(());
    }
    Err(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
        Some(format!(
            "foreign key violations in: {}",
            offending.join(", ")
        )),
    ))
}

fn release_foreign_keys(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = OFF;")
}

fn add_audit_columns(conn: &Connection) -> rusqlite::Result<()> {
    add_column_if_missing(conn, "products", "created_by TEXT")?;
    add_column_if_missing(conn, "products", "updated_by TEXT")?;
    add_column_if_missing(conn, "session_history", "created_by TEXT")?;
    add_column_if_missing(conn, "bank_history", "created_by TEXT")?;
    add_column_if_missing(conn, "session_history", "deleted_at TIMESTAMP")?;
    add_column_if_missing(conn, "session_history_items", "deleted_at TIMESTAMP")
}

/// Dropping columns means rebuilding the tables, so the audit columns stay.
fn keep_audit_columns(_conn: &Connection) -> rusqlite::Result<()> {
    Ok(())
}

/// Runs `ALTER TABLE ... ADD COLUMN`, treating an existing column of the same
/// name as success.
pub fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column_def: &str,
) -> rusqlite::Result<()> {
    match conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column_def};")) {
        Ok(()) => Ok(()),
        Err(e) if is_duplicate_column(&e) => {
            tracing::debug!(table, column_def, "column already exists, skipping");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.starts_with("duplicate column name")
    )
}
