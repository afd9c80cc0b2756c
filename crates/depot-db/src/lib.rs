//! Database layer for the depot application.
//!
//! Provides a thread-safe SQLite connection pool with lazy growth, idle
//! eviction, and health probes, plus a versioned migration runner that
//! records applied versions in a `schema_version` ledger table.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: every connection the pool opens enables WAL
//!   journaling and foreign-key enforcement, so readers proceed while a
//!   single writer commits.
//! - **Connections via `r2d2_sqlite`**: the pool drives
//!   [`r2d2_sqlite::SqliteConnectionManager`] through `r2d2`'s
//!   `ManageConnection` trait but keeps its own idle set, which lets a
//!   checkout open an extra connection under load instead of failing.
//! - **Scoped checkout**: [`ConnectionPool::checkout`] commits on `Ok`,
//!   rolls back on `Err` or panic, and always returns the connection.
//! - **Reversible migrations**: each migration has `up` and `down` steps and
//!   runs in its own transaction with its ledger row.

mod builtin;
mod migrations;
mod pool;
mod schema;

pub use builtin::{add_column_if_missing, default_migrations};
pub use migrations::{
    FnMigration, Migration, MigrationError, MigrationManager, MigrationState, MigrationStatus,
    MigrationStatusEntry, SqlMigration,
};
pub use pool::{
    configure_connection, ConnectionPool, OverflowPolicy, PoolConfig, PoolError, PoolStats,
    PooledConnection, HEALTH_CHECK_IDLE_THRESHOLD,
};
pub use schema::{init_schema, SchemaError};
