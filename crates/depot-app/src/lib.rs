//! Application wiring for the depot database layer.
//!
//! Loads configuration, brings the schema up to date on a dedicated
//! connection, and owns the process-wide [`ConnectionPool`] from startup
//! until [`App::shutdown`].

pub mod cli;
pub mod config;

use config::{Config, ConfigError};
use depot_db::{
    configure_connection, init_schema, ConnectionPool, MigrationError, MigrationManager,
    PoolError, PoolStats, SchemaError,
};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while starting or running the application.
#[derive(Debug, Error)]
pub enum AppError {
    /// The migration connection could not be opened or configured.
    #[error("failed to open database {path}: {source}")]
    Open {
        /// The database file path.
        path: PathBuf,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// The pool settings could not be converted.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Creating the base schema failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Applying or rolling back migrations failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Creating or using the connection pool failed.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A query run by the application failed.
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Opens a standalone connection for schema work, configured like the
/// pooled ones.
///
/// # Errors
///
/// Returns `AppError::Open` if the file cannot be opened or configured.
pub fn open_migration_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, AppError> {
    let open = || -> rusqlite::Result<Connection> {
        let conn = Connection::open(path)?;
        configure_connection(&conn, busy_timeout)?;
        Ok(conn)
    };
    open().map_err(|source| AppError::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// A running application: a migrated database and its connection pool.
#[derive(Debug)]
pub struct App {
    db_path: PathBuf,
    pool: ConnectionPool,
    migrations: MigrationManager,
}

impl App {
    /// Creates the base schema, applies migrations up to the configured
    /// target, and then opens the connection pool.
    ///
    /// # Errors
    ///
    /// Returns `AppError` if any of those steps fails; the pool is not
    /// created when schema work fails.
    pub fn start(config: &Config) -> Result<Self, AppError> {
        let db_path = PathBuf::from(&config.database.path);
        let pool_config = config.pool.to_pool_config()?;
        let migrations = MigrationManager::default();

        {
            let conn = open_migration_connection(&db_path, pool_config.busy_timeout)?;
            init_schema(&conn)?;
            let applied = migrations.migrate(&conn, config.migrations.target_version)?;
            if applied > 0 {
                tracing::info!(count = applied, "applied database migrations");
            }
        }

        let pool = ConnectionPool::new(&db_path, pool_config)?;
        tracing::info!(path = %db_path.display(), "depot started");

        Ok(Self {
            db_path,
            pool,
            migrations,
        })
    }

    /// The shared connection pool. Clone it to hand it to other components.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The migration list the application was started with.
    pub fn migrations(&self) -> &MigrationManager {
        &self.migrations
    }

    /// Path of the database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Closes the pool's idle connections and returns the final statistics.
    pub fn shutdown(self) -> PoolStats {
        let stats = self.pool.stats();
        tracing::info!(
            created = stats.created,
            total_requests = stats.total_requests,
            total_waits = stats.total_waits,
            wait_ratio = stats.wait_ratio,
            "shutting down depot"
        );
        self.pool.close_all();
        stats
    }
}
