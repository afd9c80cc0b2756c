//! Base application schema.

use rusqlite::Connection;
use thiserror::Error;

const BASE_SCHEMA: &str = include_str!("schema/base.sql");

/// Errors that can occur while creating the base schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A `CREATE TABLE` statement failed.
    #[error("failed to create base schema: {0}")]
    Create(#[from] rusqlite::Error),
}

/// Creates the application tables that the built-in migrations build on.
///
/// Safe to call on every startup; existing tables are left untouched.
///
/// # Errors
///
/// Returns `SchemaError::Create` if any statement fails.
pub fn init_schema(conn: &Connection) -> Result<(), SchemaError> {
    conn.execute_batch(BASE_SCHEMA)?;
    tracing::debug!("base schema ensured");
    Ok(())
}
