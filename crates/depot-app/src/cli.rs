//! Command-line parsing and command execution for the `depot` binary.

use crate::config::Config;
use crate::{open_migration_connection, App, AppError};
use depot_db::{init_schema, MigrationManager};
use serde_json::{json, Value};
use std::path::Path;
use thiserror::Error;

/// Usage text printed on argument errors.
pub const USAGE: &str = "usage: depot [--config <path>] [stats | migrate [<version>] | rollback [<version>] | status]";

/// A subcommand of the `depot` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start the application, run one pooled query, print pool statistics.
    Stats,
    /// Apply migrations up to a version (configured or latest by default).
    Migrate { target: Option<u32> },
    /// Roll back migrations down to a version (0 by default).
    Rollback { target: u32 },
    /// Print the migration status report.
    Status,
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Value of `--config`, if given.
    pub config_path: Option<String>,
    pub command: Command,
}

/// Errors in the command line itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("missing value for {0}")]
    MissingValue(&'static str),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}

/// Parses arguments (without the program name).
///
/// # Errors
///
/// Returns `UsageError` for unknown commands, malformed versions, or extra
/// arguments.
pub fn parse_args<I>(args: I) -> Result<Invocation, UsageError>
where
    I: IntoIterator<Item = String>,
{
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = Some(args.next().ok_or(UsageError::MissingValue("--config"))?);
        } else {
            positional.push(arg);
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None | Some("stats") => Command::Stats,
        Some("status") => Command::Status,
        Some("migrate") => Command::Migrate {
            target: positional.next().map(|v| parse_version(&v)).transpose()?,
        },
        Some("rollback") => Command::Rollback {
            target: positional
                .next()
                .map(|v| parse_version(&v))
                .transpose()?
                .unwrap_or(0),
        },
        Some(other) => return Err(UsageError::UnknownCommand(other.to_string())),
    };

    if let Some(extra) = positional.next() {
        return Err(UsageError::UnexpectedArgument(extra));
    }

    Ok(Invocation {
        config_path,
        command,
    })
}

fn parse_version(value: &str) -> Result<u32, UsageError> {
    value
        .parse()
        .map_err(|_| UsageError::InvalidVersion(value.to_string()))
}

/// Runs `command` and returns its report as JSON.
///
/// # Errors
///
/// Returns `AppError` if opening the database, migrating, or querying fails.
pub fn run(command: &Command, config: &Config) -> Result<Value, AppError> {
    let db_path = Path::new(&config.database.path);
    let busy_timeout = config.pool.to_pool_config()?.busy_timeout;
    let manager = MigrationManager::default();

    match command {
        Command::Stats => {
            let app = App::start(config)?;
            let products: i64 = app.pool().checkout(|tx| -> Result<i64, AppError> {
                Ok(tx.query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?)
            })?;
            let stats = app.shutdown();
            Ok(json!({ "products": products, "pool": stats }))
        }
        Command::Migrate { target } => {
            let conn = open_migration_connection(db_path, busy_timeout)?;
            init_schema(&conn)?;
            let applied = manager.migrate(&conn, target.or(config.migrations.target_version))?;
            let status = manager.status(&conn)?;
            Ok(json!({ "applied": applied, "status": status }))
        }
        Command::Rollback { target } => {
            let conn = open_migration_connection(db_path, busy_timeout)?;
            let reverted = manager.rollback(&conn, *target)?;
            let status = manager.status(&conn)?;
            Ok(json!({ "rolled_back": reverted, "status": status }))
        }
        Command::Status => {
            let conn = open_migration_connection(db_path, busy_timeout)?;
            Ok(json!({ "status": manager.status(&conn)? }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_arguments_means_stats() {
        let invocation = parse_args(args(&[])).expect("should parse");
        assert_eq!(invocation.command, Command::Stats);
        assert_eq!(invocation.config_path, None);
    }

    #[test]
    fn stats_is_an_explicit_subcommand() {
        let invocation = parse_args(args(&["stats"])).expect("should parse");
        assert_eq!(invocation.command, Command::Stats);
    }

    #[test]
    fn parses_config_flag_anywhere() {
        let invocation =
            parse_args(args(&["migrate", "--config", "depot.toml", "2"])).expect("should parse");
        assert_eq!(invocation.config_path.as_deref(), Some("depot.toml"));
        assert_eq!(invocation.command, Command::Migrate { target: Some(2) });
    }

    #[test]
    fn rollback_defaults_to_zero() {
        let invocation = parse_args(args(&["rollback"])).expect("should parse");
        assert_eq!(invocation.command, Command::Rollback { target: 0 });
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            parse_args(args(&["migrate", "two"])),
            Err(UsageError::InvalidVersion("two".to_string()))
        );
        assert_eq!(
            parse_args(args(&["upgrade"])),
            Err(UsageError::UnknownCommand("upgrade".to_string()))
        );
        assert_eq!(
            parse_args(args(&["status", "extra"])),
            Err(UsageError::UnexpectedArgument("extra".to_string()))
        );
        assert_eq!(
            parse_args(args(&["--config"])),
            Err(UsageError::MissingValue("--config"))
        );
    }
}
