//! `depot` binary: applies schema migrations and reports pool statistics.
//!
//! Prints each command's report as JSON on stdout; logs go to stderr.

use depot_app::{cli, config};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn resolve_config_path(cli_path: Option<String>) -> (String, &'static str) {
    if let Some(path) = cli_path.filter(|value| !value.trim().is_empty()) {
        return (path, "cli-arg");
    }

    if let Ok(path) = std::env::var("DEPOT_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (path, "env-var");
        }
    }

    ("config.toml".to_string(), "default")
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> ExitCode {
    let invocation = match cli::parse_args(std::env::args().skip(1)) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("{e}\n{}", cli::USAGE);
            return ExitCode::from(2);
        }
    };

    let (config_path, config_source) = resolve_config_path(invocation.config_path);
    let config = match config::load_config(Some(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from {config_path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging);
    tracing::info!(
        source = config_source,
        path = %config_path,
        "resolved startup configuration path"
    );

    match cli::run(&invocation.command, &config) {
        Ok(report) => {
            println!("{report:#}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "depot command failed");
            ExitCode::FAILURE
        }
    }
}
