use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Maps a configured level onto a filter directive. Accepts the usual Python-style
/// names (`WARNING`, `CRITICAL`) alongside tracing's own.
pub fn level_directive(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        "" => "info".to_string(),
        other => other.to_string(),
    }
}

/// `RUST_LOG` wins over the configured level.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_directive(level)))
}

/// Installs the global subscriber. Logs go to stderr, or are appended to
/// `log_output` when given.
pub fn init(level: &str, log_output: Option<&Path>) -> Result<()> {
    let filter = filter(level);
    match log_output {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_target(true).with_writer(Mutex::new(file)))
                .with(filter)
                .try_init()
                .context("failed to install log subscriber")?;
        }
        None => {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_ansi(true)
                        .with_target(true)
                        .with_thread_ids(false)
                        .with_writer(std::io::stderr),
                )
                .with(filter)
                .try_init()
                .context("failed to install log subscriber")?;
        }
    }
    Ok(())
}
