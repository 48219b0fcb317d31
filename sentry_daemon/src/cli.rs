// THEORY:
// The daemon takes three flags and nothing else. Arguments are read straight from
// `env::args`; an unknown flag or a missing `--config` is a usage error, reported
// before anything else starts.

use anyhow::{Result, anyhow, bail};
use std::path::PathBuf;

pub const USAGE: &str = "Usage: sentry_daemon --config <path> [--dry-run] [--log-output <path>]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    /// Configuration file (TOML, INI, YAML or JSON; picked by extension).
    pub config: PathBuf,
    /// Load and validate the configuration, print it and exit.
    pub dry_run: bool,
    /// Append logs to this file instead of writing them to stderr.
    pub log_output: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Run(CliArgs),
    Help,
}

/// Parses everything after the program name.
pub fn parse<I>(args: I) -> Result<Invocation>
where
    I: IntoIterator<Item = String>,
{
    let mut config = None;
    let mut dry_run = false;
    let mut log_output = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        // `--flag=value` and `--flag value` are both accepted.
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        match flag.as_str() {
            "-h" | "--help" => return Ok(Invocation::Help),
            "--dry-run" => dry_run = true,
            "--config" => {
                let value = inline.or_else(|| args.next()).ok_or_else(|| anyhow!("--config needs a path"))?;
                config = Some(PathBuf::from(value));
            }
            "--log-output" => {
                let value = inline
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("--log-output needs a path"))?;
                log_output = Some(PathBuf::from(value));
            }
            other => bail!("unknown argument `{other}`"),
        }
    }

    let config = config.ok_or_else(|| anyhow!("--config is required"))?;
    Ok(Invocation::Run(CliArgs {
        config,
        dry_run,
        log_output,
    }))
}
