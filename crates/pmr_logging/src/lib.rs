//! Shared logging utilities for PMR test harnesses.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "pmr=info";

/// Logging configuration for a test harness or helper binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror the full filter to stderr instead of warnings only.
    pub verbose: bool,
}

/// Initialize tracing with an append-only session log file and stderr
/// output.
///
/// The filter comes from `PMR_LOG`, then `RUST_LOG`, then a default that
/// keeps the engine's own events at info.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let path = log_dir.join(format!("{}.log", sanitize_name(config.app_name)));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;

    let file_filter = env_filter();
    let console_filter = if config.verbose {
        env_filter()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

fn env_filter() -> EnvFilter {
    if let Ok(filter) = std::env::var("PMR_LOG") {
        return EnvFilter::new(filter);
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Get the PMR home directory: ~/.pmr
pub fn pmr_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("PMR_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".pmr")
}

/// Get the logs directory: ~/.pmr/logs
pub fn logs_dir() -> PathBuf {
    pmr_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("pmr-tests"), "pmr-tests");
        assert_eq!(sanitize_name("weird name!.log"), "weird_name__log");
    }

    #[test]
    fn test_pmr_home_override() {
        std::env::set_var("PMR_HOME", "/tmp/pmr_home_test");
        let home = pmr_home();
        std::env::remove_var("PMR_HOME");
        assert_eq!(home, PathBuf::from("/tmp/pmr_home_test"));
    }
}
