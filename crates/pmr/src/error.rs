//! Error types for the provisioning engine.

use std::io;
use thiserror::Error;

/// Provisioning result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Provisioning errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Healthcheck retries exhausted; the test session cannot start.
    #[error(
        "backing service unreachable after {attempts} attempts (image {image}, {host}:{port})"
    )]
    ContainerUnreachable {
        image: String,
        host: String,
        port: u16,
        attempts: u32,
    },

    /// Container launch failed for a reason other than losing the launch race.
    #[error("failed to launch container: {0}")]
    ContainerLaunch(String),

    /// Rejected at pipeline construction time, before any execution.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// Malformed configuration value (usually an environment override).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Cleanup registry lockfile failure.
    #[error("cleanup lockfile error: {0}")]
    Lock(#[source] io::Error),

    /// IO error (file system operations)
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// SQL/driver error, propagated verbatim.
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    /// A caller-supplied setup callable failed.
    #[error("setup callable failed: {0}")]
    Callable(#[source] anyhow::Error),

    /// A dialect shim collaborator failed.
    #[error("dialect shim failed: {0}")]
    Shim(#[source] anyhow::Error),
}
