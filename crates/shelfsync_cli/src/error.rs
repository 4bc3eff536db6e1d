//! CLI error type.

use shelfsync_engine::SyncError;
use shelfsync_model::ModelError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Errors that end a CLI command with exit status 1.
#[derive(Error, Debug)]
pub enum CliError {
    /// Engine failure, including configuration errors.
    #[error(transparent)]
    Engine(#[from] SyncError),

    /// Bad model input such as an unknown kind.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// HTTP client could not be built.
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),

    /// Another process is using the data directory.
    #[error("{} is in use by another shelfsync process", .0.display())]
    Locked(PathBuf),

    /// Terminal or file I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
