use std::path::{Path, PathBuf};

use crate::types::PendelError;
use thiserror::Error;

/// Error type for administrative operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Log file not found at the specified path.
    #[error("log not found: {0}")]
    MissingLog(PathBuf),
    /// Data directory not found at the specified path.
    #[error("data directory not found: {0}")]
    MissingDataDir(PathBuf),
    /// Custom error message.
    #[error("{0}")]
    Message(String),
    /// Core pending-delete error.
    #[error(transparent)]
    Core(#[from] PendelError),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    pub(crate) fn missing_log(path: impl AsRef<Path>) -> Self {
        AdminError::MissingLog(path.as_ref().to_path_buf())
    }

    pub(crate) fn missing_data_dir(path: impl AsRef<Path>) -> Self {
        AdminError::MissingDataDir(path.as_ref().to_path_buf())
    }
}
