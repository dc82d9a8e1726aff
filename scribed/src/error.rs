//! Error types for the daemon.

use scribe_state::{StorageError, SyncError};

/// Scribed errors.
#[derive(Debug, thiserror::Error)]
pub enum ScribedError {
    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file / environment extraction errors.
    #[error("configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    /// Storage layer errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Engine errors.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// std::io::Error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ScribedError {
    fn from(value: figment::Error) -> Self {
        ScribedError::Figment(Box::new(value))
    }
}
