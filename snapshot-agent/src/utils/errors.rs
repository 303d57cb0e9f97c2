//! Error types for the snapshot agent.

use crate::remote::RemoteError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Giving up on {key} after {attempts} attempts: {source}")]
    RetriesExhausted {
        key: String,
        attempts: usize,
        #[source]
        source: RemoteError,
    },

    #[error("Task already running: {0}")]
    TaskAlreadyRunning(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Invalid meta file: {0}")]
    InvalidMetaFile(String),

    #[error("Invalid backup path: {0}")]
    InvalidPath(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("No manifest found: {0}")]
    NoManifest(String),
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        BackupError::Io(std::io::Error::other(e))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
