//! Remote object storage.
//!
//! [`ObjectStore`] is the raw transport: one network attempt per call, keys
//! listed in ascending order. [`filesystem::RemoteFileSystem`] layers
//! compression, events, metrics and in-flight de-duplication on top of it.

pub mod compress;
pub mod filesystem;
pub mod local;

pub use filesystem::{with_retries, RemoteFileSystem};
pub use local::LocalObjectStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("remote object not found: {0}")]
    NotFound(String),

    #[error("I/O error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    #[error("compression error: {0}")]
    Compression(String),
}

impl RemoteError {
    /// Whether another attempt of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Transient(_) => true,
            RemoteError::Io { kind, .. } => !matches!(
                kind,
                io::ErrorKind::NotFound
                    | io::ErrorKind::PermissionDenied
                    | io::ErrorKind::InvalidInput
            ),
            RemoteError::NotFound(_) | RemoteError::Compression(_) => false,
        }
    }
}

impl From<io::Error> for RemoteError {
    fn from(e: io::Error) -> Self {
        RemoteError::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// One listed remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write a local file under `key`, returning the number of bytes stored.
    async fn put_file(&self, local: &Path, key: &str) -> Result<u64, RemoteError>;

    /// Read `key` into a local file, returning the number of bytes read.
    async fn get_file(&self, key: &str, local: &Path) -> Result<u64, RemoteError>;

    async fn exists(&self, key: &str) -> Result<bool, RemoteError>;

    /// Delete a batch of keys. Missing keys are not an error.
    async fn delete_many(&self, keys: &[String]) -> Result<(), RemoteError>;

    /// Objects whose key starts with `prefix` and sorts after `start_after`,
    /// in ascending key order.
    fn list<'a>(
        &'a self,
        prefix: &'a str,
        start_after: Option<&'a str>,
    ) -> BoxStream<'a, Result<RemoteObject, RemoteError>>;
}
