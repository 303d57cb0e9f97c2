//! Backup-aware view of an [`ObjectStore`].

use crate::events::{BackupEvent, EventBus};
use crate::metrics::BackupMetrics;
use crate::path::{BackupPath, CompressionType};
use crate::remote::compress::{compress_file, decompress_file};
use crate::remote::{ObjectStore, RemoteError, RemoteObject};
use crate::utils::errors::{BackupError, Result};
use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

type InFlight = Arc<OnceCell<std::result::Result<u64, RemoteError>>>;

/// Uploads, downloads and lists backup artifacts.
///
/// Every call is a single attempt against the store; wrap calls in
/// [`with_retries`] for backoff. Concurrent uploads of the same remote key
/// share one in-flight operation and its outcome.
pub struct RemoteFileSystem {
    store: Arc<dyn ObjectStore>,
    events: EventBus,
    metrics: Arc<BackupMetrics>,
    scratch_dir: PathBuf,
    in_flight: DashMap<String, InFlight>,
}

impl RemoteFileSystem {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        events: EventBus,
        metrics: Arc<BackupMetrics>,
        scratch_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            events,
            metrics,
            scratch_dir,
            in_flight: DashMap::new(),
        }
    }

    pub fn metrics(&self) -> &BackupMetrics {
        &self.metrics
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Upload `local` as `path`, returning the number of bytes stored remotely.
    pub async fn upload(
        &self,
        path: &BackupPath,
        local: &Path,
    ) -> std::result::Result<u64, RemoteError> {
        let key = path.remote_key();
        let cell = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = cell
            .get_or_init(|| self.upload_once(path, local, &key))
            .await
            .clone();

        self.in_flight
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &cell));
        result
    }

    async fn upload_once(
        &self,
        path: &BackupPath,
        local: &Path,
        key: &str,
    ) -> std::result::Result<u64, RemoteError> {
        self.events.publish(BackupEvent::UploadStarted {
            key: key.to_string(),
        });

        let result = match path.compression {
            CompressionType::None => self.store.put_file(local, key).await,
            CompressionType::Snappy => self.put_compressed(local, key).await,
        };

        match &result {
            Ok(bytes) => {
                debug!("Uploaded {} ({} bytes)", key, bytes);
                self.metrics.record_upload(*bytes);
                self.events.publish(BackupEvent::UploadSucceeded {
                    key: key.to_string(),
                    bytes: *bytes,
                });
            }
            Err(e) => {
                self.metrics.record_upload_failure();
                self.events.publish(BackupEvent::UploadFailed {
                    key: key.to_string(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn put_compressed(&self, local: &Path, key: &str) -> std::result::Result<u64, RemoteError> {
        let staged = self.scratch_file("snappy").await?;
        let src = local.to_path_buf();
        let dst = staged.clone();
        let compressed = tokio::task::spawn_blocking(move || compress_file(&src, &dst))
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;

        let result = match compressed {
            Ok(_) => self.store.put_file(&staged, key).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(e.into()),
            Err(e) => Err(RemoteError::Compression(e.to_string())),
        };
        let _ = tokio::fs::remove_file(&staged).await;
        result
    }

    /// Download `path` into `local`, decompressing as recorded in the path.
    pub async fn download(
        &self,
        path: &BackupPath,
        local: &Path,
    ) -> std::result::Result<u64, RemoteError> {
        let key = path.remote_key();
        self.events.publish(BackupEvent::DownloadStarted { key: key.clone() });

        let result = match path.compression {
            CompressionType::None => self.store.get_file(&key, local).await,
            CompressionType::Snappy => self.get_decompressed(&key, local).await,
        };

        match &result {
            Ok(bytes) => {
                self.metrics.record_download(*bytes);
                self.events.publish(BackupEvent::DownloadSucceeded { key, bytes: *bytes });
            }
            Err(e) => {
                self.metrics.record_download_failure();
                self.events.publish(BackupEvent::DownloadFailed {
                    key,
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn get_decompressed(&self, key: &str, local: &Path) -> std::result::Result<u64, RemoteError> {
        let staged = self.scratch_file("download").await?;
        if let Err(e) = self.store.get_file(key, &staged).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let src = staged.clone();
        let dst = local.to_path_buf();
        let result = tokio::task::spawn_blocking(move || decompress_file(&src, &dst))
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?
            .map_err(|e| RemoteError::Compression(format!("{key}: {e}")));
        let _ = tokio::fs::remove_file(&staged).await;
        result
    }

    pub async fn exists(&self, key: &str) -> std::result::Result<bool, RemoteError> {
        self.store.exists(key).await
    }

    pub async fn delete(&self, keys: &[String]) -> std::result::Result<(), RemoteError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.store.delete_many(keys).await
    }

    /// Remote objects under `prefix`, ascending by key.
    pub fn list<'a>(
        &'a self,
        prefix: &'a str,
        start_after: Option<&'a str>,
    ) -> BoxStream<'a, std::result::Result<RemoteObject, RemoteError>> {
        self.store.list(prefix, start_after)
    }

    async fn scratch_file(&self, suffix: &str) -> std::result::Result<PathBuf, RemoteError> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        Ok(self
            .scratch_dir
            .join(format!("{}.{suffix}", uuid::Uuid::new_v4())))
    }
}

const MIN_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Run a remote call with bounded exponential backoff.
///
/// Only retryable errors are retried; `max_attempts` counts the first call.
pub async fn with_retries<T, F, Fut>(key: &str, max_attempts: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, RemoteError>>,
{
    let attempts = AtomicUsize::new(0);
    let backoff = ExponentialBuilder::default()
        .with_min_delay(MIN_BACKOFF)
        .with_max_delay(MAX_BACKOFF)
        .with_max_times(max_attempts.saturating_sub(1));

    let result = (|| {
        attempts.fetch_add(1, Ordering::Relaxed);
        op()
    })
    .retry(backoff)
    .when(RemoteError::is_retryable)
    .notify(|err: &RemoteError, delay: Duration| {
        warn!("Retrying {} in {:?} after error: {}", key, delay, err);
    })
    .await;

    match result {
        Ok(value) => Ok(value),
        Err(e) if e.is_retryable() => Err(BackupError::RetriesExhausted {
            key: key.to_string(),
            attempts: attempts.load(Ordering::Relaxed),
            source: e,
        }),
        Err(e) => Err(BackupError::Remote(e)),
    }
}
