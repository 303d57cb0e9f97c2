//! Upload worker pool.
//!
//! Every enqueued component becomes a task that waits for weighted permits
//! (large files take more of the budget), then for the rate limiter, then
//! uploads with retries. A successful upload is recorded in the uploaded
//! ledger and the local copy is deleted. A failure only affects its own file.

use crate::executor::uploaded::UploadedFilesLedger;
use crate::manifest::FileUploadResult;
use crate::path::BackupPath;
use crate::remote::{with_retries, RemoteFileSystem};
use crate::throttle::DynamicRateLimiter;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Permits held by the smallest files; the budget is `workers * PERMITS_PER_WORKER`.
const PERMITS_PER_WORKER: u32 = 8;

/// Returns the number of semaphore permits a file should acquire based on its size.
///
/// | File size       | Permits |
/// |-----------------|---------|
/// | < 10 MB         | 1       |
/// | 10 – 100 MB     | 2       |
/// | 100 – 500 MB    | 16      |
/// | 500 MB – 1 GB   | 32      |
/// | > 1 GB          | 64      |
fn concurrency_weight(file_size: u64) -> u32 {
    match file_size {
        0..=10_485_759 => 1,
        10_485_760..=104_857_599 => 2,
        104_857_600..=524_287_999 => 16,
        524_288_000..=1_073_741_823 => 32,
        _ => 64,
    }
}

/// One component to upload.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub path: BackupPath,
    pub file: FileUploadResult,
}

impl UploadTask {
    pub fn new(path: BackupPath, file: FileUploadResult) -> Self {
        Self { path, file }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadOutcome {
    Uploaded(u64),
    AlreadyUploaded,
    Failed,
    Cancelled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub bytes: u64,
}

impl UploadSummary {
    fn add(&mut self, outcome: UploadOutcome) {
        match outcome {
            UploadOutcome::Uploaded(bytes) => {
                self.uploaded += 1;
                self.bytes += bytes;
            }
            UploadOutcome::AlreadyUploaded => self.skipped += 1,
            UploadOutcome::Failed | UploadOutcome::Cancelled => self.failed += 1,
        }
    }
}

/// Everything one upload task needs, cheap to clone into the task.
#[derive(Clone)]
struct UploadWorker {
    remote: Arc<RemoteFileSystem>,
    uploaded: Arc<UploadedFilesLedger>,
    limiter: Arc<DynamicRateLimiter>,
    semaphore: Arc<Semaphore>,
    max_attempts: usize,
}

pub struct UploadQueue {
    worker: UploadWorker,
    budget: u32,
    cancel: CancellationToken,
    /// Remote keys with a task in the pool
    queued: Arc<DashMap<String, ()>>,
    handles: Mutex<Vec<JoinHandle<UploadOutcome>>>,
}

impl UploadQueue {
    pub fn new(
        remote: Arc<RemoteFileSystem>,
        uploaded: Arc<UploadedFilesLedger>,
        limiter: Arc<DynamicRateLimiter>,
        workers: usize,
        max_attempts: usize,
        cancel: CancellationToken,
    ) -> Self {
        let budget = (workers.max(1) as u32).saturating_mul(PERMITS_PER_WORKER);
        Self {
            worker: UploadWorker {
                remote,
                uploaded,
                limiter,
                semaphore: Arc::new(Semaphore::new(budget as usize)),
                max_attempts,
            },
            budget,
            cancel,
            queued: Arc::new(DashMap::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn limiter(&self) -> &DynamicRateLimiter {
        &self.worker.limiter
    }

    pub fn uploaded_ledger(&self) -> &UploadedFilesLedger {
        &self.worker.uploaded
    }

    /// Number of components enqueued and not finished yet.
    pub fn pending(&self) -> usize {
        self.queued.len()
    }

    /// Start uploading `task` in the background. Returns false when the same
    /// remote key is already in the pool.
    pub fn enqueue(&self, task: UploadTask) -> bool {
        let key = task.path.remote_key();
        if self.queued.insert(key.clone(), ()).is_some() {
            debug!("Upload of {} already queued", key);
            return false;
        }

        let worker = self.worker.clone();
        let cancel = self.cancel.clone();
        let queued = self.queued.clone();
        let weight = concurrency_weight(task.file.size).min(self.budget);

        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = worker.upload(weight, &key, &task) => outcome,
                _ = cancel.cancelled() => UploadOutcome::Cancelled,
            };
            queued.remove(&key);
            outcome
        });

        if let Ok(mut handles) = self.handles.lock() {
            handles.push(handle);
        }
        true
    }

    /// Wait for every task enqueued so far.
    pub async fn drain(&self) -> UploadSummary {
        let handles: Vec<_> = match self.handles.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        let mut summary = UploadSummary::default();
        for handle in handles {
            match handle.await {
                Ok(outcome) => summary.add(outcome),
                Err(e) => {
                    warn!("Upload task panicked: {}", e);
                    summary.failed += 1;
                }
            }
        }

        if summary != UploadSummary::default() {
            info!(
                uploaded = summary.uploaded,
                skipped = summary.skipped,
                failed = summary.failed,
                bytes = summary.bytes,
                "Upload queue drained"
            );
        }
        summary
    }
}

impl UploadWorker {
    async fn upload(&self, weight: u32, key: &str, task: &UploadTask) -> UploadOutcome {
        let local = &task.file.local_path;

        if self.uploaded.is_uploaded(&task.file).await {
            remove_local(local).await;
            return UploadOutcome::AlreadyUploaded;
        }

        let permit = match self.semaphore.acquire_many(weight).await {
            Ok(permit) => permit,
            Err(e) => {
                warn!("Upload pool closed before {}: {}", key, e);
                return UploadOutcome::Failed;
            }
        };
        self.limiter.acquire(task.file.size).await;

        let result =
            with_retries(key, self.max_attempts, || self.remote.upload(&task.path, local)).await;
        drop(permit);

        match result {
            Ok(bytes) => {
                if let Err(e) = self.uploaded.record(&task.file, key).await {
                    warn!("Uploaded {} but failed to record it: {}", key, e);
                    return UploadOutcome::Uploaded(bytes);
                }
                remove_local(local).await;
                UploadOutcome::Uploaded(bytes)
            }
            Err(e) => {
                warn!("Failed to upload {}: {}", local.display(), e);
                UploadOutcome::Failed
            }
        }
    }
}

async fn remove_local(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete uploaded file {}: {}", path.display(), e),
    }
}
