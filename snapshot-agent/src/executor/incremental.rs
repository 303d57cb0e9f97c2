//! Incremental backup pass.
//!
//! The database hard-links every flushed SSTable into `<table>/backups/`.
//! Each pass uploads what it finds there as SST_V2 components and lets the
//! upload queue delete the local links afterwards.

use crate::config::BackupConfig;
use crate::executor::upload::{UploadQueue, UploadSummary};
use crate::executor::upload_task;
use crate::fs::scanner::{list_files, SnapshotScanner};
use crate::lock::TaskLock;
use crate::path::RemotePathFactory;
use crate::utils::errors::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub struct IncrementalBackup {
    scanner: SnapshotScanner,
    factory: RemotePathFactory,
    backup: BackupConfig,
    queue: Arc<UploadQueue>,
    lock: TaskLock,
}

impl IncrementalBackup {
    pub fn new(
        scanner: SnapshotScanner,
        factory: RemotePathFactory,
        backup: BackupConfig,
        queue: Arc<UploadQueue>,
    ) -> Self {
        Self {
            scanner,
            factory,
            backup,
            queue,
            lock: TaskLock::new("incremental-backup"),
        }
    }

    pub fn lock(&self) -> &TaskLock {
        &self.lock
    }

    /// Upload every file currently in the tables' incremental directories.
    pub async fn run(&self) -> Result<UploadSummary> {
        let _guard = self.lock.try_acquire()?;

        let mut enqueued = 0;
        for table in self.scanner.table_dirs()? {
            let dir = table.incremental_dir();
            if !dir.is_dir() {
                continue;
            }
            let files = match list_files(&dir) {
                Ok(files) => files,
                Err(e) => {
                    warn!("Skipping {}: {}", dir.display(), e);
                    continue;
                }
            };

            for local in files {
                let task = upload_task(&self.factory, &self.backup, &table, &dir, &local);
                if self.queue.enqueue(task) {
                    enqueued += 1;
                }
            }
        }

        let summary = self.queue.drain().await;
        info!(
            enqueued,
            uploaded = summary.uploaded,
            failed = summary.failed,
            "Incremental backup pass finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::executor::uploaded::UploadedFilesLedger;
    use crate::fs::filter::ColumnFamilyFilter;
    use crate::metrics::BackupMetrics;
    use crate::remote::{LocalObjectStore, RemoteFileSystem};
    use crate::throttle::DynamicRateLimiter;
    use futures_util::TryStreamExt;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_uploads_and_clears_incremental_dirs() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let data = temp_dir.path().join("data");
        let backups = data.join("ks1/cf1/backups");
        std::fs::create_dir_all(&backups)?;
        std::fs::write(backups.join("mc-5-big-Data.db"), b"data")?;
        std::fs::write(backups.join("mc-5-big-Index.db"), b"index")?;
        let skipped = data.join("OpsCenter/rollups60/backups");
        std::fs::create_dir_all(&skipped)?;
        std::fs::write(skipped.join("mc-1-big-Data.db"), b"ops")?;

        let remote = Arc::new(RemoteFileSystem::new(
            Arc::new(LocalObjectStore::new(temp_dir.path().join("bucket"))),
            EventBus::new(),
            Arc::new(BackupMetrics::new()),
            temp_dir.path().join("scratch"),
        ));
        let queue = Arc::new(UploadQueue::new(
            remote.clone(),
            Arc::new(UploadedFilesLedger::new(temp_dir.path().join("uploaded"))),
            Arc::new(DynamicRateLimiter::unlimited()),
            2,
            2,
            CancellationToken::new(),
        ));
        let factory = RemotePathFactory::new("backups", "cass_test", "us-east-1", "1");
        let scanner = SnapshotScanner::new(data.clone(), ColumnFamilyFilter::new("", "OpsCenter")?);
        let incremental = IncrementalBackup::new(scanner, factory.clone(), BackupConfig::default(), queue);

        let summary = incremental.run().await?;
        assert_eq!(summary.uploaded, 2);
        assert_eq!(std::fs::read_dir(&backups)?.count(), 0);
        assert!(skipped.join("mc-1-big-Data.db").exists());

        let prefix = factory.sst_v2_prefix();
        let keys: Vec<String> = remote
            .list(&prefix, None)
            .map_ok(|o| o.key)
            .try_collect()
            .await?;
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.contains("/ks1/cf1/mc-5-big/")));
        Ok(())
    }
}
