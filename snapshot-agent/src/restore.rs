//! Restore staging.
//!
//! Picks the newest valid manifest in a window and downloads every file it
//! references into `<target>/<keyspace>/<table>/<file>`. Moving staged files
//! into a live data directory is left to the operator.

use crate::lock::TaskLock;
use crate::manifest::MetaProxy;
use crate::path::{BackupPath, DateRange};
use crate::remote::{with_retries, RemoteFileSystem};
use crate::utils::errors::{BackupError, Result};
use futures_util::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub manifest: BackupPath,
    pub files: Vec<BackupPath>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub manifest: String,
    pub files: usize,
    pub bytes: u64,
}

pub struct Restorer {
    proxy: MetaProxy,
    remote: Arc<RemoteFileSystem>,
    download_workers: usize,
    max_attempts: usize,
    lock: TaskLock,
}

impl Restorer {
    pub fn new(
        proxy: MetaProxy,
        remote: Arc<RemoteFileSystem>,
        download_workers: usize,
        max_attempts: usize,
    ) -> Self {
        Self {
            proxy,
            remote,
            download_workers: download_workers.max(1),
            max_attempts,
            lock: TaskLock::new("restore"),
        }
    }

    /// Files of the newest manifest in `range` whose references all exist.
    pub async fn plan(&self, range: &DateRange) -> Result<RestorePlan> {
        for manifest in self.proxy.find_meta_files(range).await? {
            match self.proxy.is_meta_file_valid(&manifest).await {
                Ok(result) if result.valid => {}
                Ok(result) => {
                    warn!(
                        "Skipping manifest {} with {} missing files",
                        manifest.remote_key(),
                        result.missing.len()
                    );
                    continue;
                }
                Err(e) => {
                    warn!("Skipping unreadable manifest {}: {}", manifest.remote_key(), e);
                    continue;
                }
            }

            let local = self.proxy.download_meta_file(&manifest).await?;
            let files = self.proxy.referenced_files(&local).await;
            self.proxy.discard(&local).await;
            let files = files?;
            let total_bytes = files.iter().map(|f| f.size).sum();
            return Ok(RestorePlan {
                manifest,
                files,
                total_bytes,
            });
        }
        Err(BackupError::NoManifest(range.to_string()))
    }

    /// Download the plan for `range` into `target_dir`.
    pub async fn restore(&self, range: &DateRange, target_dir: &Path) -> Result<RestoreSummary> {
        let _guard = self.lock.try_acquire()?;
        let plan = self.plan(range).await?;
        info!(
            manifest = %plan.manifest.remote_key(),
            files = plan.files.len(),
            bytes = plan.total_bytes,
            "Restoring backup"
        );

        let bytes: Vec<u64> = stream::iter(plan.files.iter().map(|file| async move {
            let key = file.remote_key();
            let local = staging_path(target_dir, file)?;
            let bytes =
                with_retries(&key, self.max_attempts, || self.remote.download(file, &local)).await?;
            Ok::<u64, BackupError>(bytes)
        }))
        .buffer_unordered(self.download_workers)
        .try_collect()
        .await?;

        let summary = RestoreSummary {
            manifest: plan.manifest.remote_key(),
            files: bytes.len(),
            bytes: bytes.iter().sum(),
        };
        info!(files = summary.files, bytes = summary.bytes, "Restore finished");
        Ok(summary)
    }
}

fn staging_path(target_dir: &Path, file: &BackupPath) -> Result<PathBuf> {
    match (&file.keyspace, &file.table) {
        (Some(keyspace), Some(table)) => Ok(target_dir.join(keyspace).join(table).join(&file.file_name)),
        _ => Err(BackupError::InvalidPath(format!(
            "{} has no keyspace or table",
            file.remote_key()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RemoteFixture;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 10, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    fn restorer(fx: &RemoteFixture) -> Restorer {
        Restorer::new(fx.proxy(), fx.remote.clone(), 4, 2)
    }

    #[tokio::test]
    async fn test_restore_stages_newest_valid_backup() -> Result<()> {
        let fx = RemoteFixture::new()?;
        let data = fx.upload_component("ks1", "cf1", "mc-1-big-Data.db", at(-30)).await?;
        let index = fx.upload_component("ks1", "cf1", "mc-1-big-Index.db", at(-30)).await?;
        let other = fx.upload_component("ks2", "cf9", "mc-7-big-Data.db", at(-30)).await?;
        let lost = fx.upload_component("ks1", "cf1", "mc-2-big-Data.db", at(-3)).await?;

        let good = fx
            .publish_manifest(at(-10), &[data.clone(), index.clone(), other.clone()])
            .await?;
        fx.publish_manifest(at(-2), &[data, lost.clone()]).await?;
        fx.remote.delete(&[lost.backup_path.clone().unwrap_or_default()]).await?;

        let range = DateRange::ending_at(at(0), Duration::days(1));
        let plan = restorer(&fx).plan(&range).await?;
        assert_eq!(plan.manifest.remote_key(), good.remote_key());
        assert_eq!(plan.files.len(), 3);

        let target = fx.temp_dir.path().join("restore");
        let summary = restorer(&fx).restore(&range, &target).await?;
        assert_eq!(summary.files, 3);
        assert_eq!(summary.manifest, good.remote_key());
        assert_eq!(
            std::fs::read_to_string(target.join("ks1/cf1/mc-1-big-Index.db"))?,
            "ks1/cf1/mc-1-big-Index.db"
        );
        assert!(target.join("ks2/cf9/mc-7-big-Data.db").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_no_manifest_in_range() -> Result<()> {
        let fx = RemoteFixture::new()?;
        let range = DateRange::ending_at(at(0), Duration::days(1));
        assert!(matches!(
            restorer(&fx).plan(&range).await,
            Err(BackupError::NoManifest(_))
        ));
        Ok(())
    }
}
