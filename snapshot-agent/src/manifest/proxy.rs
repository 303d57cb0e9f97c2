//! Uniform access to V1 and V2 manifests.

use crate::config::MetaVersion;
use crate::manifest::reader::read_meta_file;
use crate::manifest::writer::cleanup_old;
use crate::manifest::{parse_meta_file_name, META_V1_FILE_NAME};
use crate::path::backup_path::format_v1_time;
use crate::path::{BackupFileType, BackupPath, DateRange, RemotePathFactory};
use crate::remote::{with_retries, RemoteFileSystem};
use crate::utils::errors::{BackupError, Result};
use crate::verify::BackupVerificationResult;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parallel existence checks during validation.
const EXISTS_CONCURRENCY: usize = 16;

const DOWNLOAD_DIR: &str = "downloaded";

/// Manifest operations for the configured format.
///
/// V1 manifests are flat JSON arrays of remote keys stored as `META/meta.json`.
/// V2 manifests are the streaming documents written by
/// [`crate::manifest::MetaFileWriter`].
#[derive(Clone)]
pub struct MetaProxy {
    version: MetaVersion,
    remote: Arc<RemoteFileSystem>,
    factory: RemotePathFactory,
    meta_dir: PathBuf,
    download_dir: PathBuf,
    max_attempts: usize,
}

impl MetaProxy {
    pub fn new(
        version: MetaVersion,
        remote: Arc<RemoteFileSystem>,
        factory: RemotePathFactory,
        meta_dir: PathBuf,
        max_attempts: usize,
    ) -> Self {
        let download_dir = meta_dir.join(DOWNLOAD_DIR);
        Self {
            version,
            remote,
            factory,
            meta_dir,
            download_dir,
            max_attempts,
        }
    }

    pub fn version(&self) -> MetaVersion {
        self.version
    }

    /// Remote manifests whose backup time falls inside `range`, newest first.
    pub async fn find_meta_files(&self, range: &DateRange) -> Result<Vec<BackupPath>> {
        let prefix = match self.version {
            MetaVersion::V1 => format!("{}{}", self.factory.v1_node_prefix(), range.v1_match()),
            MetaVersion::V2 => format!("{}{}", self.factory.meta_v2_prefix(), range.millis_match()),
        };

        let mut found = Vec::new();
        let mut listing = self.remote.list(&prefix, None);
        while let Some(object) = listing.try_next().await? {
            let path = match self.factory.parse(&object.key) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping unparsable remote key {}: {}", object.key, e);
                    continue;
                }
            };
            if self.is_manifest(&path) && range.contains(&path.time) {
                found.push(path);
            }
        }

        found.sort_by(|a, b| b.time.cmp(&a.time));
        debug!("Found {} manifests in {}", found.len(), range);
        Ok(found)
    }

    fn is_manifest(&self, path: &BackupPath) -> bool {
        match self.version {
            MetaVersion::V1 => {
                path.file_type == BackupFileType::Meta && path.file_name == META_V1_FILE_NAME
            }
            MetaVersion::V2 => {
                path.file_type == BackupFileType::MetaV2
                    && parse_meta_file_name(&path.file_name).is_some()
            }
        }
    }

    /// Download a remote manifest into a directory of its own under the local
    /// work area. Release it with [`MetaProxy::discard`].
    pub async fn download_meta_file(&self, path: &BackupPath) -> Result<PathBuf> {
        let local_name = match self.version {
            MetaVersion::V1 => format!("meta_v1_{}.json", format_v1_time(&path.time)),
            MetaVersion::V2 => path.file_name.clone(),
        };
        let local = self
            .download_dir
            .join(uuid::Uuid::new_v4().to_string())
            .join(local_name);
        let key = path.remote_key();
        let downloaded =
            with_retries(&key, self.max_attempts, || self.remote.download(path, &local)).await;
        if let Err(e) = downloaded {
            self.discard(&local).await;
            return Err(e);
        }
        Ok(local)
    }

    /// Remove a manifest returned by [`MetaProxy::download_meta_file`].
    pub async fn discard(&self, local: &Path) {
        let _ = tokio::fs::remove_file(local).await;
        if let Some(dir) = local.parent().filter(|dir| dir.starts_with(&self.download_dir)) {
            let _ = tokio::fs::remove_dir(dir).await;
        }
    }

    /// Every data file a downloaded manifest references.
    pub async fn referenced_files(&self, local: &Path) -> Result<Vec<BackupPath>> {
        let local = local.to_path_buf();
        let factory = self.factory.clone();
        let version = self.version;
        tokio::task::spawn_blocking(move || match version {
            MetaVersion::V1 => read_v1_references(&local, &factory),
            MetaVersion::V2 => read_v2_references(&local, &factory),
        })
        .await?
    }

    /// Remote keys a downloaded manifest references.
    pub async fn referenced_keys(&self, local: &Path) -> Result<HashSet<String>> {
        Ok(self
            .referenced_files(local)
            .await?
            .iter()
            .map(BackupPath::remote_key)
            .collect())
    }

    /// Check that every file referenced by the remote manifest `path` exists.
    pub async fn is_meta_file_valid(&self, path: &BackupPath) -> Result<BackupVerificationResult> {
        let local = self.download_meta_file(path).await?;
        let files = self.referenced_files(&local).await;
        self.discard(&local).await;
        let files = files?;

        let keys: Vec<String> = files.iter().map(BackupPath::remote_key).collect();
        let checks = stream::iter(keys.into_iter().map(|key| async move {
            let exists =
                with_retries(&key, self.max_attempts, || self.remote.exists(&key)).await?;
            Ok::<_, BackupError>((key, exists))
        }))
        .buffer_unordered(EXISTS_CONCURRENCY)
        .try_collect::<Vec<_>>()
        .await?;

        let mut missing: Vec<String> = checks
            .into_iter()
            .filter(|(_, exists)| !exists)
            .map(|(key, _)| key)
            .collect();
        missing.sort();

        Ok(BackupVerificationResult {
            valid: missing.is_empty(),
            manifest: Some(path.remote_key()),
            snapshot_time: Some(path.time),
            files_checked: files.len(),
            missing,
        })
    }

    /// Remove manifests written by earlier runs, finished or not.
    ///
    /// Downloads are left alone: other tasks may be reading them.
    pub async fn cleanup_old_meta_files(&self) -> Result<usize> {
        cleanup_old(&self.meta_dir).await
    }
}

/// Drop every downloaded manifest under `meta_dir`. Only safe while no task is
/// reading manifests, i.e. at startup.
pub async fn clear_downloads(meta_dir: &Path) -> Result<usize> {
    let download_dir = meta_dir.join(DOWNLOAD_DIR);
    if !tokio::fs::try_exists(&download_dir).await? {
        return Ok(0);
    }

    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(&download_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let cleared = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await
        } else {
            tokio::fs::remove_file(entry.path()).await
        };
        match cleared {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
        }
    }
    if removed > 0 {
        info!("Cleared {} downloaded manifests", removed);
    }
    Ok(removed)
}

fn read_v2_references(local: &Path, factory: &RemotePathFactory) -> Result<Vec<BackupPath>> {
    let mut files = Vec::new();
    read_meta_file(local, |cf| {
        for component in cf.components() {
            let mut path = match &component.backup_path {
                Some(key) => match factory.parse(key) {
                    Ok(path) => path,
                    Err(e) => {
                        warn!("Skipping manifest entry with bad location {}: {}", key, e);
                        continue;
                    }
                },
                None => factory.sst_v2(
                    &cf.keyspace_name,
                    &cf.columnfamily_name,
                    &component.file_name,
                    component.last_modified,
                ),
            };
            path.compression = component.compression;
            path.size = component.size;
            files.push(path);
        }
    })?;
    Ok(files)
}

fn read_v1_references(local: &Path, factory: &RemotePathFactory) -> Result<Vec<BackupPath>> {
    let reader = std::io::BufReader::new(std::fs::File::open(local)?);
    let keys: Vec<String> = serde_json::from_reader(reader)
        .map_err(|e| BackupError::InvalidMetaFile(format!("{}: {}", local.display(), e)))?;

    Ok(keys
        .iter()
        .filter_map(|key| match factory.parse(key) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Skipping unparsable key {} in {}: {}", key, local.display(), e);
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::manifest::{meta_file_name, ColumnFamilyResult, FileUploadResult, MetaFileInfo, MetaFileWriter};
    use crate::metrics::BackupMetrics;
    use crate::path::CompressionType;
    use crate::remote::LocalObjectStore;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        root: PathBuf,
        remote: Arc<RemoteFileSystem>,
        factory: RemotePathFactory,
    }

    fn fixture() -> std::io::Result<Fixture> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();
        let remote = Arc::new(RemoteFileSystem::new(
            Arc::new(LocalObjectStore::new(root.join("bucket"))),
            EventBus::new(),
            Arc::new(BackupMetrics::new()),
            root.join("scratch"),
        ));
        Ok(Fixture {
            _temp_dir: temp_dir,
            root,
            remote,
            factory: RemotePathFactory::new("backups", "cass_test", "us-east-1", "1"),
        })
    }

    fn proxy(fx: &Fixture, version: MetaVersion) -> MetaProxy {
        MetaProxy::new(version, fx.remote.clone(), fx.factory.clone(), fx.root.join("meta"), 2)
    }

    /// Upload one data file and a V2 manifest referencing it plus `extra` missing files.
    async fn publish_v2(fx: &Fixture, snapshot_time: chrono::DateTime<Utc>, extra: &[&str]) -> Result<BackupPath> {
        let data = fx.root.join("mc-1-big-Data.db");
        tokio::fs::write(&data, b"data").await?;
        let local = crate::fs::metadata::LocalFile::from_path(&data)?;

        let mut components = Vec::new();
        for name in std::iter::once("mc-1-big-Data.db").chain(extra.iter().copied()) {
            let mut component = FileUploadResult::new(&local, "ks1", "cf1", CompressionType::Snappy);
            component.file_name = name.to_string();
            let path = fx.factory.sst_v2("ks1", "cf1", name, component.last_modified);
            component.backup_path = Some(path.remote_key());
            if name == "mc-1-big-Data.db" {
                fx.remote.upload(&path, &data).await?;
            }
            components.push(component);
        }

        let info = MetaFileInfo::new("cass_test", "us-east-1", "rack1", "1");
        let work = fx.root.join("work");
        let mut writer = MetaFileWriter::start(&work, &info, snapshot_time).await?;
        writer
            .add_column_family(&ColumnFamilyResult::from_components("ks1", "cf1", components))
            .await?;
        let manifest = writer.finish().await?;
        let meta = fx.factory.meta_v2(&meta_file_name(&snapshot_time), snapshot_time);
        fx.remote.upload(&meta, &manifest).await?;
        Ok(meta)
    }

    #[tokio::test]
    async fn test_find_meta_files_newest_first_within_range() -> Result<()> {
        let fx = fixture()?;
        let base = Utc.with_ymd_and_hms(2023, 1, 10, 0, 0, 0).unwrap();
        for days in [0, 1, 2, 5] {
            publish_v2(&fx, base + Duration::days(days), &[]).await?;
        }

        let proxy = proxy(&fx, MetaVersion::V2);
        let range = DateRange::new(base, base + Duration::days(3))?;
        let found = proxy.find_meta_files(&range).await?;
        let times: Vec<_> = found.iter().map(|p| p.time).collect();
        assert_eq!(
            times,
            vec![base + Duration::days(2), base + Duration::days(1), base]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_validation_reports_missing_files() -> Result<()> {
        let fx = fixture()?;
        let time = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let good = publish_v2(&fx, time, &[]).await?;
        let bad = publish_v2(&fx, time + Duration::hours(1), &["mc-1-big-Index.db"]).await?;

        let proxy = proxy(&fx, MetaVersion::V2);
        let result = proxy.is_meta_file_valid(&good).await?;
        assert!(result.valid);
        assert_eq!(result.files_checked, 1);

        let result = proxy.is_meta_file_valid(&bad).await?;
        assert!(!result.valid);
        assert_eq!(result.missing.len(), 1);
        assert!(result.missing[0].ends_with("/mc-1-big-Index.db"));
        Ok(())
    }

    #[tokio::test]
    async fn test_v1_manifest_is_a_key_array() -> Result<()> {
        let fx = fixture()?;
        let time = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let data = fx.factory.create(BackupFileType::Snapshot, Some("ks1"), Some("cf1"), "mc-1-big-Data.db", time);
        let local_data = fx.root.join("mc-1-big-Data.db");
        tokio::fs::write(&local_data, b"data").await?;
        fx.remote.upload(&data, &local_data).await?;

        let keys = vec![data.remote_key(), "garbage".to_string()];
        let local_meta = fx.root.join("meta.json");
        tokio::fs::write(&local_meta, serde_json::to_vec(&keys)?).await?;
        let meta = fx.factory.create(BackupFileType::Meta, None, None, META_V1_FILE_NAME, time);
        fx.remote.upload(&meta, &local_meta).await?;

        let proxy = proxy(&fx, MetaVersion::V1);
        let found = proxy.find_meta_files(&DateRange::until(Utc::now())).await?;
        assert_eq!(found, vec![meta.clone()]);

        let result = proxy.is_meta_file_valid(&meta).await?;
        assert!(result.valid);
        assert_eq!(result.files_checked, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_cleanup_keeps_downloads_in_use() -> Result<()> {
        let fx = fixture()?;
        let time = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let meta = publish_v2(&fx, time, &[]).await?;
        let proxy = proxy(&fx, MetaVersion::V2);

        let first = proxy.download_meta_file(&meta).await?;
        let second = proxy.download_meta_file(&meta).await?;
        assert_ne!(first, second);

        tokio::fs::write(fx.root.join("meta/meta_v2_202301010000.json.tmp"), b"{").await?;
        assert_eq!(proxy.cleanup_old_meta_files().await?, 1);
        assert!(first.exists());
        assert!(second.exists());

        proxy.discard(&first).await;
        assert!(!first.exists());
        assert!(first.parent().is_some_and(|dir| !dir.exists()));
        assert_eq!(proxy.referenced_files(&second).await?.len(), 1);

        assert_eq!(clear_downloads(&fx.root.join("meta")).await?, 1);
        assert!(!second.exists());
        Ok(())
    }
}
