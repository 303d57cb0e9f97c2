//! Snapshot orchestration.
//!
//! One run takes a database snapshot, streams a manifest describing every
//! component of it, uploads the manifest and hands the components that are
//! not uploaded yet to the upload queue. The upload pass that drains snapshot
//! directories runs separately and paces itself against a deadline.

pub mod incremental;
pub mod target;
pub mod upload;
pub mod uploaded;

use crate::config::{BackupConfig, Config, MetaVersion};
use crate::events::{BackupEvent, EventBus};
use crate::fs::filter::ColumnFamilyFilter;
use crate::fs::forgotten::ForgottenFilesManager;
use crate::fs::metadata::LocalFile;
use crate::fs::scanner::{decide_compression, has_compression_info, list_files, SnapshotScanner, TableDir};
use crate::lock::TaskLock;
use crate::manifest::{meta_file_name, ColumnFamilyResult, FileUploadResult, MetaFileInfo, MetaFileWriter, MetaProxy};
use crate::path::backup_path::format_v1_time;
use crate::path::{BackupFileType, RemotePathFactory};
use crate::remote::{with_retries, RemoteFileSystem};
use crate::snapshot::SnapshotTaker;
use crate::status::{BackupMetadata, BackupStatusLedger};
use crate::utils::errors::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use upload::{UploadQueue, UploadSummary, UploadTask};

/// Prefix of the snapshot tags this agent creates.
pub const SNAPSHOT_PREFIX: &str = "snap_v2_";

pub fn snapshot_name(time: &DateTime<Utc>) -> String {
    format!("{SNAPSHOT_PREFIX}{}", format_v1_time(time))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotState {
    Idle,
    SnapshotRequested,
    Snapshotting,
    ManifestGeneration,
    ManifestUpload,
    FileUploadEnqueued,
    Done,
    Failed,
}

/// Result of one successful snapshot run.
#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub snapshot_name: String,
    pub manifest_key: String,
    pub local_manifest: PathBuf,
    pub components: usize,
    pub already_uploaded: usize,
    pub enqueued: usize,
    pub metadata: BackupMetadata,
}

struct GeneratedManifest {
    local_manifest: PathBuf,
    components: usize,
    already_uploaded: usize,
    pending: Vec<UploadTask>,
}

/// Describe one local component as an SST_V2 upload, deciding its compression.
pub(crate) fn upload_task(
    factory: &RemotePathFactory,
    backup: &BackupConfig,
    table: &TableDir,
    dir: &Path,
    local: &LocalFile,
) -> UploadTask {
    let compression = decide_compression(
        backup.compression_policy,
        BackupFileType::SstV2,
        local.last_modified,
        backup.compression_transition_epoch_millis,
        has_compression_info(dir, &local.file_name),
    );
    let mut file = FileUploadResult::new(local, &table.keyspace, &table.table, compression);
    let mut path = factory.sst_v2(&table.keyspace, &table.table, &file.file_name, file.last_modified);
    path.compression = compression;
    path.size = file.size;
    file.backup_path = Some(path.remote_key());
    UploadTask::new(path, file)
}

pub struct SnapshotOrchestrator {
    config: Arc<Config>,
    factory: RemotePathFactory,
    scanner: SnapshotScanner,
    snapshotter: Arc<dyn SnapshotTaker>,
    remote: Arc<RemoteFileSystem>,
    proxy: MetaProxy,
    status: Arc<BackupStatusLedger>,
    queue: Arc<UploadQueue>,
    forgotten: Option<ForgottenFilesManager>,
    events: EventBus,
    lock: TaskLock,
    upload_lock: TaskLock,
    /// Snapshot tag whose manifest is being generated
    generating: Mutex<Option<String>>,
    state: watch::Sender<SnapshotState>,
}

impl SnapshotOrchestrator {
    pub fn new(
        config: Arc<Config>,
        snapshotter: Arc<dyn SnapshotTaker>,
        remote: Arc<RemoteFileSystem>,
        status: Arc<BackupStatusLedger>,
        queue: Arc<UploadQueue>,
        events: EventBus,
    ) -> Result<Self> {
        let factory = RemotePathFactory::from_config(&config);
        let filter = ColumnFamilyFilter::new(&config.backup.include_filter, &config.backup.exclude_filter)?;
        let scanner = SnapshotScanner::new(config.node.data_dir.clone(), filter);
        let proxy = MetaProxy::new(
            MetaVersion::V2,
            remote.clone(),
            factory.clone(),
            config.meta_dir(),
            config.performance.max_attempts,
        );
        let forgotten = config.backup.forgotten_files_enabled.then(|| {
            ForgottenFilesManager::new(
                Duration::days(config.backup.grace_period_days_for_compaction),
                Duration::days(config.backup.forgotten_file_grace_days),
            )
        });
        let (state, _) = watch::channel(SnapshotState::Idle);

        Ok(Self {
            config,
            factory,
            scanner,
            snapshotter,
            remote,
            proxy,
            status,
            queue,
            forgotten,
            events,
            lock: TaskLock::new("snapshot"),
            upload_lock: TaskLock::new("snapshot-upload"),
            generating: Mutex::new(None),
            state,
        })
    }

    pub fn lock(&self) -> &TaskLock {
        &self.lock
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    pub fn state(&self) -> SnapshotState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SnapshotState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SnapshotState) {
        debug!("Snapshot state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Take a snapshot at `now`, write and upload its manifest, and enqueue its
    /// components for upload.
    ///
    /// Fails immediately when another snapshot run holds the lock.
    pub async fn take_snapshot(&self, now: DateTime<Utc>) -> Result<SnapshotOutcome> {
        let _guard = self.lock.try_acquire()?;
        self.set_state(SnapshotState::SnapshotRequested);

        let name = snapshot_name(&now);
        let mut metadata = BackupMetadata::new(MetaVersion::V2, self.factory.token(), now);
        self.status.start(&mut metadata).await?;
        self.events.publish(BackupEvent::SnapshotStarted {
            snapshot_name: name.clone(),
        });
        info!("Starting snapshot {}", name);

        let result = self.run_snapshot(&name, now, &mut metadata).await;
        *self.generating.lock().await = None;

        match result {
            Ok(mut outcome) => {
                self.status.finish(&mut metadata).await?;
                self.remote.metrics().record_snapshot(true);
                self.events.publish(BackupEvent::SnapshotCompleted {
                    snapshot_name: name.clone(),
                    manifest: outcome.manifest_key.clone(),
                    files: outcome.components,
                });
                self.set_state(SnapshotState::Done);
                info!(
                    snapshot = %name,
                    components = outcome.components,
                    already_uploaded = outcome.already_uploaded,
                    enqueued = outcome.enqueued,
                    "Snapshot completed"
                );
                outcome.metadata = metadata;
                Ok(outcome)
            }
            Err(e) => {
                error!("Snapshot {} failed: {}", name, e);
                if let Err(ledger_err) = self.status.failed(&mut metadata).await {
                    warn!("Could not record failed backup {}: {}", metadata.id, ledger_err);
                }
                self.remote.metrics().record_snapshot(false);
                self.events.publish(BackupEvent::SnapshotFailed {
                    snapshot_name: name,
                    error: e.to_string(),
                });
                self.set_state(SnapshotState::Failed);
                Err(e)
            }
        }
    }

    async fn run_snapshot(
        &self,
        name: &str,
        now: DateTime<Utc>,
        metadata: &mut BackupMetadata,
    ) -> Result<SnapshotOutcome> {
        self.proxy.cleanup_old_meta_files().await?;

        self.set_state(SnapshotState::Snapshotting);
        let tables = self.scanner.table_dirs()?;
        *self.generating.lock().await = Some(name.to_string());
        self.snapshotter.take_snapshot(name, &tables).await?;
        metadata.cassandra_snapshot_success = true;
        self.status.update(metadata).await?;

        self.set_state(SnapshotState::ManifestGeneration);
        let generated = match self.generate_manifest(name, now, &tables).await {
            Ok(generated) => generated,
            Err(e) => {
                if let Err(clear_err) = self.snapshotter.clear_snapshot(name, &tables).await {
                    warn!("Could not clear snapshot {}: {}", name, clear_err);
                }
                return Err(e);
            }
        };

        self.set_state(SnapshotState::ManifestUpload);
        let file_name = meta_file_name(&now);
        let meta_path = self.factory.meta_v2(&file_name, now);
        let manifest_key = meta_path.remote_key();
        let attempts = self.config.performance.max_attempts;
        with_retries(&manifest_key, attempts, || {
            self.remote.upload(&meta_path, &generated.local_manifest)
        })
        .await?;
        metadata.snapshot_location = Some(manifest_key.clone());
        self.status.update(metadata).await?;

        self.set_state(SnapshotState::FileUploadEnqueued);
        let mut enqueued = 0;
        for task in generated.pending {
            if self.queue.enqueue(task) {
                enqueued += 1;
            }
        }

        Ok(SnapshotOutcome {
            snapshot_name: name.to_string(),
            manifest_key,
            local_manifest: generated.local_manifest,
            components: generated.components,
            already_uploaded: generated.already_uploaded,
            enqueued,
            metadata: metadata.clone(),
        })
    }

    async fn generate_manifest(
        &self,
        name: &str,
        now: DateTime<Utc>,
        tables: &[TableDir],
    ) -> Result<GeneratedManifest> {
        let node = &self.config.node;
        let info = MetaFileInfo::new(&node.cluster_name, &node.region, &node.rack, &node.token);
        let mut writer = MetaFileWriter::start(&self.config.meta_dir(), &info, now).await?;

        let mut already_uploaded = 0;
        let mut pending = Vec::new();
        for table in tables {
            let dir = table.snapshot_dir(name);
            if !dir.is_dir() {
                debug!("No snapshot directory for {}.{}", table.keyspace, table.table);
                continue;
            }

            let files = list_files(&dir)?;
            let mut names = HashSet::with_capacity(files.len());
            let mut components = Vec::with_capacity(files.len());
            for local in &files {
                names.insert(local.file_name.clone());
                let mut task = upload_task(&self.factory, &self.config.backup, table, &dir, local);
                if self.queue.uploaded_ledger().is_uploaded(&task.file).await {
                    task.file.uploaded = true;
                    already_uploaded += 1;
                    if let Err(e) = tokio::fs::remove_file(&local.path).await {
                        warn!("Failed to delete uploaded file {}: {}", local.path.display(), e);
                    }
                } else {
                    pending.push(task.clone());
                }
                components.push(task.file);
            }

            let cf = ColumnFamilyResult::from_components(&table.keyspace, &table.table, components);
            writer.add_column_family(&cf).await?;

            if let Some(manager) = &self.forgotten {
                let manager = manager.clone();
                let table_path = table.path.clone();
                let reconciled = tokio::task::spawn_blocking(move || {
                    manager.reconcile(&table_path, &names, now, Utc::now())
                })
                .await?;
                if let Err(e) = reconciled {
                    warn!("Forgotten file check failed for {}: {}", table.path.display(), e);
                }
            }
        }

        let components = writer.component_count();
        let local_manifest = writer.finish().await?;
        Ok(GeneratedManifest {
            local_manifest,
            components,
            already_uploaded,
            pending,
        })
    }

    /// Upload every component still sitting in a snapshot directory, paced to
    /// finish before the upload target, then drop emptied snapshot directories.
    pub async fn upload_pending(&self, next_snapshot: Option<DateTime<Utc>>) -> Result<UploadSummary> {
        let _guard = self.upload_lock.try_acquire()?;
        let now = Utc::now();
        // Held while listing so no snapshot can start between the check and the scan.
        let generating = self.generating.lock().await;

        let mut tasks = Vec::new();
        let mut snapshot_dirs = Vec::new();
        for table in self.scanner.table_dirs()? {
            for tag in table.snapshot_tags()? {
                if !tag.starts_with(SNAPSHOT_PREFIX) || generating.as_deref() == Some(tag.as_str()) {
                    continue;
                }
                let dir = table.snapshot_dir(&tag);
                let files = match list_files(&dir) {
                    Ok(files) => files,
                    Err(e) => {
                        warn!("Skipping {}: {}", dir.display(), e);
                        continue;
                    }
                };
                for local in &files {
                    tasks.push(upload_task(&self.factory, &self.config.backup, &table, &dir, local));
                }
                snapshot_dirs.push(dir);
            }
        }
        drop(generating);

        let remaining: u64 = tasks.iter().map(|t| t.file.size).sum();
        let last_verified = self.status.latest_validated().await.map(|m| m.start);
        let target = target::upload_target(
            now,
            self.config.backup.target_minutes_to_complete_upload,
            next_snapshot,
            last_verified,
            self.config.verification.slo_hours,
        );
        let rate = self.queue.limiter().set_target(remaining, target, now).await;
        info!(
            files = tasks.len(),
            bytes = remaining,
            deadline = ?target,
            rate,
            "Uploading pending snapshot files"
        );

        for task in tasks {
            self.queue.enqueue(task);
        }
        let summary = self.queue.drain().await;

        for dir in snapshot_dirs {
            if tokio::fs::remove_dir(&dir).await.is_ok() {
                debug!("Removed empty snapshot directory {}", dir.display());
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnapshotMethod;
    use crate::executor::uploaded::UploadedFilesLedger;
    use crate::manifest::read_meta_file;
    use crate::metrics::BackupMetrics;
    use crate::remote::LocalObjectStore;
    use crate::snapshot::HardLinkSnapshotter;
    use crate::status::BackupStatus;
    use crate::throttle::DynamicRateLimiter;
    use crate::utils::errors::BackupError;
    use chrono::TimeZone;
    use futures_util::TryStreamExt;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        _temp_dir: TempDir,
        data: PathBuf,
        config: Arc<Config>,
        remote: Arc<RemoteFileSystem>,
        status: Arc<BackupStatusLedger>,
        orchestrator: SnapshotOrchestrator,
    }

    async fn fixture() -> Result<Fixture> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();
        let mut config = Config::default();
        config.node.cluster_name = "cass_test".into();
        config.node.token = "1808575600".into();
        config.node.data_dir = root.join("data");
        config.node.state_dir = root.join("state");
        config.remote.store_root = root.join("bucket");
        config.status.file = root.join("state/backup_status.json");
        config.backup.snapshot_method = SnapshotMethod::Hardlink;
        config.backup.exclude_filter = "OpsCenter".into();
        config.performance.max_attempts = 2;
        let config = Arc::new(config);

        let remote = Arc::new(RemoteFileSystem::new(
            Arc::new(LocalObjectStore::new(config.remote.store_root.clone())),
            EventBus::new(),
            Arc::new(BackupMetrics::new()),
            root.join("state/scratch"),
        ));
        let status = Arc::new(BackupStatusLedger::open(config.status.file.clone(), 60).await?);
        let queue = Arc::new(UploadQueue::new(
            remote.clone(),
            Arc::new(UploadedFilesLedger::new(config.uploaded_dir())),
            Arc::new(DynamicRateLimiter::unlimited()),
            2,
            2,
            CancellationToken::new(),
        ));
        let orchestrator = SnapshotOrchestrator::new(
            config.clone(),
            Arc::new(HardLinkSnapshotter),
            remote.clone(),
            status.clone(),
            queue,
            EventBus::new(),
        )?;

        Ok(Fixture {
            _temp_dir: temp_dir,
            data: root.join("data"),
            config,
            remote,
            status,
            orchestrator,
        })
    }

    fn write(path: &Path, content: &[u8]) -> std::io::Result<()> {
        std::fs::create_dir_all(path.parent().unwrap_or(path))?;
        std::fs::write(path, content)
    }

    fn snapshot_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
    }

    async fn remote_keys(fx: &Fixture, prefix: &str) -> Result<Vec<String>> {
        Ok(fx.remote.list(prefix, None).map_ok(|o| o.key).try_collect().await?)
    }

    #[tokio::test]
    async fn test_basic_backup_cycle() -> Result<()> {
        let fx = fixture().await?;
        write(&fx.data.join("ks1/cf1/mc-1-big-Data.db"), b"data")?;
        write(&fx.data.join("ks1/cf1/mc-1-big-Index.db"), b"index")?;

        let outcome = fx.orchestrator.take_snapshot(snapshot_time()).await?;
        assert_eq!(outcome.snapshot_name, "snap_v2_202301010000");
        assert_eq!(outcome.components, 2);
        assert_eq!(outcome.enqueued, 2);
        assert_eq!(fx.orchestrator.state(), SnapshotState::Done);

        let mut tables = Vec::new();
        read_meta_file(&outcome.local_manifest, |cf| tables.push(cf))?;
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].keyspace_name, "ks1");
        assert_eq!(tables[0].columnfamily_name, "cf1");
        assert_eq!(tables[0].sstables.len(), 1);
        assert_eq!(tables[0].sstables[0].sstable_components.len(), 2);

        let summary = fx.orchestrator.queue().drain().await;
        assert_eq!(summary.uploaded, 2);

        let snapshot_dir = fx.data.join("ks1/cf1/snapshots/snap_v2_202301010000");
        assert_eq!(std::fs::read_dir(&snapshot_dir)?.count(), 0);
        for component in tables[0].components() {
            let key = component.backup_path.clone().unwrap_or_default();
            assert!(fx.remote.exists(&key).await?, "{key} missing remotely");
            assert!(fx.orchestrator.queue().uploaded_ledger().is_uploaded(component).await);
        }
        assert!(fx.remote.exists(&outcome.manifest_key).await?);
        assert!(fx.data.join("ks1/cf1/mc-1-big-Data.db").exists());

        let entries = fx.status.all().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, BackupStatus::Finished);
        assert!(entries[0].cassandra_snapshot_success);
        assert_eq!(entries[0].snapshot_location.as_deref(), Some(outcome.manifest_key.as_str()));

        fx.orchestrator.upload_pending(None).await?;
        assert!(!snapshot_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_second_snapshot_reuses_uploaded_versions() -> Result<()> {
        let fx = fixture().await?;
        write(&fx.data.join("ks1/cf1/mc-1-big-Data.db"), b"data")?;
        fx.orchestrator.take_snapshot(snapshot_time()).await?;
        fx.orchestrator.queue().drain().await;
        let uploads = fx.remote.metrics().snapshot().upload_valid;

        let later = snapshot_time() + Duration::minutes(1);
        let outcome = fx.orchestrator.take_snapshot(later).await?;
        assert_eq!(outcome.already_uploaded, 1);
        assert_eq!(outcome.enqueued, 0);
        // Only the second manifest was uploaded.
        assert_eq!(fx.remote.metrics().snapshot().upload_valid, uploads + 1);

        let mut flags = Vec::new();
        read_meta_file(&outcome.local_manifest, |cf| {
            flags.extend(cf.components().map(|c| c.uploaded))
        })?;
        assert_eq!(flags, vec![true]);
        assert!(!fx.data.join("ks1/cf1/snapshots/snap_v2_202301010001/mc-1-big-Data.db").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_filtered_keyspace_is_never_touched() -> Result<()> {
        let fx = fixture().await?;
        write(&fx.data.join("ks1/cf1/mc-1-big-Data.db"), b"data")?;
        write(&fx.data.join("OpsCenter/rollups60/mc-9-big-Data.db"), b"ops")?;
        write(&fx.data.join("OpsCenter/rollups60/snapshots/old/mc-8-big-Data.db"), b"ops")?;

        let outcome = fx.orchestrator.take_snapshot(snapshot_time()).await?;
        fx.orchestrator.queue().drain().await;
        fx.orchestrator.upload_pending(None).await?;

        let mut keyspaces = Vec::new();
        read_meta_file(&outcome.local_manifest, |cf| keyspaces.push(cf.keyspace_name))?;
        assert_eq!(keyspaces, vec!["ks1"]);

        assert!(!fx.data.join("OpsCenter/rollups60/snapshots/snap_v2_202301010000").exists());
        assert!(fx.data.join("OpsCenter/rollups60/snapshots/old/mc-8-big-Data.db").exists());
        let factory = RemotePathFactory::from_config(&fx.config);
        let keys = remote_keys(&fx, &factory.sst_v2_prefix()).await?;
        assert_eq!(keys.len(), 1);
        assert!(keys.iter().all(|k| !k.contains("OpsCenter")));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_trigger_fails_fast() -> Result<()> {
        let fx = fixture().await?;
        write(&fx.data.join("ks1/cf1/mc-1-big-Data.db"), b"data")?;

        let _held = fx.orchestrator.lock().try_acquire()?;
        let result = fx.orchestrator.take_snapshot(snapshot_time()).await;
        assert!(matches!(result, Err(BackupError::TaskAlreadyRunning(_))));
        assert!(fx.status.all().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_is_recorded() -> Result<()> {
        let fx = fixture().await?;
        let mut events = fx.orchestrator.events.subscribe();

        // No data directory at all.
        let result = fx.orchestrator.take_snapshot(snapshot_time()).await;
        assert!(result.is_err());
        assert_eq!(fx.orchestrator.state(), SnapshotState::Failed);

        let entries = fx.status.all().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, BackupStatus::Failed);
        assert_eq!(fx.remote.metrics().snapshot().snapshot_failure, 1);

        assert!(matches!(events.recv().await, Ok(BackupEvent::SnapshotStarted { .. })));
        assert!(matches!(events.recv().await, Ok(BackupEvent::SnapshotFailed { .. })));
        assert!(!fx.orchestrator.lock().is_held());
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_pass_skips_snapshot_under_generation() -> Result<()> {
        let fx = fixture().await?;
        let tag = snapshot_name(&snapshot_time());
        let component = fx.data.join("ks1/cf1/snapshots").join(&tag).join("mc-1-big-Data.db");
        write(&component, b"data")?;

        {
            let mut generating = fx.orchestrator.generating.lock().await;
            *generating = Some(tag.clone());
            // Listing waits for the tag to be published.
            let blocked = tokio::time::timeout(
                std::time::Duration::from_millis(50),
                fx.orchestrator.upload_pending(None),
            )
            .await;
            assert!(blocked.is_err());
        }

        let summary = fx.orchestrator.upload_pending(None).await?;
        assert_eq!(summary.uploaded, 0);
        assert!(component.exists());

        *fx.orchestrator.generating.lock().await = None;
        let summary = fx.orchestrator.upload_pending(None).await?;
        assert_eq!(summary.uploaded, 1);
        assert!(!component.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_manifests_are_cleaned_before_a_run() -> Result<()> {
        let fx = fixture().await?;
        write(&fx.data.join("ks1/cf1/mc-1-big-Data.db"), b"data")?;
        let stale = fx.config.meta_dir().join("meta_v2_202212310000.json.tmp");
        write(&stale, b"{\"info\":")?;

        fx.orchestrator.take_snapshot(snapshot_time()).await?;
        assert!(!stale.exists());
        Ok(())
    }
}
