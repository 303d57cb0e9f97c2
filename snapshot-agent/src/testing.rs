//! Fixtures shared by tests that need a populated remote store.

use crate::config::MetaVersion;
use crate::events::EventBus;
use crate::fs::metadata::LocalFile;
use crate::manifest::{meta_file_name, ColumnFamilyResult, FileUploadResult, MetaFileInfo, MetaFileWriter, MetaProxy};
use crate::metrics::BackupMetrics;
use crate::path::{BackupPath, CompressionType, RemotePathFactory};
use crate::remote::{LocalObjectStore, RemoteFileSystem};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tempfile::TempDir;

pub(crate) struct RemoteFixture {
    pub temp_dir: TempDir,
    pub remote: Arc<RemoteFileSystem>,
    pub metrics: Arc<BackupMetrics>,
    pub events: EventBus,
    pub factory: RemotePathFactory,
}

impl RemoteFixture {
    pub fn new() -> std::io::Result<Self> {
        let temp_dir = TempDir::new()?;
        let metrics = Arc::new(BackupMetrics::new());
        let events = EventBus::new();
        let remote = Arc::new(RemoteFileSystem::new(
            Arc::new(LocalObjectStore::new(temp_dir.path().join("bucket"))),
            events.clone(),
            metrics.clone(),
            temp_dir.path().join("scratch"),
        ));
        Ok(Self {
            temp_dir,
            remote,
            metrics,
            events,
            factory: RemotePathFactory::new("backups", "cass_test", "us-east-1", "1808575600"),
        })
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.temp_dir.path().join("state/meta")
    }

    pub fn proxy(&self) -> MetaProxy {
        MetaProxy::new(
            MetaVersion::V2,
            self.remote.clone(),
            self.factory.clone(),
            self.meta_dir(),
            2,
        )
    }

    /// Upload a component last modified at `modified` and describe it the way
    /// a manifest would.
    pub async fn upload_component(
        &self,
        keyspace: &str,
        table: &str,
        name: &str,
        modified: DateTime<Utc>,
    ) -> Result<FileUploadResult> {
        let dir = self.temp_dir.path().join("source").join(keyspace).join(table);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        std::fs::write(&path, format!("{keyspace}/{table}/{name}"))?;
        std::fs::File::options()
            .write(true)
            .open(&path)?
            .set_modified(SystemTime::from(modified))?;

        let local = LocalFile::from_path(&path)?;
        let mut file = FileUploadResult::new(&local, keyspace, table, CompressionType::Snappy);
        let mut remote_path = self.factory.sst_v2(keyspace, table, name, file.last_modified);
        remote_path.size = file.size;
        file.backup_path = Some(remote_path.remote_key());
        self.remote.upload(&remote_path, &path).await?;
        std::fs::remove_file(&path)?;
        Ok(file)
    }

    /// Write and upload the manifest of a snapshot taken at `time`.
    pub async fn publish_manifest(
        &self,
        time: DateTime<Utc>,
        components: &[FileUploadResult],
    ) -> Result<BackupPath> {
        let mut tables: BTreeMap<(String, String), Vec<FileUploadResult>> = BTreeMap::new();
        for file in components {
            tables
                .entry((file.keyspace.clone(), file.table.clone()))
                .or_default()
                .push(file.clone());
        }

        let build_dir = self.temp_dir.path().join("build-meta");
        let info = MetaFileInfo::new("cass_test", "us-east-1", "rack1", self.factory.token());
        let mut writer = MetaFileWriter::start(&build_dir, &info, time).await?;
        for ((keyspace, table), files) in tables {
            writer
                .add_column_family(&ColumnFamilyResult::from_components(&keyspace, &table, files))
                .await?;
        }
        let local = writer.finish().await?;

        let path = self.factory.meta_v2(&meta_file_name(&time), time);
        self.remote.upload(&path, &local).await?;
        std::fs::remove_file(&local)?;
        Ok(path)
    }
}
