//! Streaming manifest writer.
//!
//! The document is written to `<name>.tmp` and renamed into place by
//! [`MetaFileWriter::finish`]. A writer that is dropped before finishing
//! leaves only the temporary file behind, which readers never accept.

use crate::manifest::{
    meta_file_name, ColumnFamilyResult, MetaFileInfo, META_V2_PREFIX, TMP_SUFFIX,
};
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

pub struct MetaFileWriter {
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
    snapshot_time: DateTime<Utc>,
    column_families: usize,
    components: usize,
}

impl MetaFileWriter {
    /// Open the manifest of the snapshot taken at `snapshot_time` and write its header.
    pub async fn start(
        meta_dir: &Path,
        info: &MetaFileInfo,
        snapshot_time: DateTime<Utc>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(meta_dir).await?;
        let final_path = meta_dir.join(meta_file_name(&snapshot_time));
        let tmp_path = meta_dir.join(format!("{}{TMP_SUFFIX}", meta_file_name(&snapshot_time)));

        let mut writer = BufWriter::new(File::create(&tmp_path).await?);
        writer.write_all(b"{\"info\":").await?;
        writer.write_all(&serde_json::to_vec(info)?).await?;
        writer.write_all(b",\"data\":[").await?;

        debug!("Started manifest {}", tmp_path.display());
        Ok(Self {
            tmp_path,
            final_path,
            writer,
            snapshot_time,
            column_families: 0,
            components: 0,
        })
    }

    /// Append one table to the `data` array.
    pub async fn add_column_family(&mut self, cf: &ColumnFamilyResult) -> Result<()> {
        if self.column_families > 0 {
            self.writer.write_all(b",").await?;
        }
        self.writer.write_all(&serde_json::to_vec(cf)?).await?;
        self.column_families += 1;
        self.components += cf.component_count();
        Ok(())
    }

    pub fn component_count(&self) -> usize {
        self.components
    }

    /// Close the document, rename it to its final name and stamp it with the
    /// snapshot instant. Returns the final path.
    pub async fn finish(mut self) -> Result<PathBuf> {
        self.writer.write_all(b"]}").await?;
        self.writer.flush().await?;
        let file = self.writer.into_inner();
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&self.tmp_path, &self.final_path).await?;

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.final_path)
            .await?
            .into_std()
            .await;
        let modified = SystemTime::from(self.snapshot_time);
        tokio::task::spawn_blocking(move || file.set_modified(modified)).await??;

        info!(
            "Manifest {} written with {} tables and {} components",
            self.final_path.display(),
            self.column_families,
            self.components
        );
        Ok(self.final_path)
    }
}

/// Remove every local manifest artifact (finished or temporary) from `meta_dir`.
pub async fn cleanup_old(meta_dir: &Path) -> Result<usize> {
    if !tokio::fs::try_exists(meta_dir).await? {
        return Ok(0);
    }

    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(meta_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(META_V2_PREFIX) || !entry.file_type().await?.is_file() {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove stale manifest {}: {}", name, e),
        }
    }

    if removed > 0 {
        info!("Removed {} stale manifest files from {}", removed, meta_dir.display());
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::reader::read_meta_file;
    use crate::manifest::FileUploadResult;
    use crate::path::CompressionType;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn cf(keyspace: &str, table: &str, files: &[&str]) -> ColumnFamilyResult {
        let time = Utc.with_ymd_and_hms(2022, 12, 31, 0, 0, 0).unwrap();
        ColumnFamilyResult::from_components(
            keyspace,
            table,
            files
                .iter()
                .map(|name| FileUploadResult {
                    file_name: name.to_string(),
                    local_path: PathBuf::new(),
                    keyspace: keyspace.to_string(),
                    table: table.to_string(),
                    last_modified: time,
                    created: time,
                    size: 1,
                    compression: CompressionType::None,
                    uploaded: false,
                    backup_path: Some(format!("k/{name}")),
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_finish_renames_and_stamps_mtime() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let snapshot_time = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let info = MetaFileInfo::new("cass_test", "us-east-1", "rack1", "1");

        let mut writer = MetaFileWriter::start(temp_dir.path(), &info, snapshot_time).await?;
        writer.add_column_family(&cf("ks1", "cf1", &["a-1-Index.db", "a-1-Data.db"])).await?;
        writer.add_column_family(&cf("ks2", "cf2", &["b-1-Data.db"])).await?;
        assert_eq!(writer.component_count(), 3);
        let path = writer.finish().await?;

        assert_eq!(path.file_name().unwrap(), "meta_v2_202301010000.json");
        assert!(!temp_dir.path().join("meta_v2_202301010000.json.tmp").exists());
        let modified: DateTime<Utc> = std::fs::metadata(&path)?.modified()?.into();
        assert_eq!(modified, snapshot_time);

        let mut tables = Vec::new();
        let read_info = read_meta_file(&path, |cf| tables.push(cf))?;
        assert_eq!(read_info, info);
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].keyspace_name, "ks1");
        assert_eq!(tables[0].component_count(), 2);
        assert_eq!(tables[1].sstables[0].sstable_components[0].table, "cf2");
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_manifest_is_valid_json() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let info = MetaFileInfo::new("cass_test", "us-east-1", "rack1", "1");
        let path = MetaFileWriter::start(temp_dir.path(), &info, Utc::now())
            .await?
            .finish()
            .await?;
        let value: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)?;
        assert_eq!(value["data"], serde_json::json!([]));
        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_writer_leaves_only_tmp_and_cleanup_removes_it() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let info = MetaFileInfo::new("cass_test", "us-east-1", "rack1", "1");
        let snapshot_time = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        {
            let mut writer = MetaFileWriter::start(temp_dir.path(), &info, snapshot_time).await?;
            writer.add_column_family(&cf("ks1", "cf1", &["a-1-Data.db"])).await?;
        }
        std::fs::write(temp_dir.path().join("meta_v2_202212310000.json"), b"{}")?;
        std::fs::write(temp_dir.path().join("unrelated.txt"), b"x")?;

        assert!(!temp_dir.path().join("meta_v2_202301010000.json").exists());
        assert!(temp_dir.path().join("meta_v2_202301010000.json.tmp").exists());

        assert_eq!(cleanup_old(temp_dir.path()).await?, 2);
        assert!(temp_dir.path().join("unrelated.txt").exists());
        assert_eq!(cleanup_old(&temp_dir.path().join("missing")).await?, 0);
        Ok(())
    }
}
