//! Local record of component versions already durably uploaded.
//!
//! One small JSON file per component at `<dir>/<keyspace>/<table>/<file>.json`.
//! A version is identified by (file name, compression, last-modified); a
//! record for any other version does not count. Records are written to a
//! unique temporary file and renamed into place.

use crate::manifest::FileUploadResult;
use crate::path::CompressionType;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct UploadRecord {
    file: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    modify: DateTime<Utc>,
    compression: CompressionType,
    loc: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UploadedFilesLedger {
    dir: PathBuf,
}

impl UploadedFilesLedger {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, file: &FileUploadResult) -> PathBuf {
        self.dir
            .join(&file.keyspace)
            .join(&file.table)
            .join(format!("{}.json", file.file_name))
    }

    /// Whether this exact version of the component has been uploaded.
    pub async fn is_uploaded(&self, file: &FileUploadResult) -> bool {
        let Ok(bytes) = tokio::fs::read(self.record_path(file)).await else {
            return false;
        };
        match serde_json::from_slice::<UploadRecord>(&bytes) {
            Ok(record) => {
                record.file == file.file_name
                    && record.compression == file.compression
                    && record.modify == file.last_modified
            }
            Err(e) => {
                debug!("Ignoring unreadable upload record for {}: {}", file.file_name, e);
                false
            }
        }
    }

    /// Remember that this version of the component now lives at `remote_key`.
    pub async fn record(&self, file: &FileUploadResult, remote_key: &str) -> Result<()> {
        let path = self.record_path(file);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let record = UploadRecord {
            file: file.file_name.clone(),
            modify: file.last_modified,
            compression: file.compression,
            loc: remote_key.to_string(),
            uploaded_at: Utc::now(),
        };
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec(&record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn component(compression: CompressionType, modified: DateTime<Utc>) -> FileUploadResult {
        FileUploadResult {
            file_name: "mc-1-big-Data.db".to_string(),
            local_path: PathBuf::new(),
            keyspace: "ks1".to_string(),
            table: "cf1".to_string(),
            last_modified: modified,
            created: modified,
            size: 4,
            compression,
            uploaded: false,
            backup_path: None,
        }
    }

    #[tokio::test]
    async fn test_only_the_recorded_version_counts() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let ledger = UploadedFilesLedger::new(temp_dir.path().to_path_buf());
        let modified = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let file = component(CompressionType::Snappy, modified);

        assert!(!ledger.is_uploaded(&file).await);
        ledger.record(&file, "backups/k").await?;
        assert!(ledger.is_uploaded(&file).await);

        assert!(!ledger.is_uploaded(&component(CompressionType::None, modified)).await);
        assert!(
            !ledger
                .is_uploaded(&component(CompressionType::Snappy, modified + Duration::seconds(1)))
                .await
        );

        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path().join("ks1/cf1"))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }
}
