//! Backup status ledger.
//!
//! A capacity-bounded list of recent backups, oldest first. Eviction is FIFO
//! by insertion, never by timestamp. The whole list is rewritten to disk on
//! every mutation (temp file, then rename).

use crate::config::MetaVersion;
use crate::path::DateRange;
use crate::utils::errors::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Day key format of [`BackupMetadata::snapshot_date`].
const SNAPSHOT_DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatus {
    Started,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: Uuid,
    pub version: MetaVersion,
    pub token: String,
    pub start: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
    pub status: BackupStatus,
    /// Remote key of the manifest once uploaded
    pub snapshot_location: Option<String>,
    pub last_validated: Option<DateTime<Utc>>,
    pub cassandra_snapshot_success: bool,
    /// `yyyyMMdd` of `start`
    pub snapshot_date: String,
}

impl BackupMetadata {
    pub fn new(version: MetaVersion, token: &str, start: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            version,
            token: token.to_string(),
            start,
            completed: None,
            status: BackupStatus::Started,
            snapshot_location: None,
            last_validated: None,
            cassandra_snapshot_success: false,
            snapshot_date: start.format(SNAPSHOT_DATE_FORMAT).to_string(),
        }
    }
}

pub struct BackupStatusLedger {
    file: PathBuf,
    capacity: usize,
    entries: Mutex<VecDeque<BackupMetadata>>,
}

impl BackupStatusLedger {
    /// Load the ledger from `file`, starting empty when it does not exist or
    /// cannot be read.
    pub async fn open(file: PathBuf, capacity: usize) -> Result<Self> {
        let mut entries: VecDeque<BackupMetadata> = match tokio::fs::read(&file).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Ignoring unreadable status file {}: {}", file.display(), e);
                    VecDeque::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(e.into()),
        };
        while entries.len() > capacity {
            entries.pop_front();
        }

        debug!("Loaded {} backup status entries from {}", entries.len(), file.display());
        Ok(Self {
            file,
            capacity,
            entries: Mutex::new(entries),
        })
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a backup that just started.
    pub async fn start(&self, metadata: &mut BackupMetadata) -> Result<()> {
        metadata.status = BackupStatus::Started;
        metadata.completed = None;
        self.upsert(metadata.clone()).await
    }

    pub async fn finish(&self, metadata: &mut BackupMetadata) -> Result<()> {
        metadata.status = BackupStatus::Finished;
        metadata.completed = Some(Utc::now());
        info!(id = %metadata.id, location = ?metadata.snapshot_location, "Backup finished");
        self.upsert(metadata.clone()).await
    }

    pub async fn failed(&self, metadata: &mut BackupMetadata) -> Result<()> {
        metadata.status = BackupStatus::Failed;
        metadata.completed = Some(Utc::now());
        warn!(id = %metadata.id, "Backup failed");
        self.upsert(metadata.clone()).await
    }

    /// Replace the stored copy of an existing entry. Returns false when the
    /// entry has already been evicted.
    pub async fn update(&self, metadata: &BackupMetadata) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let Some(slot) = entries.iter_mut().find(|e| e.id == metadata.id) else {
            return Ok(false);
        };
        *slot = metadata.clone();
        self.persist(&entries).await?;
        Ok(true)
    }

    /// Stamp every entry whose manifest is `location` as validated at `at`.
    pub async fn mark_validated(&self, location: &str, at: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        let mut count = 0;
        for entry in entries
            .iter_mut()
            .filter(|e| e.snapshot_location.as_deref() == Some(location))
        {
            entry.last_validated = Some(at);
            count += 1;
        }
        if count > 0 {
            self.persist(&entries).await?;
        }
        Ok(count)
    }

    /// Backups started on `date`, most recent first.
    pub async fn locate(&self, date: NaiveDate) -> Vec<BackupMetadata> {
        let key = date.format(SNAPSHOT_DATE_FORMAT).to_string();
        self.entries
            .lock()
            .await
            .iter()
            .rev()
            .filter(|e| e.snapshot_date == key)
            .cloned()
            .collect()
    }

    /// Most recent finished backup of `version` that started inside `range`.
    pub async fn get_latest_backup_metadata(
        &self,
        version: MetaVersion,
        range: &DateRange,
    ) -> Option<BackupMetadata> {
        self.entries
            .lock()
            .await
            .iter()
            .rev()
            .find(|e| {
                e.version == version
                    && e.status == BackupStatus::Finished
                    && range.contains(&e.start)
            })
            .cloned()
    }

    /// Most recent backup that passed verification.
    pub async fn latest_validated(&self) -> Option<BackupMetadata> {
        self.entries
            .lock()
            .await
            .iter()
            .rev()
            .find(|e| e.last_validated.is_some())
            .cloned()
    }

    /// All entries, oldest first.
    pub async fn all(&self) -> Vec<BackupMetadata> {
        self.entries.lock().await.iter().cloned().collect()
    }

    async fn upsert(&self, metadata: BackupMetadata) -> Result<()> {
        let mut entries = self.entries.lock().await;
        match entries.iter_mut().find(|e| e.id == metadata.id) {
            Some(slot) => *slot = metadata,
            None => {
                entries.push_back(metadata);
                while entries.len() > self.capacity {
                    if let Some(evicted) = entries.pop_front() {
                        debug!(id = %evicted.id, "Evicted backup status entry");
                    }
                }
            }
        }
        self.persist(&entries).await
    }

    async fn persist(&self, entries: &VecDeque<BackupMetadata>) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.file.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, &self.file).await?;
        Ok(())
    }
}
