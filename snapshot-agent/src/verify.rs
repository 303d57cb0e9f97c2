//! Backup verification.
//!
//! A manifest is valid when every remote file it references exists. A window
//! check walks manifests newest first and stops at the first valid one.

use crate::events::{BackupEvent, EventBus};
use crate::lock::TaskLock;
use crate::manifest::MetaProxy;
use crate::metrics::BackupMetrics;
use crate::path::{BackupPath, DateRange};
use crate::status::BackupStatusLedger;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupVerificationResult {
    pub valid: bool,
    /// Remote key of the manifest checked, if any was found
    pub manifest: Option<String>,
    pub snapshot_time: Option<DateTime<Utc>>,
    pub files_checked: usize,
    pub missing: Vec<String>,
}

pub struct VerificationEngine {
    proxy: MetaProxy,
    status: Arc<BackupStatusLedger>,
    events: EventBus,
    metrics: Arc<BackupMetrics>,
    slo_hours: i64,
    lock: TaskLock,
}

impl VerificationEngine {
    pub fn new(
        proxy: MetaProxy,
        status: Arc<BackupStatusLedger>,
        events: EventBus,
        metrics: Arc<BackupMetrics>,
        slo_hours: i64,
    ) -> Self {
        Self {
            proxy,
            status,
            events,
            metrics,
            slo_hours,
            lock: TaskLock::new("verification"),
        }
    }

    pub fn lock(&self) -> &TaskLock {
        &self.lock
    }

    /// Check one remote manifest.
    pub async fn verify_manifest(&self, path: &BackupPath) -> Result<BackupVerificationResult> {
        self.proxy.is_meta_file_valid(path).await
    }

    /// Verify the backups of the last SLO window ending at `now`.
    pub async fn verify_latest(&self, now: DateTime<Utc>) -> Result<BackupVerificationResult> {
        self.verify_backup_window(&DateRange::ending_at(now, Duration::hours(self.slo_hours)))
            .await
    }

    /// Find the newest manifest in `range` that verifies.
    ///
    /// An invalid result names the newest manifest checked and what it is
    /// missing. Manifests that cannot be read are skipped; if none could be
    /// read the last error is returned.
    pub async fn verify_backup_window(&self, range: &DateRange) -> Result<BackupVerificationResult> {
        let _guard = self.lock.try_acquire()?;

        let manifests = self.proxy.find_meta_files(range).await?;
        if manifests.is_empty() {
            warn!("No manifest found between {} and {}", range.start, range.end);
        }

        let mut first_invalid: Option<BackupVerificationResult> = None;
        let mut last_error: Option<BackupError> = None;
        for path in &manifests {
            match self.verify_manifest(path).await {
                Ok(result) if result.valid => {
                    let key = path.remote_key();
                    let updated = self.status.mark_validated(&key, Utc::now()).await?;
                    info!(
                        manifest = %key,
                        files = result.files_checked,
                        ledger_entries = updated,
                        "Backup verified"
                    );
                    self.events.publish(BackupEvent::VerificationSucceeded { manifest: key });
                    return Ok(result);
                }
                Ok(result) => {
                    warn!(
                        "Manifest {} references {} missing files",
                        path.remote_key(),
                        result.missing.len()
                    );
                    first_invalid.get_or_insert(result);
                }
                Err(e) => {
                    warn!("Could not verify {}: {}", path.remote_key(), e);
                    last_error = Some(e);
                }
            }
        }

        self.metrics.record_verification_failure();
        let result = match (first_invalid, last_error) {
            (Some(result), _) => result,
            (None, Some(e)) => {
                self.events.publish(BackupEvent::VerificationFailed {
                    manifest: None,
                    missing: Vec::new(),
                });
                return Err(e);
            }
            (None, None) => BackupVerificationResult::default(),
        };
        self.events.publish(BackupEvent::VerificationFailed {
            manifest: result.manifest.clone(),
            missing: result.missing.clone(),
        });
        Ok(result)
    }
}
