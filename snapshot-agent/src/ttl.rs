//! Remote retention.
//!
//! The anchor manifest describes the node at the retention boundary. It and
//! every newer manifest are retained, and every file they reference is
//! protected. Older manifests are deleted, then data files older than the
//! effective cutoff that no retained manifest references.

use crate::config::{Config, MetaVersion};
use crate::events::{BackupEvent, EventBus};
use crate::lock::TaskLock;
use crate::manifest::MetaProxy;
use crate::path::{BackupFileType, BackupPath, DateRange, RemotePathFactory};
use crate::remote::{with_retries, RemoteFileSystem};
use crate::utils::errors::Result;
use chrono::{DateTime, Duration, Utc};
use futures_util::TryStreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TtlSummary {
    /// Remote key of the anchor manifest
    pub anchor: Option<String>,
    pub manifests_deleted: usize,
    pub files_deleted: usize,
    pub files_protected: usize,
}

pub struct TtlCollector {
    proxy: MetaProxy,
    remote: Arc<RemoteFileSystem>,
    factory: RemotePathFactory,
    events: EventBus,
    retention_days: i64,
    compaction_grace: Duration,
    batch_size: usize,
    max_attempts: usize,
    lock: TaskLock,
}

impl TtlCollector {
    pub fn new(
        config: &Config,
        proxy: MetaProxy,
        remote: Arc<RemoteFileSystem>,
        factory: RemotePathFactory,
        events: EventBus,
    ) -> Self {
        Self {
            proxy,
            remote,
            factory,
            events,
            retention_days: config.ttl.retention_days,
            compaction_grace: Duration::days(config.backup.grace_period_days_for_compaction),
            batch_size: config.ttl.batch_size.max(1),
            max_attempts: config.performance.max_attempts,
            lock: TaskLock::new("ttl"),
        }
    }

    pub fn lock(&self) -> &TaskLock {
        &self.lock
    }

    /// Apply retention as of `now`.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<TtlSummary> {
        let _guard = self.lock.try_acquire()?;
        if self.retention_days == 0 {
            info!("Retention disabled, skipping TTL");
            return Ok(TtlSummary::default());
        }

        let ttl_instant = now - Duration::days(self.retention_days);
        let manifests = self.proxy.find_meta_files(&DateRange::until(now)).await?;
        let Some(anchor) = select_anchor(&manifests, ttl_instant).cloned() else {
            info!("No manifests found, nothing to expire");
            return Ok(TtlSummary::default());
        };
        let anchor_key = anchor.remote_key();
        info!(anchor = %anchor_key, ttl_instant = %ttl_instant, "Selected TTL anchor manifest");

        // Read every retained manifest before deleting anything.
        let protected = match self.proxy.version() {
            MetaVersion::V2 => {
                let retained: Vec<&BackupPath> =
                    manifests.iter().filter(|m| m.time >= anchor.time).collect();
                Some(self.protected_keys(&retained).await?)
            }
            // SST_V2 objects are only described by V2 manifests.
            MetaVersion::V1 => None,
        };

        let mut summary = TtlSummary {
            anchor: Some(anchor_key),
            ..TtlSummary::default()
        };

        let stale: Vec<String> = manifests
            .iter()
            .filter(|m| m.time < anchor.time)
            .map(BackupPath::remote_key)
            .collect();
        for batch in stale.chunks(self.batch_size) {
            self.delete_batch(batch).await?;
            summary.manifests_deleted += batch.len();
        }

        match protected {
            Some(protected) => {
                let cutoff = (ttl_instant - self.compaction_grace).min(anchor.time);
                self.expire_files(cutoff, &protected, &mut summary).await?;
            }
            None => info!("Legacy manifests in use, skipping SST_V2 expiry"),
        }

        info!(
            manifests_deleted = summary.manifests_deleted,
            files_deleted = summary.files_deleted,
            files_protected = summary.files_protected,
            "TTL finished"
        );
        self.remote
            .metrics()
            .record_ttl_deleted((summary.manifests_deleted + summary.files_deleted) as u64);
        self.events.publish(BackupEvent::TtlCompleted {
            manifests_deleted: summary.manifests_deleted,
            files_deleted: summary.files_deleted,
        });
        Ok(summary)
    }

    /// Union of the keys referenced by `manifests`. Any unreadable manifest
    /// aborts the run.
    async fn protected_keys(&self, manifests: &[&BackupPath]) -> Result<HashSet<String>> {
        let mut protected = HashSet::new();
        for manifest in manifests {
            let local = self.proxy.download_meta_file(manifest).await?;
            let keys = self.proxy.referenced_keys(&local).await;
            self.proxy.discard(&local).await;
            protected.extend(keys?);
        }
        debug!("{} manifests protect {} files", manifests.len(), protected.len());
        Ok(protected)
    }

    async fn expire_files(
        &self,
        cutoff: DateTime<Utc>,
        protected: &HashSet<String>,
        summary: &mut TtlSummary,
    ) -> Result<()> {
        let prefix = self.factory.sst_v2_prefix();
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut listing = self.remote.list(&prefix, None);

        while let Some(object) = listing.try_next().await? {
            let path = match self.factory.parse(&object.key) {
                Ok(path) if path.file_type == BackupFileType::SstV2 => path,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping unparsable remote key {}: {}", object.key, e);
                    continue;
                }
            };
            // Keys sort by their time segment.
            if path.time >= cutoff {
                debug!("Reached {} at or after cutoff {}", object.key, cutoff);
                break;
            }
            if protected.contains(&object.key) {
                summary.files_protected += 1;
                continue;
            }

            batch.push(object.key);
            if batch.len() >= self.batch_size {
                self.delete_batch(&batch).await?;
                summary.files_deleted += batch.len();
                batch.clear();
            }
        }
        drop(listing);

        if !batch.is_empty() {
            self.delete_batch(&batch).await?;
            summary.files_deleted += batch.len();
        }
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<()> {
        let label = keys.first().map(String::as_str).unwrap_or_default();
        debug!("Deleting {} remote objects starting at {}", keys.len(), label);
        with_retries(label, self.max_attempts, || self.remote.delete(keys)).await
    }
}

/// The newest manifest at or before `ttl_instant`, else the oldest one after it.
/// `manifests` is newest first.
fn select_anchor(manifests: &[BackupPath], ttl_instant: DateTime<Utc>) -> Option<&BackupPath> {
    manifests
        .iter()
        .find(|m| m.time <= ttl_instant)
        .or_else(|| manifests.last())
}
