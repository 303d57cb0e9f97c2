//! Process-wide backup counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BackupMetrics {
    upload_valid: AtomicU64,
    upload_failure: AtomicU64,
    bytes_uploaded: AtomicU64,
    download_valid: AtomicU64,
    download_failure: AtomicU64,
    bytes_downloaded: AtomicU64,
    snapshot_success: AtomicU64,
    snapshot_failure: AtomicU64,
    verification_failure: AtomicU64,
    ttl_deleted: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub upload_valid: u64,
    pub upload_failure: u64,
    pub bytes_uploaded: u64,
    pub download_valid: u64,
    pub download_failure: u64,
    pub bytes_downloaded: u64,
    pub snapshot_success: u64,
    pub snapshot_failure: u64,
    pub verification_failure: u64,
    pub ttl_deleted: u64,
}

impl BackupMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_upload(&self, bytes: u64) {
        self.upload_valid.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_upload_failure(&self) {
        self.upload_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: u64) {
        self.download_valid.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_download_failure(&self) {
        self.download_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self, success: bool) {
        if success {
            self.snapshot_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.snapshot_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_verification_failure(&self) {
        self.verification_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ttl_deleted(&self, count: u64) {
        self.ttl_deleted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            upload_valid: self.upload_valid.load(Ordering::Relaxed),
            upload_failure: self.upload_failure.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            download_valid: self.download_valid.load(Ordering::Relaxed),
            download_failure: self.download_failure.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            snapshot_success: self.snapshot_success.load(Ordering::Relaxed),
            snapshot_failure: self.snapshot_failure.load(Ordering::Relaxed),
            verification_failure: self.verification_failure.load(Ordering::Relaxed),
            ttl_deleted: self.ttl_deleted.load(Ordering::Relaxed),
        }
    }
}
