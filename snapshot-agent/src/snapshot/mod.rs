//! The database's "take a snapshot by name" capability.
//!
//! A snapshot named `tag` leaves `<table>/snapshots/<tag>/` directories
//! holding hard links of every live component of each table.

pub mod hardlink;
pub mod nodetool;

pub use hardlink::HardLinkSnapshotter;
pub use nodetool::NodetoolSnapshotter;

use crate::config::{Config, SnapshotMethod};
use crate::fs::scanner::TableDir;
use crate::utils::errors::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait SnapshotTaker: Send + Sync {
    /// Snapshot the given tables under `name`.
    async fn take_snapshot(&self, name: &str, tables: &[TableDir]) -> Result<()>;

    /// Remove the snapshot `name` from the given tables.
    async fn clear_snapshot(&self, name: &str, tables: &[TableDir]) -> Result<()>;
}

pub fn from_config(config: &Config) -> Arc<dyn SnapshotTaker> {
    match config.backup.snapshot_method {
        SnapshotMethod::Hardlink => Arc::new(HardLinkSnapshotter),
        SnapshotMethod::Nodetool => Arc::new(NodetoolSnapshotter::new(config.backup.nodetool_path.clone())),
    }
}
