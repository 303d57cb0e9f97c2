//! Snapshots requested from the running database through `nodetool`.

use crate::fs::scanner::TableDir;
use crate::snapshot::SnapshotTaker;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct NodetoolSnapshotter {
    nodetool: PathBuf,
}

impl NodetoolSnapshotter {
    pub fn new(nodetool: PathBuf) -> Self {
        Self { nodetool }
    }

    /// `nodetool <command> -t <name> <keyspace>...`, limited to the keyspaces
    /// that survived filtering.
    fn command(&self, command: &str, name: &str, tables: &[TableDir]) -> Command {
        let keyspaces: BTreeSet<&str> = tables.iter().map(|t| t.keyspace.as_str()).collect();
        let mut cmd = Command::new(&self.nodetool);
        cmd.arg(command).arg("-t").arg(name);
        cmd.args(keyspaces);
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<()> {
        debug!("Running {:?}", cmd);
        let output = cmd
            .output()
            .await
            .map_err(|e| BackupError::Snapshot(format!("failed to run {}: {}", self.nodetool.display(), e)))?;
        if !output.status.success() {
            return Err(BackupError::Snapshot(format!(
                "{} exited with {}: {}",
                self.nodetool.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotTaker for NodetoolSnapshotter {
    async fn take_snapshot(&self, name: &str, tables: &[TableDir]) -> Result<()> {
        if tables.is_empty() {
            info!("No tables to snapshot");
            return Ok(());
        }
        self.run(self.command("snapshot", name, tables)).await?;
        info!("Database snapshot {} taken", name);
        Ok(())
    }

    async fn clear_snapshot(&self, name: &str, tables: &[TableDir]) -> Result<()> {
        if tables.is_empty() {
            return Ok(());
        }
        self.run(self.command("clearsnapshot", name, tables)).await
    }
}
