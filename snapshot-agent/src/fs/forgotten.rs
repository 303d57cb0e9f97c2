//! Quarantine of table files that no snapshot references.
//!
//! Compaction can leave stale SSTables behind. A live file older than the
//! snapshot minus the compaction grace period, and absent from the snapshot,
//! is first symlinked into `<table>/lost+found`. If it is still unreferenced
//! once the symlink is older than the forgotten-file grace period, the file is
//! moved into `lost+found`. Nothing is ever deleted here.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const LOST_AND_FOUND: &str = "lost+found";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ForgottenFilesSummary {
    /// Newly symlinked into lost+found
    pub flagged: usize,
    /// Symlinks removed because the file showed up in a snapshot again
    pub released: usize,
    /// Files moved into lost+found
    pub relocated: usize,
}

#[derive(Debug, Clone)]
pub struct ForgottenFilesManager {
    compaction_grace: Duration,
    forgotten_grace: Duration,
}

impl ForgottenFilesManager {
    pub fn new(compaction_grace: Duration, forgotten_grace: Duration) -> Self {
        Self {
            compaction_grace,
            forgotten_grace,
        }
    }

    /// Reconcile one live table directory against the file names of a
    /// snapshot taken at `snapshot_time`.
    pub fn reconcile(
        &self,
        table_dir: &Path,
        snapshot_files: &HashSet<String>,
        snapshot_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> std::io::Result<ForgottenFilesSummary> {
        let mut summary = ForgottenFilesSummary::default();
        let lost_dir = table_dir.join(LOST_AND_FOUND);

        // Second phase first, so files flagged in this pass wait a full grace period.
        if lost_dir.is_dir() {
            let relocate_before = now - self.forgotten_grace;
            for entry in fs::read_dir(&lost_dir)? {
                let entry = entry?;
                let link_meta = fs::symlink_metadata(entry.path())?;
                if !link_meta.file_type().is_symlink() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let live_path = table_dir.join(&name);

                if snapshot_files.contains(&name) {
                    fs::remove_file(entry.path())?;
                    summary.released += 1;
                    continue;
                }

                let flagged_at: DateTime<Utc> = link_meta.modified()?.into();
                if flagged_at > relocate_before {
                    continue;
                }

                fs::remove_file(entry.path())?;
                if live_path.is_file() {
                    fs::rename(&live_path, lost_dir.join(&name))?;
                    warn!("Moved forgotten file {} into {}", live_path.display(), lost_dir.display());
                    summary.relocated += 1;
                }
            }
        }

        let flag_before = snapshot_time - self.compaction_grace;
        for entry in fs::read_dir(table_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if snapshot_files.contains(&name) {
                continue;
            }
            let modified: DateTime<Utc> = entry.metadata()?.modified()?.into();
            if modified >= flag_before {
                continue;
            }
            let link = lost_dir.join(&name);
            if fs::symlink_metadata(&link).is_ok() {
                continue;
            }
            fs::create_dir_all(&lost_dir)?;
            std::os::unix::fs::symlink(entry.path(), &link)?;
            summary.flagged += 1;
        }

        if summary != ForgottenFilesSummary::default() {
            info!(
                table_dir = %table_dir.display(),
                flagged = summary.flagged,
                released = summary.released,
                relocated = summary.relocated,
                "Forgotten files reconciled"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn write_aged(path: &Path, age: Duration) -> std::io::Result<()> {
        fs::write(path, b"sstable")?;
        let file = fs::File::options().write(true).open(path)?;
        let modified = SystemTime::now() - age.to_std().unwrap_or_default();
        file.set_modified(modified)?;
        Ok(())
    }

    #[test]
    fn test_flag_then_relocate() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let table = temp_dir.path();
        write_aged(&table.join("mc-1-big-Data.db"), Duration::days(10))?;
        write_aged(&table.join("mc-2-big-Data.db"), Duration::days(10))?;

        let snapshot: HashSet<String> = ["mc-2-big-Data.db".to_string()].into();
        let manager = ForgottenFilesManager::new(Duration::days(1), Duration::zero());
        let now = Utc::now();

        let first = manager.reconcile(table, &snapshot, now, now)?;
        assert_eq!(first.flagged, 1);
        assert_eq!(first.relocated, 0);
        assert!(fs::symlink_metadata(table.join(LOST_AND_FOUND).join("mc-1-big-Data.db"))?
            .file_type()
            .is_symlink());
        assert!(table.join("mc-1-big-Data.db").exists());

        let later = now + Duration::minutes(1);
        let second = manager.reconcile(table, &snapshot, later, later)?;
        assert_eq!(second.relocated, 1);
        assert!(!table.join("mc-1-big-Data.db").exists());
        let moved = table.join(LOST_AND_FOUND).join("mc-1-big-Data.db");
        assert!(fs::symlink_metadata(&moved)?.file_type().is_file());
        assert!(table.join("mc-2-big-Data.db").exists());
        Ok(())
    }

    #[test]
    fn test_recent_files_are_not_flagged() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let table = temp_dir.path();
        write_aged(&table.join("mc-3-big-Data.db"), Duration::hours(1))?;

        let manager = ForgottenFilesManager::new(Duration::days(5), Duration::days(3));
        let now = Utc::now();
        let summary = manager.reconcile(table, &HashSet::new(), now, now)?;
        assert_eq!(summary, ForgottenFilesSummary::default());
        assert!(!table.join(LOST_AND_FOUND).exists());
        Ok(())
    }

    #[test]
    fn test_referenced_again_releases_symlink() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let table = temp_dir.path();
        write_aged(&table.join("mc-4-big-Data.db"), Duration::days(10))?;

        let manager = ForgottenFilesManager::new(Duration::days(1), Duration::days(3));
        let now = Utc::now();
        manager.reconcile(table, &HashSet::new(), now, now)?;

        let snapshot: HashSet<String> = ["mc-4-big-Data.db".to_string()].into();
        let summary = manager.reconcile(table, &snapshot, now, now)?;
        assert_eq!(summary.released, 1);
        assert!(fs::symlink_metadata(table.join(LOST_AND_FOUND).join("mc-4-big-Data.db")).is_err());
        assert!(table.join("mc-4-big-Data.db").is_file());
        Ok(())
    }
}
