//! Directory traversal of the database data directory.
//!
//! Layout: `<data_dir>/<keyspace>/<table>[-<id>]/snapshots/<tag>/<component>`
//! and `<data_dir>/<keyspace>/<table>[-<id>]/backups/<component>` for
//! incremental backups. Filtered keyspace and table directories are never
//! descended into.

use crate::config::CompressionPolicy;
use crate::fs::filter::ColumnFamilyFilter;
use crate::fs::metadata::LocalFile;
use crate::path::backup_path::sstable_prefix;
use crate::path::{BackupFileType, CompressionType};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const INCREMENTAL_DIR: &str = "backups";

/// One `<keyspace>/<table>` directory that passed the filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDir {
    pub keyspace: String,
    pub table: String,
    pub path: PathBuf,
}

impl TableDir {
    pub fn snapshot_dir(&self, tag: &str) -> PathBuf {
        self.path.join(SNAPSHOTS_DIR).join(tag)
    }

    pub fn incremental_dir(&self) -> PathBuf {
        self.path.join(INCREMENTAL_DIR)
    }

    /// Snapshot tags present under this table, sorted.
    pub fn snapshot_tags(&self) -> std::io::Result<Vec<String>> {
        let root = self.path.join(SNAPSHOTS_DIR);
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut tags: Vec<String> = std::fs::read_dir(root)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        tags.sort();
        Ok(tags)
    }
}

/// Walks the data directory applying keyspace/table filters.
#[derive(Debug, Clone)]
pub struct SnapshotScanner {
    data_dir: PathBuf,
    filter: ColumnFamilyFilter,
}

impl SnapshotScanner {
    pub fn new(data_dir: PathBuf, filter: ColumnFamilyFilter) -> Self {
        Self { data_dir, filter }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Every table directory that passes the filters, sorted by keyspace then table.
    pub fn table_dirs(&self) -> std::io::Result<Vec<TableDir>> {
        if !self.data_dir.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("data directory {} does not exist", self.data_dir.display()),
            ));
        }

        let filter = &self.filter;
        let walker = WalkDir::new(&self.data_dir)
            .min_depth(1)
            .max_depth(2)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if !entry.file_type().is_dir() {
                    return false;
                }
                let name = entry.file_name().to_string_lossy();
                match entry.depth() {
                    1 => {
                        let skip = filter.is_keyspace_filtered(&name);
                        if skip {
                            debug!("Skipping filtered keyspace {}", name);
                        }
                        !skip
                    }
                    2 => {
                        let keyspace = entry
                            .path()
                            .parent()
                            .and_then(|p| p.file_name())
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_default();
                        let skip = filter.is_table_filtered(&keyspace, table_name(&name));
                        if skip {
                            debug!("Skipping filtered table {}.{}", keyspace, name);
                        }
                        !skip
                    }
                    _ => true,
                }
            });

        let mut tables = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", self.data_dir.display(), e);
                    continue;
                }
            };
            if entry.depth() != 2 {
                continue;
            }
            let keyspace = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let dir_name = entry.file_name().to_string_lossy().to_string();
            tables.push(TableDir {
                keyspace,
                table: table_name(&dir_name).to_string(),
                path: entry.path().to_path_buf(),
            });
        }

        Ok(tables)
    }
}

/// Strip the `-<32 hex id>` suffix the database appends to table directories.
pub fn table_name(dir_name: &str) -> &str {
    match dir_name.rsplit_once('-') {
        Some((name, id))
            if !name.is_empty() && id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()) =>
        {
            name
        }
        _ => dir_name,
    }
}

/// Regular files directly inside `dir`, with every `-Data.db` component placed
/// after all other components.
pub fn list_files(dir: &Path) -> std::io::Result<Vec<LocalFile>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        match LocalFile::from_path(&entry.path()) {
            Ok(file) => files.push(file),
            Err(e) => warn!("Skipping {}: {}", entry.path().display(), e),
        }
    }

    files.sort_by(|a, b| {
        a.is_data_file()
            .cmp(&b.is_data_file())
            .then_with(|| a.file_name.cmp(&b.file_name))
    });
    Ok(files)
}

/// Compression to use when uploading one file. Order of checks matters.
pub fn decide_compression(
    policy: CompressionPolicy,
    file_type: BackupFileType,
    last_modified: DateTime<Utc>,
    transition_epoch_millis: i64,
    has_compression_info: bool,
) -> CompressionType {
    if !file_type.is_v2() || last_modified.timestamp_millis() < transition_epoch_millis {
        return CompressionType::Snappy;
    }
    match policy {
        CompressionPolicy::None => CompressionType::None,
        CompressionPolicy::All => CompressionType::Snappy,
        CompressionPolicy::IfRequired => {
            if has_compression_info {
                CompressionType::None
            } else {
                CompressionType::Snappy
            }
        }
    }
}

/// Whether the database already compressed this component's SSTable.
pub fn has_compression_info(dir: &Path, file_name: &str) -> bool {
    dir.join(format!("{}-CompressionInfo.db", sstable_prefix(file_name)))
        .exists()
}
