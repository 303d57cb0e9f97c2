//! File metadata captured when a component is discovered on disk.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

/// A regular file found under a table directory.
#[derive(Debug, Clone)]
pub struct LocalFile {
    /// Full path to the file
    pub path: PathBuf,

    pub file_name: String,

    /// File size in bytes
    pub size: u64,

    pub last_modified: DateTime<Utc>,

    /// Creation time where the platform reports one, otherwise last-modified
    pub created: DateTime<Utc>,
}

impl LocalFile {
    /// Extract metadata from a file path
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let last_modified: DateTime<Utc> = metadata.modified()?.into();
        let created = metadata
            .created()
            .map(DateTime::<Utc>::from)
            .unwrap_or(last_modified);

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Self {
            path: path.to_path_buf(),
            file_name,
            size: metadata.len(),
            last_modified,
            created,
        })
    }

    pub fn is_data_file(&self) -> bool {
        is_data_file(&self.file_name)
    }
}

/// SSTable data components, uploaded after their siblings.
pub fn is_data_file(file_name: &str) -> bool {
    file_name.ends_with("-Data.db")
}
