//! Backup manifests.
//!
//! A V2 manifest is one JSON document:
//!
//! ```text
//! {"info": MetaFileInfo, "data": [ColumnFamilyResult, ...]}
//! ```
//!
//! written and read as a stream so that memory stays flat regardless of how
//! many SSTables a node holds.

pub mod proxy;
pub mod reader;
pub mod writer;

pub use proxy::MetaProxy;
pub use reader::read_meta_file;
pub use writer::MetaFileWriter;

use crate::fs::metadata::LocalFile;
use crate::path::backup_path::{format_v1_time, parse_v1_time, sstable_prefix};
use crate::path::CompressionType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const META_V2_PREFIX: &str = "meta_v2_";
pub const META_V2_SUFFIX: &str = ".json";
pub const TMP_SUFFIX: &str = ".tmp";

/// File name of the V1 manifest, a flat JSON array of remote keys.
pub const META_V1_FILE_NAME: &str = "meta.json";

/// Current manifest schema version.
pub const META_SCHEMA_VERSION: u32 = 1;

/// Canonical local and remote file name of the manifest of one snapshot.
pub fn meta_file_name(snapshot_time: &DateTime<Utc>) -> String {
    format!("{META_V2_PREFIX}{}{META_V2_SUFFIX}", format_v1_time(snapshot_time))
}

/// Snapshot instant encoded in a manifest file name, if the name is one.
pub fn parse_meta_file_name(file_name: &str) -> Option<DateTime<Utc>> {
    file_name
        .strip_prefix(META_V2_PREFIX)
        .and_then(|rest| rest.strip_suffix(META_V2_SUFFIX))
        .and_then(parse_v1_time)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaFileInfo {
    pub version: u32,
    pub app_name: String,
    pub region: String,
    pub rack: String,
    pub backup_identifier: Vec<String>,
}

impl MetaFileInfo {
    pub fn new(app_name: &str, region: &str, rack: &str, token: &str) -> Self {
        Self {
            version: META_SCHEMA_VERSION,
            app_name: app_name.to_string(),
            region: region.to_string(),
            rack: rack.to_string(),
            backup_identifier: vec![token.to_string()],
        }
    }
}

/// One SSTable component as recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadResult {
    #[serde(rename = "file")]
    pub file_name: String,

    #[serde(skip)]
    pub local_path: PathBuf,

    #[serde(skip)]
    pub keyspace: String,

    #[serde(skip)]
    pub table: String,

    #[serde(rename = "modify", with = "chrono::serde::ts_milliseconds")]
    pub last_modified: DateTime<Utc>,

    #[serde(rename = "creation", with = "chrono::serde::ts_milliseconds")]
    pub created: DateTime<Utc>,

    pub size: u64,

    pub compression: CompressionType,

    /// Already durably uploaded when the manifest was generated
    pub uploaded: bool,

    /// Remote key of the component
    #[serde(rename = "loc", default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
}

impl FileUploadResult {
    /// Describe a local file. Times are truncated to the millisecond precision
    /// the manifest keeps, so a value read back compares equal.
    pub fn new(file: &LocalFile, keyspace: &str, table: &str, compression: CompressionType) -> Self {
        Self {
            file_name: file.file_name.clone(),
            local_path: file.path.clone(),
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            last_modified: truncate_millis(file.last_modified),
            created: truncate_millis(file.created),
            size: file.size,
            compression,
            uploaded: false,
            backup_path: None,
        }
    }
}

fn truncate_millis(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(time.timestamp_millis()).unwrap_or(time)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SSTableResult {
    pub prefix: String,
    pub sstable_components: Vec<FileUploadResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnFamilyResult {
    pub keyspace_name: String,
    pub columnfamily_name: String,
    pub sstables: Vec<SSTableResult>,
}

impl ColumnFamilyResult {
    /// Group the components of one table by SSTable prefix, keeping the
    /// relative order of the components inside each group.
    pub fn from_components(keyspace: &str, table: &str, components: Vec<FileUploadResult>) -> Self {
        let mut groups: BTreeMap<String, Vec<FileUploadResult>> = BTreeMap::new();
        for component in components {
            groups
                .entry(sstable_prefix(&component.file_name).to_string())
                .or_default()
                .push(component);
        }

        Self {
            keyspace_name: keyspace.to_string(),
            columnfamily_name: table.to_string(),
            sstables: groups
                .into_iter()
                .map(|(prefix, sstable_components)| SSTableResult {
                    prefix,
                    sstable_components,
                })
                .collect(),
        }
    }

    pub fn components(&self) -> impl Iterator<Item = &FileUploadResult> {
        self.sstables.iter().flat_map(|s| s.sstable_components.iter())
    }

    pub fn component_count(&self) -> usize {
        self.sstables.iter().map(|s| s.sstable_components.len()).sum()
    }

    /// Restore the keyspace and table of every component after deserialization.
    pub(crate) fn fill_component_owners(&mut self) {
        for sstable in &mut self.sstables {
            for component in &mut sstable.sstable_components {
                component.keyspace = self.keyspace_name.clone();
                component.table = self.columnfamily_name.clone();
            }
        }
    }
}
