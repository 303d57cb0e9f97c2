//! Backup artifact identity: remote key codec and date ranges.

pub mod backup_path;
pub mod date_range;

pub use backup_path::{BackupFileType, BackupPath, CompressionType};
pub use date_range::DateRange;

use crate::config::Config;
use chrono::{DateTime, Utc};

/// Builds [`BackupPath`]s and listing prefixes for this node.
#[derive(Debug, Clone)]
pub struct RemotePathFactory {
    prefix: String,
    cluster: String,
    region: String,
    token: String,
}

impl RemotePathFactory {
    pub fn new(prefix: &str, cluster: &str, region: &str, token: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            cluster: cluster.to_string(),
            region: region.to_string(),
            token: token.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.remote.backup_prefix,
            &config.node.cluster_name,
            &config.node.region,
            &config.node.token,
        )
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Decode a key written under this factory's prefix.
    pub fn parse(&self, key: &str) -> crate::Result<BackupPath> {
        BackupPath::parse(key, &self.prefix)
    }

    pub fn create(
        &self,
        file_type: BackupFileType,
        keyspace: Option<&str>,
        table: Option<&str>,
        file_name: &str,
        time: DateTime<Utc>,
    ) -> BackupPath {
        BackupPath {
            file_type,
            prefix: self.prefix.clone(),
            cluster: self.cluster.clone(),
            region: self.region.clone(),
            token: self.token.clone(),
            keyspace: keyspace.map(str::to_string),
            table: table.map(str::to_string),
            time,
            file_name: file_name.to_string(),
            size: 0,
            compressed_size: 0,
            compression: CompressionType::Snappy,
        }
    }

    pub fn meta_v2(&self, file_name: &str, snapshot_time: DateTime<Utc>) -> BackupPath {
        self.create(BackupFileType::MetaV2, None, None, file_name, snapshot_time)
    }

    pub fn sst_v2(
        &self,
        keyspace: &str,
        table: &str,
        file_name: &str,
        last_modified: DateTime<Utc>,
    ) -> BackupPath {
        self.create(
            BackupFileType::SstV2,
            Some(keyspace),
            Some(table),
            file_name,
            last_modified,
        )
    }

    fn v2_root(&self, file_type: BackupFileType) -> String {
        let reversed: String = self.cluster.chars().rev().collect();
        let mut segments = Vec::with_capacity(4);
        if !self.prefix.is_empty() {
            segments.push(self.prefix.clone());
        }
        segments.push(reversed);
        segments.push(self.token.clone());
        segments.push(file_type.as_str().to_string());
        format!("{}/", segments.join("/"))
    }

    /// Listing prefix of every V2 manifest of this node.
    pub fn meta_v2_prefix(&self) -> String {
        self.v2_root(BackupFileType::MetaV2)
    }

    /// Listing prefix of every V2 data file of this node.
    pub fn sst_v2_prefix(&self) -> String {
        self.v2_root(BackupFileType::SstV2)
    }

    /// Listing prefix of every V1 artifact of this node.
    pub fn v1_node_prefix(&self) -> String {
        let mut segments = Vec::with_capacity(4);
        if !self.prefix.is_empty() {
            segments.push(self.prefix.clone());
        }
        segments.push(self.region.clone());
        segments.push(self.cluster.clone());
        segments.push(self.token.clone());
        format!("{}/", segments.join("/"))
    }
}
