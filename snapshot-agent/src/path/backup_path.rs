//! Remote key encoding for backup artifacts.
//!
//! Two layouts coexist in the same bucket:
//!
//! ```text
//! V1: <prefix>/<region>/<cluster>/<token>/<yyyyMMddHHmm>/<TYPE>/<keyspace>[/<table>]/<file>
//! V2: <prefix>/<reversed cluster>/<token>/<TYPE>/<epoch millis>/<keyspace>/<table>/<sstable prefix>/<file>
//! ```
//!
//! Both time segments are fixed width so that lexicographic key order is
//! chronological order.

use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Minute-precision timestamp used by V1 keys and manifest file names.
pub const V1_DATE_FORMAT: &str = "%Y%m%d%H%M";

/// Width of the epoch-millis time segment in V2 keys.
const MILLIS_WIDTH: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupFileType {
    #[serde(rename = "SNAP")]
    Snapshot,
    #[serde(rename = "SST")]
    Incremental,
    #[serde(rename = "CL")]
    CommitLog,
    #[serde(rename = "META")]
    Meta,
    #[serde(rename = "META_V2")]
    MetaV2,
    #[serde(rename = "SST_V2")]
    SstV2,
}

impl BackupFileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupFileType::Snapshot => "SNAP",
            BackupFileType::Incremental => "SST",
            BackupFileType::CommitLog => "CL",
            BackupFileType::Meta => "META",
            BackupFileType::MetaV2 => "META_V2",
            BackupFileType::SstV2 => "SST_V2",
        }
    }

    pub fn is_v2(&self) -> bool {
        matches!(self, BackupFileType::MetaV2 | BackupFileType::SstV2)
    }

    /// Types whose keys carry keyspace and table segments.
    fn has_table_segments(&self) -> bool {
        matches!(
            self,
            BackupFileType::Snapshot | BackupFileType::Incremental | BackupFileType::SstV2
        )
    }
}

impl fmt::Display for BackupFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupFileType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SNAP" => Ok(BackupFileType::Snapshot),
            "SST" => Ok(BackupFileType::Incremental),
            "CL" => Ok(BackupFileType::CommitLog),
            "META" => Ok(BackupFileType::Meta),
            "META_V2" => Ok(BackupFileType::MetaV2),
            "SST_V2" => Ok(BackupFileType::SstV2),
            other => Err(BackupError::InvalidPath(format!("unknown file type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompressionType {
    #[default]
    Snappy,
    None,
}

impl CompressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::Snappy => "SNAPPY",
            CompressionType::None => "NONE",
        }
    }
}

impl FromStr for CompressionType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SNAPPY" => Ok(CompressionType::Snappy),
            "NONE" => Ok(CompressionType::None),
            other => Err(BackupError::Config(format!("unknown compression {other}"))),
        }
    }
}

/// One physical artifact, local or remote.
///
/// Equality and hashing go through [`BackupPath::remote_key`]: two paths that
/// encode to the same key are the same artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPath {
    pub file_type: BackupFileType,
    pub prefix: String,
    pub cluster: String,
    pub region: String,
    pub token: String,
    pub keyspace: Option<String>,
    pub table: Option<String>,
    /// Backup time for V1 keys, last-modified (or snapshot) time for V2 keys.
    pub time: DateTime<Utc>,
    pub file_name: String,
    pub size: u64,
    pub compressed_size: u64,
    pub compression: CompressionType,
}

impl BackupPath {
    /// Encode this artifact as its canonical remote key.
    pub fn remote_key(&self) -> String {
        let mut segments: Vec<String> = Vec::with_capacity(10);
        if !self.prefix.is_empty() {
            segments.push(self.prefix.trim_end_matches('/').to_string());
        }

        if self.file_type.is_v2() {
            segments.push(reverse(&self.cluster));
            segments.push(self.token.clone());
            segments.push(self.file_type.as_str().to_string());
            segments.push(format_millis(&self.time));
            if self.file_type.has_table_segments() {
                segments.push(self.keyspace.clone().unwrap_or_default());
                segments.push(self.table.clone().unwrap_or_default());
                segments.push(sstable_prefix(&self.file_name).to_string());
            }
        } else {
            segments.push(self.region.clone());
            segments.push(self.cluster.clone());
            segments.push(self.token.clone());
            segments.push(format_v1_time(&self.time));
            segments.push(self.file_type.as_str().to_string());
            if self.file_type.has_table_segments() {
                if let Some(keyspace) = &self.keyspace {
                    segments.push(keyspace.clone());
                }
                if let Some(table) = &self.table {
                    segments.push(table.clone());
                }
            }
        }

        segments.push(self.file_name.clone());
        segments.join("/")
    }

    /// Decode a remote key produced by [`BackupPath::remote_key`].
    ///
    /// `prefix` must be the backup prefix the key was written under. Sizes are
    /// unknown after decoding and left at zero.
    pub fn parse(key: &str, prefix: &str) -> Result<Self> {
        let prefix = prefix.trim_end_matches('/');
        let rest = if prefix.is_empty() {
            key
        } else {
            key.strip_prefix(prefix)
                .and_then(|r| r.strip_prefix('/'))
                .ok_or_else(|| invalid(key, "prefix mismatch"))?
        };

        let segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid(key, "empty segment"));
        }

        let is_v2 = segments
            .get(2)
            .and_then(|s| BackupFileType::from_str(s).ok())
            .is_some_and(|t| t.is_v2());

        if is_v2 {
            Self::parse_v2(key, prefix, &segments)
        } else {
            Self::parse_v1(key, prefix, &segments)
        }
    }

    fn parse_v2(key: &str, prefix: &str, segments: &[&str]) -> Result<Self> {
        let file_type = BackupFileType::from_str(segments[2])?;
        let time = segments
            .get(3)
            .and_then(|s| parse_millis(s))
            .ok_or_else(|| invalid(key, "bad time segment"))?;

        let (keyspace, table, file_name) = match (file_type, segments.len()) {
            (BackupFileType::MetaV2, 5) => (None, None, segments[4]),
            (BackupFileType::SstV2, 8) => {
                if sstable_prefix(segments[7]) != segments[6] {
                    return Err(invalid(key, "sstable prefix does not match file name"));
                }
                (Some(segments[4]), Some(segments[5]), segments[7])
            }
            _ => return Err(invalid(key, "unexpected segment count")),
        };

        Ok(Self {
            file_type,
            prefix: prefix.to_string(),
            cluster: reverse(segments[0]),
            region: String::new(),
            token: segments[1].to_string(),
            keyspace: keyspace.map(str::to_string),
            table: table.map(str::to_string),
            time,
            file_name: file_name.to_string(),
            size: 0,
            compressed_size: 0,
            compression: CompressionType::Snappy,
        })
    }

    fn parse_v1(key: &str, prefix: &str, segments: &[&str]) -> Result<Self> {
        if segments.len() < 6 {
            return Err(invalid(key, "too few segments"));
        }
        let time = parse_v1_time(segments[3]).ok_or_else(|| invalid(key, "bad date segment"))?;
        let file_type = BackupFileType::from_str(segments[4])?;
        if file_type.is_v2() {
            return Err(invalid(key, "V2 type in V1 layout"));
        }

        let (keyspace, table) = match (file_type.has_table_segments(), segments.len()) {
            (false, 6) => (None, None),
            (true, 7) => (Some(segments[5]), None),
            (true, 8) => (Some(segments[5]), Some(segments[6])),
            _ => return Err(invalid(key, "unexpected segment count")),
        };

        Ok(Self {
            file_type,
            prefix: prefix.to_string(),
            cluster: segments[1].to_string(),
            region: segments[0].to_string(),
            token: segments[2].to_string(),
            keyspace: keyspace.map(str::to_string),
            table: table.map(str::to_string),
            time,
            file_name: segments[segments.len() - 1].to_string(),
            size: 0,
            compressed_size: 0,
            compression: CompressionType::Snappy,
        })
    }
}

impl PartialEq for BackupPath {
    fn eq(&self, other: &Self) -> bool {
        self.remote_key() == other.remote_key()
    }
}

impl Eq for BackupPath {}

impl Hash for BackupPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.remote_key().hash(state);
    }
}

impl fmt::Display for BackupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.remote_key())
    }
}

/// The part of an SSTable component name shared by all its siblings:
/// `mc-12-big-Data.db` becomes `mc-12-big`.
pub fn sstable_prefix(file_name: &str) -> &str {
    match file_name.rfind('-') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name.split('.').next().unwrap_or(file_name),
    }
}

pub fn format_v1_time(time: &DateTime<Utc>) -> String {
    time.format(V1_DATE_FORMAT).to_string()
}

pub fn parse_v1_time(s: &str) -> Option<DateTime<Utc>> {
    if s.len() != 12 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(s, V1_DATE_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn format_millis(time: &DateTime<Utc>) -> String {
    format!("{:0width$}", time.timestamp_millis().max(0), width = MILLIS_WIDTH)
}

pub fn parse_millis(s: &str) -> Option<DateTime<Utc>> {
    if s.len() != MILLIS_WIDTH || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn reverse(s: &str) -> String {
    s.chars().rev().collect()
}

fn invalid(key: &str, reason: &str) -> BackupError {
    BackupError::InvalidPath(format!("{key}: {reason}"))
}
