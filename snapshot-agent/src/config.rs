//! Configuration management for the snapshot agent.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`SNAPSHOT_AGENT__<SECTION>__<KEY>`).

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Cluster (application) name
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default = "default_rack")]
    pub rack: String,

    /// Stable identifier of this cluster member, namespaces every remote key
    #[serde(default = "default_token")]
    pub token: String,

    /// Database data directory (`<data_dir>/<keyspace>/<table>/...`)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Working directory for manifests and the uploaded-files ledger
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Leading segment(s) of every remote key
    #[serde(default = "default_backup_prefix")]
    pub backup_prefix: String,

    /// Root directory of the object store (mounted bucket or NFS export)
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionPolicy {
    None,
    All,
    IfRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMethod {
    /// Hard-link live table files into `snapshots/<tag>` ourselves
    Hardlink,
    /// Ask the database through `nodetool snapshot`
    Nodetool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Comma-separated `keyspace` or `keyspace.table` regexes to include (empty = all)
    #[serde(default)]
    pub include_filter: String,

    /// Comma-separated `keyspace` or `keyspace.table` regexes to exclude
    #[serde(default)]
    pub exclude_filter: String,

    #[serde(default = "default_compression_policy")]
    pub compression_policy: CompressionPolicy,

    /// Files modified before this instant (epoch millis) are always SNAPPY
    #[serde(default)]
    pub compression_transition_epoch_millis: i64,

    /// Upload horizon in minutes after a snapshot (0 = no horizon)
    #[serde(default)]
    pub target_minutes_to_complete_upload: u64,

    #[serde(default = "default_snapshot_cron")]
    pub snapshot_cron: String,

    #[serde(default = "default_upload_cron")]
    pub upload_cron: String,

    #[serde(default)]
    pub incremental_enabled: bool,

    #[serde(default = "default_incremental_cron")]
    pub incremental_cron: String,

    #[serde(default = "default_meta_version")]
    pub meta_version: MetaVersion,

    #[serde(default = "default_snapshot_method")]
    pub snapshot_method: SnapshotMethod,

    #[serde(default = "default_nodetool")]
    pub nodetool_path: PathBuf,

    /// Quarantine live files that no snapshot references
    #[serde(default = "default_true")]
    pub forgotten_files_enabled: bool,

    /// Grace period for files being rewritten by compaction
    #[serde(default = "default_compaction_grace_days")]
    pub grace_period_days_for_compaction: i64,

    /// How long a flagged file stays symlinked before it is moved aside
    #[serde(default = "default_forgotten_grace_days")]
    pub forgotten_file_grace_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    /// Retention window in days (0 disables TTL)
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Keys per delete call
    #[serde(default = "default_ttl_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_ttl_cron")]
    pub cron: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// A backup must be verified within this many hours of starting
    #[serde(default = "default_slo_hours")]
    pub slo_hours: i64,

    #[serde(default = "default_verification_cron")]
    pub cron: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Maximum number of ledger entries kept
    #[serde(default = "default_status_capacity")]
    pub capacity: usize,

    #[serde(default = "default_status_file")]
    pub file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Concurrency budget of the upload worker pool
    #[serde(default = "default_workers")]
    pub upload_workers: usize,

    /// Parallel downloads during restore
    #[serde(default = "default_workers")]
    pub download_workers: usize,

    /// Attempts per remote call before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Floor for the dynamic upload throttle (bytes/s)
    #[serde(default = "default_min_upload_rate")]
    pub min_upload_bytes_per_sec: u64,

    /// Ceiling for the dynamic upload throttle (bytes/s, 0 = unlimited)
    #[serde(default)]
    pub max_upload_bytes_per_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_cluster_name() -> String {
    "cass_cluster".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_rack() -> String {
    "rack1".to_string()
}

fn default_token() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node-01".to_string())
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cassandra/data")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/snapshot-agent")
}

fn default_backup_prefix() -> String {
    "backups".to_string()
}

fn default_store_root() -> PathBuf {
    PathBuf::from("/mnt/backups")
}

fn default_compression_policy() -> CompressionPolicy {
    CompressionPolicy::All
}

fn default_snapshot_cron() -> String {
    "0 0 1 * * *".to_string()
}

fn default_upload_cron() -> String {
    "0 */5 * * * *".to_string()
}

fn default_incremental_cron() -> String {
    "0 */10 * * * *".to_string()
}

fn default_meta_version() -> MetaVersion {
    MetaVersion::V2
}

fn default_snapshot_method() -> SnapshotMethod {
    SnapshotMethod::Nodetool
}

fn default_nodetool() -> PathBuf {
    PathBuf::from("nodetool")
}

fn default_true() -> bool {
    true
}

fn default_compaction_grace_days() -> i64 {
    5
}

fn default_forgotten_grace_days() -> i64 {
    3
}

fn default_retention_days() -> i64 {
    30
}

fn default_ttl_batch_size() -> usize {
    1000
}

fn default_ttl_cron() -> String {
    "0 0 2 * * *".to_string()
}

fn default_slo_hours() -> i64 {
    24
}

fn default_verification_cron() -> String {
    "0 30 * * * *".to_string()
}

fn default_status_capacity() -> usize {
    60
}

fn default_status_file() -> PathBuf {
    default_state_dir().join("backup_status.json")
}

fn default_workers() -> usize {
    8
}

fn default_max_attempts() -> usize {
    5
}

fn default_min_upload_rate() -> u64 {
    1024 * 1024 // 1MB/s
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            region: default_region(),
            rack: default_rack(),
            token: default_token(),
            data_dir: default_data_dir(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backup_prefix: default_backup_prefix(),
            store_root: default_store_root(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            include_filter: String::new(),
            exclude_filter: String::new(),
            compression_policy: default_compression_policy(),
            compression_transition_epoch_millis: 0,
            target_minutes_to_complete_upload: 0,
            snapshot_cron: default_snapshot_cron(),
            upload_cron: default_upload_cron(),
            incremental_enabled: false,
            incremental_cron: default_incremental_cron(),
            meta_version: default_meta_version(),
            snapshot_method: default_snapshot_method(),
            nodetool_path: default_nodetool(),
            forgotten_files_enabled: default_true(),
            grace_period_days_for_compaction: default_compaction_grace_days(),
            forgotten_file_grace_days: default_forgotten_grace_days(),
        }
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            batch_size: default_ttl_batch_size(),
            cron: default_ttl_cron(),
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            slo_hours: default_slo_hours(),
            cron: default_verification_cron(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            capacity: default_status_capacity(),
            file: default_status_file(),
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            upload_workers: default_workers(),
            download_workers: default_workers(),
            max_attempts: default_max_attempts(),
            min_upload_bytes_per_sec: default_min_upload_rate(),
            max_upload_bytes_per_sec: 0,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("SNAPSHOT_AGENT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| BackupError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.status.capacity == 0 {
            return Err(BackupError::Config("status.capacity must be positive".into()));
        }
        if self.ttl.batch_size == 0 {
            return Err(BackupError::Config("ttl.batch_size must be positive".into()));
        }
        if self.performance.upload_workers == 0 || self.performance.max_attempts == 0 {
            return Err(BackupError::Config(
                "performance.upload_workers and performance.max_attempts must be positive".into(),
            ));
        }
        if self.backup.grace_period_days_for_compaction < 0
            || self.backup.forgotten_file_grace_days < 0
            || self.ttl.retention_days < 0
        {
            return Err(BackupError::Config("day counts must not be negative".into()));
        }
        crate::fs::filter::ColumnFamilyFilter::new(
            &self.backup.include_filter,
            &self.backup.exclude_filter,
        )?;
        Ok(())
    }

    /// Directory holding local manifests before upload.
    pub fn meta_dir(&self) -> PathBuf {
        self.node.state_dir.join("meta")
    }

    /// Directory holding the per-file uploaded ledger.
    pub fn uploaded_dir(&self) -> PathBuf {
        self.node.state_dir.join("uploaded")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
            [node]
            cluster_name = "cass_test"
            token = "1808575600"

            [backup]
            compression_policy = "IF_REQUIRED"
            exclude_filter = "OpsCenter,system_traces"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.cluster_name, "cass_test");
        assert_eq!(config.node.region, "us-east-1");
        assert_eq!(config.backup.compression_policy, CompressionPolicy::IfRequired);
        assert_eq!(config.status.capacity, 60);
        assert_eq!(config.ttl.batch_size, 1000);
        assert_eq!(config.backup.meta_version, MetaVersion::V2);
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let result = Config::from_toml_str(
            r#"
            [backup]
            exclude_filter = "ks.("
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = Config::from_toml_str("[status]\ncapacity = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "[ttl]\nretention_days = 7\n")?;
        let config = Config::from_file(&path)?;
        assert_eq!(config.ttl.retention_days, 7);
        Ok(())
    }
}
