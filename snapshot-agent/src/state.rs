use crate::config::{Config, MetaVersion};
use crate::events::EventBus;
use crate::executor::incremental::IncrementalBackup;
use crate::executor::upload::UploadQueue;
use crate::executor::uploaded::UploadedFilesLedger;
use crate::executor::SnapshotOrchestrator;
use crate::fs::filter::ColumnFamilyFilter;
use crate::fs::scanner::SnapshotScanner;
use crate::manifest::MetaProxy;
use crate::metrics::BackupMetrics;
use crate::path::RemotePathFactory;
use crate::remote::{LocalObjectStore, RemoteFileSystem};
use crate::restore::Restorer;
use crate::snapshot;
use crate::status::BackupStatusLedger;
use crate::throttle::DynamicRateLimiter;
use crate::ttl::TtlCollector;
use crate::utils::errors::Result;
use crate::verify::VerificationEngine;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Every long-lived component of the agent, built once at startup.
pub struct AgentState {
    pub config: Arc<Config>,
    pub events: EventBus,
    pub metrics: Arc<BackupMetrics>,
    pub remote: Arc<RemoteFileSystem>,
    pub status: Arc<BackupStatusLedger>,
    pub orchestrator: SnapshotOrchestrator,
    pub incremental: IncrementalBackup,
    pub ttl: TtlCollector,
    pub verification: VerificationEngine,
    pub restorer: Restorer,
    pub cancel: CancellationToken,
}

impl AgentState {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let events = EventBus::new();
        let metrics = Arc::new(BackupMetrics::new());
        let cancel = CancellationToken::new();
        let factory = RemotePathFactory::from_config(&config);
        let perf = &config.performance;

        let remote = Arc::new(RemoteFileSystem::new(
            Arc::new(LocalObjectStore::new(config.remote.store_root.clone())),
            events.clone(),
            metrics.clone(),
            config.node.state_dir.join("scratch"),
        ));
        let status = Arc::new(
            BackupStatusLedger::open(config.status.file.clone(), config.status.capacity).await?,
        );
        let queue = Arc::new(UploadQueue::new(
            remote.clone(),
            Arc::new(UploadedFilesLedger::new(config.uploaded_dir())),
            Arc::new(DynamicRateLimiter::new(
                perf.min_upload_bytes_per_sec,
                perf.max_upload_bytes_per_sec,
            )),
            perf.upload_workers,
            perf.max_attempts,
            cancel.child_token(),
        ));

        let orchestrator = SnapshotOrchestrator::new(
            config.clone(),
            snapshot::from_config(&config),
            remote.clone(),
            status.clone(),
            queue.clone(),
            events.clone(),
        )?;

        let filter = ColumnFamilyFilter::new(&config.backup.include_filter, &config.backup.exclude_filter)?;
        let incremental = IncrementalBackup::new(
            SnapshotScanner::new(config.node.data_dir.clone(), filter),
            factory.clone(),
            config.backup.clone(),
            queue,
        );

        // Retention follows the V2 manifests this agent writes. Verification and
        // restore read manifests in the configured format.
        let v2_proxy = MetaProxy::new(
            MetaVersion::V2,
            remote.clone(),
            factory.clone(),
            config.meta_dir(),
            perf.max_attempts,
        );
        let ttl = TtlCollector::new(&config, v2_proxy, remote.clone(), factory.clone(), events.clone());
        let proxy = MetaProxy::new(
            config.backup.meta_version,
            remote.clone(),
            factory,
            config.meta_dir(),
            perf.max_attempts,
        );
        let verification = VerificationEngine::new(
            proxy.clone(),
            status.clone(),
            events.clone(),
            metrics.clone(),
            config.verification.slo_hours,
        );
        let restorer = Restorer::new(proxy, remote.clone(), perf.download_workers, perf.max_attempts);

        Ok(Arc::new(Self {
            config,
            events,
            metrics,
            remote,
            status,
            orchestrator,
            incremental,
            ttl,
            verification,
            restorer,
            cancel,
        }))
    }
}
