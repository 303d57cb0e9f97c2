use crate::state::AgentState;
use crate::utils::errors::{BackupError, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

fn scheduler_error(e: JobSchedulerError) -> BackupError {
    BackupError::Scheduler(e.to_string())
}

/// Log the outcome of a scheduled run. A run that found its task still busy is
/// reported, not retried.
fn report<T>(task: &'static str, result: Result<T>) {
    match result {
        Ok(_) => tracing::debug!(task, "Scheduled run finished"),
        Err(BackupError::TaskAlreadyRunning(name)) => {
            tracing::warn!(task, running = %name, "Skipping scheduled run: task already running")
        }
        Err(e) => tracing::error!(task, error = %e, "Scheduled run failed"),
    }
}

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AgentState>,
}

impl BackupScheduler {
    pub async fn new(state: Arc<AgentState>) -> Result<Self> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    async fn add(&self, task: &'static str, cron: &str, job: Job) -> Result<Uuid> {
        let id = self
            .scheduler
            .lock()
            .await
            .add(job)
            .await
            .map_err(scheduler_error)?;
        tracing::info!(task, cron = %cron, "Job scheduled");
        Ok(id)
    }

    /// Register every periodic task from the configuration.
    pub async fn init_schedules(&self) -> Result<()> {
        let config = self.state.config.clone();

        let state = self.state.clone();
        let cron = &config.backup.snapshot_cron;
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                report("snapshot", state.orchestrator.take_snapshot(Utc::now()).await);
            })
        })
        .map_err(scheduler_error)?;
        let snapshot_job = self.add("snapshot", cron, job).await?;

        // Uploads pace themselves to finish before the next snapshot.
        let state = self.state.clone();
        let cron = &config.backup.upload_cron;
        let job = Job::new_async(cron.as_str(), move |_uuid, mut lock| {
            let state = state.clone();
            Box::pin(async move {
                let next_snapshot = match lock.next_tick_for_job(snapshot_job).await {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not compute next snapshot time");
                        None
                    }
                };
                report("upload", state.orchestrator.upload_pending(next_snapshot).await);
            })
        })
        .map_err(scheduler_error)?;
        self.add("upload", cron, job).await?;

        if config.backup.incremental_enabled {
            let state = self.state.clone();
            let cron = &config.backup.incremental_cron;
            let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
                let state = state.clone();
                Box::pin(async move {
                    report("incremental", state.incremental.run().await);
                })
            })
            .map_err(scheduler_error)?;
            self.add("incremental", cron, job).await?;
        }

        let state = self.state.clone();
        let cron = &config.ttl.cron;
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                report("ttl", state.ttl.run(Utc::now()).await);
            })
        })
        .map_err(scheduler_error)?;
        self.add("ttl", cron, job).await?;

        let state = self.state.clone();
        let cron = &config.verification.cron;
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                report("verification", state.verification.verify_latest(Utc::now()).await);
            })
        })
        .map_err(scheduler_error)?;
        self.add("verification", cron, job).await?;

        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.lock().await.start().await.map_err(scheduler_error)?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.lock().await.shutdown().await.map_err(scheduler_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_schedules_register_from_config() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut config = Config::default();
        config.node.data_dir = temp_dir.path().join("data");
        config.node.state_dir = temp_dir.path().join("state");
        config.remote.store_root = temp_dir.path().join("bucket");
        config.status.file = temp_dir.path().join("state/status.json");
        config.backup.incremental_enabled = true;

        let state = AgentState::new(config).await?;
        let scheduler = BackupScheduler::new(state).await?;
        scheduler.init_schedules().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut config = Config::default();
        config.node.state_dir = temp_dir.path().join("state");
        config.status.file = temp_dir.path().join("state/status.json");
        config.ttl.cron = "not a cron".into();

        let state = AgentState::new(config).await?;
        let scheduler = BackupScheduler::new(state).await?;
        assert!(matches!(
            scheduler.init_schedules().await,
            Err(BackupError::Scheduler(_))
        ));
        Ok(())
    }
}
