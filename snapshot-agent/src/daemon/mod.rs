//! Long-running agent process.

pub mod shutdown;

use crate::manifest::proxy::clear_downloads;
use crate::manifest::writer::cleanup_old;
use crate::scheduler::BackupScheduler;
use crate::state::AgentState;
use crate::utils::errors::Result;
use shutdown::ShutdownCoordinator;
use std::sync::Arc;
use tracing::info;

/// Schedule every periodic task and run until a shutdown signal arrives.
pub async fn run(state: Arc<AgentState>) -> Result<()> {
    let meta_dir = state.config.meta_dir();
    let removed = cleanup_old(&meta_dir).await? + clear_downloads(&meta_dir).await?;
    if removed > 0 {
        info!("Removed {} manifests left by a previous run", removed);
    }

    let scheduler = BackupScheduler::new(state.clone()).await?;
    scheduler.init_schedules().await?;
    scheduler.start().await?;
    info!("Scheduler started");

    let coordinator = ShutdownCoordinator::new(state.cancel.clone());
    coordinator.wait_for_signal().await;

    scheduler.shutdown().await?;
    let summary = state.orchestrator.queue().drain().await;
    info!(
        uploaded = summary.uploaded,
        failed = summary.failed,
        "Shutdown complete"
    );
    Ok(())
}
