//! Non-blocking per-task mutual exclusion.
//!
//! A second trigger of a task that is still running fails immediately with
//! [`BackupError::TaskAlreadyRunning`]; nothing waits or queues.

use crate::utils::errors::{BackupError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct TaskLock {
    name: &'static str,
    held: Arc<AtomicBool>,
}

impl TaskLock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Take the lock or fail fast. The lock is released when the guard drops.
    pub fn try_acquire(&self) -> Result<TaskGuard> {
        if self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Refusing to start {}: already running", self.name);
            return Err(BackupError::TaskAlreadyRunning(self.name.to_string()));
        }
        Ok(TaskGuard {
            held: self.held.clone(),
        })
    }
}

#[derive(Debug)]
pub struct TaskGuard {
    held: Arc<AtomicBool>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_fast() {
        let lock = TaskLock::new("snapshot");
        let guard = lock.try_acquire().unwrap();
        assert!(lock.is_held());
        assert!(matches!(
            lock.clone().try_acquire(),
            Err(BackupError::TaskAlreadyRunning(name)) if name == "snapshot"
        ));
        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_acquire().is_ok());
    }
}
