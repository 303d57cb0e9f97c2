//! Snapshot Agent Library
//!
//! Backup sidecar for a database node: snapshots, streamed manifests,
//! paced uploads, retention and verification.

pub mod config;
pub mod daemon;
pub mod events;
pub mod executor;
pub mod fs;
pub mod lock;
pub mod manifest;
pub mod metrics;
pub mod path;
pub mod remote;
pub mod restore;
pub mod scheduler;
pub mod snapshot;
pub mod state;
pub mod status;
pub mod throttle;
pub mod ttl;
pub mod utils;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{BackupError, Result};
