//! Event bus for backup notifications.
//!
//! Components receive an [`EventBus`] at construction and publish to it; the
//! bus owns the subscriber list. Publishing never blocks and never fails when
//! nobody listens.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BackupEvent {
    #[serde(rename = "upload:started")]
    UploadStarted { key: String },

    #[serde(rename = "upload:succeeded")]
    UploadSucceeded { key: String, bytes: u64 },

    #[serde(rename = "upload:failed")]
    UploadFailed { key: String, error: String },

    #[serde(rename = "download:started")]
    DownloadStarted { key: String },

    #[serde(rename = "download:succeeded")]
    DownloadSucceeded { key: String, bytes: u64 },

    #[serde(rename = "download:failed")]
    DownloadFailed { key: String, error: String },

    #[serde(rename = "snapshot:started")]
    SnapshotStarted { snapshot_name: String },

    #[serde(rename = "snapshot:completed")]
    SnapshotCompleted {
        snapshot_name: String,
        manifest: String,
        files: usize,
    },

    #[serde(rename = "snapshot:failed")]
    SnapshotFailed { snapshot_name: String, error: String },

    #[serde(rename = "verification:succeeded")]
    VerificationSucceeded { manifest: String },

    #[serde(rename = "verification:failed")]
    VerificationFailed {
        manifest: Option<String>,
        missing: Vec<String>,
    },

    #[serde(rename = "ttl:completed")]
    TtlCompleted {
        manifests_deleted: usize,
        files_deleted: usize,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackupEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: BackupEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(BackupEvent::UploadStarted { key: "k".into() });
        assert_eq!(rx.recv().await.unwrap(), BackupEvent::UploadStarted { key: "k".into() });
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new().publish(BackupEvent::TtlCompleted {
            manifests_deleted: 0,
            files_deleted: 0,
        });
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(BackupEvent::UploadSucceeded {
            key: "a/b".into(),
            bytes: 3,
        })
        .unwrap();
        assert_eq!(json["type"], "upload:succeeded");
        assert_eq!(json["payload"]["bytes"], 3);
    }
}
