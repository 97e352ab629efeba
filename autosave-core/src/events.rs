//! Outward notifications for the UI layer.
//!
//! Fan-out uses a broadcast channel; a slow or absent listener never blocks
//! the scheduler.

use crate::manifest::BackupReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum number of queued events per subscriber
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BackupEvent {
    /// Content has been dirty for a long time and cannot be saved silently
    #[serde(rename = "backup:reminder")]
    DirtyReminder {
        manual_export_available: bool,
        dirty_for_secs: u64,
    },

    /// A user-visible backup finished (routine scheduled ones stay quiet)
    #[serde(rename = "backup:completed")]
    BackupComplete {
        reason: BackupReason,
        scopes: usize,
        at: DateTime<Utc>,
    },

    #[serde(rename = "backup:quota-exceeded")]
    StorageQuotaExceeded { message: String },

    #[serde(rename = "backup:failed")]
    BackupFailed {
        reason: BackupReason,
        error: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackupEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: BackupEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!(receivers = count, "Published backup event"),
            Err(e) => debug!(event = ?e.0, "Backup event dropped (no listeners)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
