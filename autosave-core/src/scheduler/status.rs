//! Transient runtime status published by the scheduler.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Disabled,
    Enabled,
    /// Backend access lost; retried on the next interval
    Paused,
    Error,
}

/// Reset on every process start. Only the scheduler writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRuntimeState {
    pub status: BackupStatus,
    pub is_saving: bool,
    pub is_dirty: bool,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl BackupRuntimeState {
    pub fn new(enabled: bool) -> Self {
        Self {
            status: if enabled {
                BackupStatus::Enabled
            } else {
                BackupStatus::Disabled
            },
            is_saving: false,
            is_dirty: false,
            last_backup_at: None,
            last_error: None,
        }
    }
}
