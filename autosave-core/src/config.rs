//! User-facing backup settings and the fixed timing policy.
//!
//! `BackupConfig` is owned by the settings layer and persisted across runs.
//! The scheduler only reads it, except for recording the location label
//! after a successful `enable()`.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MIN_INTERVAL_MINUTES: u32 = 5;
pub const MAX_INTERVAL_MINUTES: u32 = 60;

const GRACE_WINDOW: Duration = Duration::from_secs(30);
const MAX_DEFER: Duration = Duration::from_secs(5 * 60);
const REMINDER_PERIOD: Duration = Duration::from_secs(20 * 60);
const REMINDER_THRESHOLD: Duration = Duration::from_secs(20 * 60);

/// Which storage backend receives snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Directory,
    ManualExport,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Directory => f.write_str("directory"),
            BackendKind::ManualExport => f.write_str("manual-export"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    #[serde(default)]
    pub enabled: bool,

    /// Back up the global settings scope alongside sessions
    #[serde(default = "default_true")]
    pub include_global: bool,

    /// Human-readable description of where backups go
    #[serde(default)]
    pub location_label: Option<String>,

    #[serde(default = "default_retention")]
    pub max_per_scope: usize,

    #[serde(default = "default_retention")]
    pub max_global: usize,

    #[serde(default)]
    pub suppress_reminders: bool,

    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,
}

fn default_backend() -> BackendKind {
    BackendKind::Directory
}

fn default_true() -> bool {
    true
}

fn default_retention() -> usize {
    10
}

fn default_interval_minutes() -> u32 {
    10
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            enabled: false,
            include_global: true,
            location_label: None,
            max_per_scope: default_retention(),
            max_global: default_retention(),
            suppress_reminders: false,
            interval_minutes: default_interval_minutes(),
        }
    }
}

impl BackupConfig {
    /// Hard backup interval, clamped to the supported range.
    pub fn interval(&self) -> Duration {
        let minutes = self
            .interval_minutes
            .clamp(MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES);
        Duration::from_secs(u64::from(minutes) * 60)
    }

    pub fn retention_per_scope(&self) -> usize {
        self.max_per_scope.max(1)
    }

    pub fn retention_global(&self) -> usize {
        self.max_global.max(1)
    }

    /// Strict check used by the settings layer before persisting.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&self.interval_minutes) {
            return Err(BackupError::Config(format!(
                "interval must be {MIN_INTERVAL_MINUTES} to {MAX_INTERVAL_MINUTES} minutes, got {}",
                self.interval_minutes
            )));
        }
        if self.max_per_scope == 0 || self.max_global == 0 {
            return Err(BackupError::Config(
                "retention caps must keep at least one snapshot".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timing knobs for the scheduler. Only `interval` is user controlled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingPolicy {
    pub interval: Duration,
    /// Postpone a backup while content changed more recently than this
    pub grace: Duration,
    /// Force the backup once the first deferral is this old
    pub max_defer: Duration,
    pub reminder_period: Duration,
    /// A scope must be dirty at least this long before a reminder fires
    pub reminder_threshold: Duration,
}

impl TimingPolicy {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            interval: config.interval(),
            grace: GRACE_WINDOW,
            max_defer: MAX_DEFER,
            reminder_period: REMINDER_PERIOD,
            reminder_threshold: REMINDER_THRESHOLD,
        }
    }
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self::from_config(&BackupConfig::default())
    }
}
