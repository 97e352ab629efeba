//! Error taxonomy for the backup core.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Backend access lost; the scheduler pauses and retries next interval.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Checksum mismatch or undecodable blob. Never retried against the same blob.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backup location setup cancelled")]
    SetupCancelled,

    #[error("Unsafe storage path: {0}")]
    UnsafePath(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ENOSPC and EDQUOT; the EDQUOT number differs per platform.
#[cfg(target_os = "macos")]
const QUOTA_OS_ERRORS: &[i32] = &[28, 69];
#[cfg(all(unix, not(target_os = "macos")))]
const QUOTA_OS_ERRORS: &[i32] = &[28, 122];
// ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
#[cfg(windows)]
const QUOTA_OS_ERRORS: &[i32] = &[39, 112];

impl BackupError {
    /// Classify an I/O failure against `path` into the backup taxonomy.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => BackupError::Permission(format!("{path}: {err}")),
            io::ErrorKind::NotFound => BackupError::NotFound(path.to_string()),
            _ if err
                .raw_os_error()
                .is_some_and(|code| QUOTA_OS_ERRORS.contains(&code)) =>
            {
                BackupError::QuotaExceeded(format!("{path}: {err}"))
            }
            _ => BackupError::Io(err),
        }
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, BackupError::Permission(_))
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, BackupError::QuotaExceeded(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackupError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
