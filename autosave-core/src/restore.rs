//! Recovery of application state from stored snapshots.

use crate::codec::{self, SessionSnapshot};
use crate::manifest::SnapshotEntry;
use crate::provider::StorageProvider;
use crate::state::StateSource;
use crate::unload;
use crate::utils::errors::BackupError;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use crate::manifest::validate_manifest;

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Snapshot not found: {path}")]
    NotFound { path: String },

    /// The blob is corrupt; `fallback` is the next-older entry worth trying.
    #[error("Snapshot {} failed integrity check: {reason}", failed.path)]
    Integrity {
        failed: SnapshotEntry,
        reason: String,
        fallback: Option<SnapshotEntry>,
    },

    #[error(transparent)]
    Backup(#[from] BackupError),
}

/// A backup worth offering to the user on start-up.
#[derive(Debug, Clone)]
pub struct RestoreCandidate {
    pub entry: SnapshotEntry,
    pub label: String,
    pub elapsed: chrono::Duration,
    /// The previous run ended with unsaved changes
    pub unclean_shutdown: bool,
}

/// One-shot restore-candidate detection per run.
#[derive(Debug, Default)]
pub struct RestoreProbe {
    checked: AtomicBool,
    marker_path: Option<PathBuf>,
}

impl RestoreProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also consume the unload marker at `path` when probing
    pub fn with_marker(path: impl Into<PathBuf>) -> Self {
        Self {
            checked: AtomicBool::new(false),
            marker_path: Some(path.into()),
        }
    }

    /// Newest session backup to offer, or `None` when local state already has
    /// content, the backend is unusable, there is nothing to restore, or the
    /// probe already ran in this process.
    pub async fn find_candidate(
        &self,
        provider: &dyn StorageProvider,
        state: &dyn StateSource,
    ) -> Option<RestoreCandidate> {
        if self.checked.swap(true, Ordering::SeqCst) {
            return None;
        }

        let unclean_shutdown = match &self.marker_path {
            Some(path) => match unload::take_marker(path).await {
                Ok(marker) => marker.is_some(),
                Err(e) => {
                    warn!(error = %e, "Failed to read unload marker");
                    false
                }
            },
            None => false,
        };

        if state.has_content().await {
            debug!("Local state has content, not offering restore");
            return None;
        }
        if let Err(e) = provider.verify_access().await {
            debug!(error = %e, "Backup location not accessible, not offering restore");
            return None;
        }
        let manifest = match provider.read_manifest().await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Backup manifest unusable, not offering restore");
                return None;
            }
        };

        let entry = manifest.newest_session()?.clone();
        let label = entry.label.clone().unwrap_or_else(|| {
            format!("Session from {}", entry.created_at.format("%Y-%m-%d %H:%M"))
        });
        let elapsed = Utc::now().signed_duration_since(entry.created_at);

        info!(path = %entry.path, unclean_shutdown, "Restore candidate found");
        Some(RestoreCandidate {
            entry,
            label,
            elapsed,
            unclean_shutdown,
        })
    }
}

/// Read, verify and apply one snapshot to local state.
pub async fn restore_snapshot(
    provider: &dyn StorageProvider,
    entry: &SnapshotEntry,
    state: &dyn StateSource,
) -> Result<SessionSnapshot, RestoreError> {
    let snapshot = verify_snapshot(provider, entry).await?;
    state.apply_restore(&snapshot).await?;
    info!(path = %entry.path, scope = %entry.scope, "Snapshot restored");
    Ok(snapshot)
}

/// Like `restore_snapshot`, walking the fallback chain on integrity failures.
/// Gives up after `max_attempts` corrupt snapshots.
pub async fn restore_with_fallback(
    provider: &dyn StorageProvider,
    entry: &SnapshotEntry,
    state: &dyn StateSource,
    max_attempts: usize,
) -> Result<(SnapshotEntry, SessionSnapshot), RestoreError> {
    let mut current = entry.clone();
    let mut attempts = 0;
    loop {
        match restore_snapshot(provider, &current, state).await {
            Ok(snapshot) => return Ok((current, snapshot)),
            Err(RestoreError::Integrity {
                failed,
                reason,
                fallback: Some(next),
            }) if attempts + 1 < max_attempts => {
                warn!(
                    path = %failed.path,
                    reason = %reason,
                    next = %next.path,
                    "Falling back to older snapshot"
                );
                attempts += 1;
                current = next;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read and decode one snapshot without applying it. Integrity failures carry
/// the next-older fallback from the manifest.
pub async fn verify_snapshot(
    provider: &dyn StorageProvider,
    entry: &SnapshotEntry,
) -> Result<SessionSnapshot, RestoreError> {
    let bytes = match provider.read_snapshot(&entry.path).await {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => {
            return Err(RestoreError::NotFound {
                path: entry.path.clone(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    let reason = match codec::deserialize(&bytes) {
        Ok(snapshot) if snapshot.checksum == entry.checksum => return Ok(snapshot),
        Ok(snapshot) => format!(
            "blob checksum {} does not match manifest checksum {}",
            snapshot.checksum, entry.checksum
        ),
        Err(BackupError::Integrity(reason)) => reason,
        Err(e) => return Err(e.into()),
    };

    let fallback = match provider.read_manifest().await {
        Ok(Some(manifest)) => manifest.next_older(entry).cloned(),
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "Could not read manifest to find a fallback snapshot");
            None
        }
    };

    warn!(
        path = %entry.path,
        reason = %reason,
        fallback = ?fallback.as_ref().map(|f| &f.path),
        "Snapshot failed integrity check"
    );
    Err(RestoreError::Integrity {
        failed: entry.clone(),
        reason,
        fallback,
    })
}
