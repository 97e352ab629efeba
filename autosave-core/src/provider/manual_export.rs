//! Fallback backend for environments without a writable backup location.
//!
//! Holds a queue of exactly one pending snapshot. Each write replaces the
//! pending pair; the UI layer hands it to the user with `trigger_download`.
//! There is no durable catalog, so manifest operations are no-ops.

use super::StorageProvider;
use crate::config::BackendKind;
use crate::manifest::{BackupManifest, SnapshotEntry};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

const LOCATION_LABEL: &str = "manual export";

#[derive(Debug, Clone)]
pub struct PendingExport {
    pub entry: SnapshotEntry,
    pub bytes: Vec<u8>,
}

impl PendingExport {
    /// Suggested download file name, e.g. `autosave-<scope>-<file>`.
    pub fn file_name(&self) -> String {
        format!("autosave-{}-{}", self.entry.scope, self.entry.file_name())
    }
}

#[derive(Default)]
pub struct ManualExportProvider {
    pending: Mutex<Option<PendingExport>>,
}

impl ManualExportProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn has_pending_download(&self) -> bool {
        self.pending.lock().await.is_some()
    }

    pub async fn pending_entry(&self) -> Option<SnapshotEntry> {
        self.pending.lock().await.as_ref().map(|p| p.entry.clone())
    }

    /// Hand the queued snapshot to the user by writing it into `dest_dir`.
    ///
    /// Returns `Ok(None)` when nothing is queued. The queue is cleared only
    /// after the file was written.
    pub async fn trigger_download(&self, dest_dir: &Path) -> Result<Option<PathBuf>> {
        let mut pending = self.pending.lock().await;
        let Some(export) = pending.as_ref() else {
            return Ok(None);
        };

        let target = dest_dir.join(export.file_name());
        let label = target.display().to_string();
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| BackupError::from_io(e, &label))?;
        tokio::fs::write(&target, &export.bytes)
            .await
            .map_err(|e| BackupError::from_io(e, &label))?;

        info!(path = %label, bytes = export.bytes.len(), "Exported snapshot");
        *pending = None;
        Ok(Some(target))
    }
}

#[async_trait]
impl StorageProvider for ManualExportProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::ManualExport
    }

    fn is_supported(&self) -> bool {
        true
    }

    async fn enable(&self) -> Result<String> {
        Ok(LOCATION_LABEL.to_string())
    }

    async fn verify_access(&self) -> Result<()> {
        Ok(())
    }

    async fn write_snapshot(&self, entry: &SnapshotEntry, bytes: &[u8]) -> Result<()> {
        *self.pending.lock().await = Some(PendingExport {
            entry: entry.clone(),
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    async fn write_manifest(&self, _manifest: &BackupManifest) -> Result<()> {
        Ok(())
    }

    async fn read_manifest(&self) -> Result<Option<BackupManifest>> {
        Ok(None)
    }

    async fn read_snapshot(&self, path: &str) -> Result<Vec<u8>> {
        match self.pending.lock().await.as_ref() {
            Some(p) if p.entry.path == path => Ok(p.bytes.clone()),
            _ => Err(BackupError::NotFound(path.to_string())),
        }
    }

    async fn delete_snapshots(&self, _paths: &[String]) -> Result<()> {
        Ok(())
    }

    fn persists_silently(&self) -> bool {
        false
    }
}
