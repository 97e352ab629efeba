//! Storage backends for snapshot blobs and the manifest.
//!
//! Providers move bytes; they never serialize snapshots themselves.

mod directory;
mod manual_export;
pub mod paths;

pub use directory::{DirectoryPicker, DirectoryProvider};
pub use manual_export::{ManualExportProvider, PendingExport};

use crate::config::BackendKind;
use crate::manifest::{BackupManifest, SnapshotEntry};
use crate::utils::errors::Result;
use async_trait::async_trait;

/// Trait for snapshot storage backends
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn is_supported(&self) -> bool;

    /// Obtain a storage location. Returns a human-readable location label.
    async fn enable(&self) -> Result<String>;

    /// Cheap check that the backend is still readable and writable
    async fn verify_access(&self) -> Result<()>;

    async fn write_snapshot(&self, entry: &SnapshotEntry, bytes: &[u8]) -> Result<()>;

    async fn write_manifest(&self, manifest: &BackupManifest) -> Result<()>;

    /// `Ok(None)` when no manifest has been written yet
    async fn read_manifest(&self) -> Result<Option<BackupManifest>>;

    async fn read_snapshot(&self, path: &str) -> Result<Vec<u8>>;

    /// Missing blobs are not an error here
    async fn delete_snapshots(&self, paths: &[String]) -> Result<()>;

    /// Whether a completed batch is durable without any user action.
    fn persists_silently(&self) -> bool {
        true
    }
}
