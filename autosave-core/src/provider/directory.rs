//! Directory-backed snapshot storage.
//!
//! Layout under the chosen root:
//!
//! ```text
//! manifest.json
//! sessions/<scopeHash>/<timestamp>_<reason>.json.gz
//! sessions/global/<timestamp>_<reason>.json.gz
//! ```
//!
//! Every write goes to a `.tmp_` sibling first and is renamed into place, so
//! an interrupted write never leaves a partial file under its final name.

use super::paths::{self, TMP_PREFIX};
use super::StorageProvider;
use crate::config::BackendKind;
use crate::manifest::{validate_manifest, BackupManifest, SnapshotEntry};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const MANIFEST_FILE: &str = "manifest.json";
const PROBE_FILE: &str = ".tmp_access_probe";

/// Interactive source of a backup directory. `None` means the user cancelled.
pub trait DirectoryPicker: Send + Sync {
    fn pick(&self) -> Option<PathBuf>;
}

pub struct DirectoryProvider {
    root: RwLock<Option<PathBuf>>,
    picker: Option<Box<dyn DirectoryPicker>>,
}

impl DirectoryProvider {
    /// Provider bound to a known directory (e.g. restored from settings)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: RwLock::new(Some(root.into())),
            picker: None,
        }
    }

    /// Provider that asks `picker` for a directory on `enable()`
    pub fn with_picker(picker: Box<dyn DirectoryPicker>) -> Self {
        Self {
            root: RwLock::new(None),
            picker: Some(picker),
        }
    }

    pub async fn root(&self) -> Result<PathBuf> {
        self.root
            .read()
            .await
            .clone()
            .ok_or_else(|| BackupError::Config("no backup directory selected".to_string()))
    }

    async fn resolve(&self, rel: &str) -> Result<(PathBuf, String)> {
        let segments = paths::normalize(rel)?;
        let canonical = segments.join("/");
        let mut full = self.root().await?;
        for segment in segments {
            full.push(segment);
        }
        Ok((full, canonical))
    }

    async fn write_atomic(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        let (target, canonical) = self.resolve(rel).await?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| BackupError::UnsafePath(canonical.clone()))?;
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| BackupError::UnsafePath(canonical.clone()))?;
        let tmp = parent.join(format!("{TMP_PREFIX}{file_name}"));

        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| BackupError::from_io(e, &canonical))?;

        if let Err(e) = write_and_sync(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(BackupError::from_io(e, &canonical));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(BackupError::from_io(e, &canonical));
        }

        debug!(path = %canonical, bytes = bytes.len(), "Wrote blob");
        Ok(())
    }
}

async fn write_and_sync(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Remove `.tmp_` leftovers from interrupted writes. Returns how many went.
pub(crate) fn sweep_tmp_files(root: &Path) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if !entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(
                path = %entry.path().display(),
                error = %e,
                "Failed to remove temp file"
            ),
        }
    }
    removed
}

#[async_trait]
impl StorageProvider for DirectoryProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Directory
    }

    fn is_supported(&self) -> bool {
        true
    }

    async fn enable(&self) -> Result<String> {
        let current = self.root.read().await.clone();
        let root = match current {
            Some(root) => root,
            None => self
                .picker
                .as_ref()
                .and_then(|p| p.pick())
                .ok_or(BackupError::SetupCancelled)?,
        };

        let label = root.display().to_string();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| BackupError::from_io(e, &label))?;

        let sweep_root = root.clone();
        let removed = tokio::task::spawn_blocking(move || sweep_tmp_files(&sweep_root))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?;
        if removed > 0 {
            info!(removed, root = %label, "Removed leftover temp files");
        }

        *self.root.write().await = Some(root);
        self.verify_access().await?;

        info!(root = %label, "Directory backups enabled");
        Ok(label)
    }

    async fn verify_access(&self) -> Result<()> {
        let root = self.root().await?;
        let label = root.display().to_string();

        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(BackupError::Config(format!("{label} is not a directory"))),
            Err(e) => {
                return Err(BackupError::Permission(format!(
                    "backup directory {label} is unavailable: {e}"
                )))
            }
        }

        let probe = root.join(PROBE_FILE);
        write_and_sync(&probe, b"ok")
            .await
            .map_err(|e| match BackupError::from_io(e, &label) {
                BackupError::NotFound(p) => BackupError::Permission(format!("{p} disappeared")),
                other => other,
            })?;
        tokio::fs::remove_file(&probe)
            .await
            .map_err(|e| BackupError::from_io(e, &label))?;
        Ok(())
    }

    async fn write_snapshot(&self, entry: &SnapshotEntry, bytes: &[u8]) -> Result<()> {
        self.write_atomic(&entry.path, bytes).await
    }

    async fn write_manifest(&self, manifest: &BackupManifest) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        self.write_atomic(MANIFEST_FILE, &bytes).await
    }

    async fn read_manifest(&self) -> Result<Option<BackupManifest>> {
        let (path, _) = self.resolve(MANIFEST_FILE).await?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackupError::from_io(e, MANIFEST_FILE)),
        };
        let raw: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| BackupError::Config(format!("manifest is not valid JSON: {e}")))?;
        validate_manifest(&raw).map(Some)
    }

    async fn read_snapshot(&self, path: &str) -> Result<Vec<u8>> {
        let (full, canonical) = self.resolve(path).await?;
        tokio::fs::read(&full)
            .await
            .map_err(|e| BackupError::from_io(e, &canonical))
    }

    async fn delete_snapshots(&self, paths: &[String]) -> Result<()> {
        let mut resolved = Vec::with_capacity(paths.len());
        for path in paths {
            resolved.push(self.resolve(path).await?);
        }

        for (full, canonical) in resolved {
            match tokio::fs::remove_file(&full).await {
                Ok(()) => debug!(path = %canonical, "Deleted snapshot"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %canonical, "Snapshot already gone");
                }
                Err(e) => return Err(BackupError::from_io(e, &canonical)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::entry;
    use crate::manifest::GLOBAL_SCOPE;
    use tempfile::TempDir;

    struct Cancelled;

    impl DirectoryPicker for Cancelled {
        fn pick(&self) -> Option<PathBuf> {
            None
        }
    }

    struct Fixed(PathBuf);

    impl DirectoryPicker for Fixed {
        fn pick(&self) -> Option<PathBuf> {
            Some(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_write_and_read_snapshot() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let provider = DirectoryProvider::new(temp_dir.path());
        provider.enable().await?;

        let e = entry("0a1b2c3d4e5f6071", 1);
        provider.write_snapshot(&e, b"blob-bytes").await?;

        assert_eq!(provider.read_snapshot(&e.path).await?, b"blob-bytes");
        assert!(temp_dir.path().join(&e.path).is_file());
        Ok(())
    }

    #[tokio::test]
    async fn test_no_tmp_file_remains_after_write() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let provider = DirectoryProvider::new(temp_dir.path());
        let e = entry("0a1b2c3d4e5f6071", 1);
        provider.write_snapshot(&e, b"x").await?;

        let leftovers = WalkDir::new(temp_dir.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TMP_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_legacy_global_alias_read_and_delete() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let provider = DirectoryProvider::new(temp_dir.path());

        let global = entry(GLOBAL_SCOPE, 1);
        provider.write_snapshot(&global, b"global-bytes").await?;
        let legacy = global.path.replacen("sessions/", "", 1);
        assert!(legacy.starts_with("global/"));

        assert_eq!(provider.read_snapshot(&legacy).await?, b"global-bytes");
        provider.delete_snapshots(&[legacy]).await?;
        let err = provider.read_snapshot(&global.path).await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_mixed_canonical_and_legacy_deletion() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let provider = DirectoryProvider::new(temp_dir.path());

        let first = entry(GLOBAL_SCOPE, 1);
        let second = entry(GLOBAL_SCOPE, 2);
        provider.write_snapshot(&first, b"1").await?;
        provider.write_snapshot(&second, b"2").await?;

        provider
            .delete_snapshots(&[first.path.clone(), second.path.replacen("sessions/", "", 1)])
            .await?;

        assert!(!temp_dir.path().join(&first.path).exists());
        assert!(!temp_dir.path().join(&second.path).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_an_error() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let provider = DirectoryProvider::new(temp_dir.path());
        provider
            .delete_snapshots(&["sessions/abc/never_written.json.gz".to_string()])
            .await
    }

    #[tokio::test]
    async fn test_unsafe_paths_never_touch_disk() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let inner = temp_dir.path().join("store");
        let provider = DirectoryProvider::new(&inner);
        provider.enable().await?;
        std::fs::write(temp_dir.path().join("victim.txt"), b"keep")?;

        let err = provider
            .delete_snapshots(&[
                "sessions/ok/a.json.gz".to_string(),
                "../victim.txt".to_string(),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::UnsafePath(_)));
        assert!(temp_dir.path().join("victim.txt").exists());

        let mut bad = entry("abc", 1);
        bad.path = "sessions/../../escape.json.gz".to_string();
        assert!(provider.write_snapshot(&bad, b"x").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_enable_sweeps_leftover_tmp_files() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let scope_dir = temp_dir.path().join("sessions").join("abc");
        std::fs::create_dir_all(&scope_dir)?;
        let leftover = scope_dir.join(".tmp_20261015T120000000Z_scheduled.json.gz");
        let complete = scope_dir.join("20261015T110000000Z_scheduled.json.gz");
        std::fs::write(&leftover, b"half")?;
        std::fs::write(&complete, b"whole")?;

        let provider = DirectoryProvider::new(temp_dir.path());
        provider.enable().await?;

        assert!(!leftover.exists());
        assert!(complete.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_manifest_round_trip_and_absence() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let provider = DirectoryProvider::new(temp_dir.path());
        assert!(provider.read_manifest().await?.is_none());

        let mut manifest = BackupManifest::default();
        manifest.push(entry("abc", 1));
        provider.write_manifest(&manifest).await?;
        assert_eq!(provider.read_manifest().await?, Some(manifest));

        std::fs::write(temp_dir.path().join(MANIFEST_FILE), b"{\"version\":7}")?;
        assert!(matches!(provider.read_manifest().await, Err(BackupError::Config(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_enable_with_picker() -> Result<()> {
        let cancelled = DirectoryProvider::with_picker(Box::new(Cancelled));
        assert!(matches!(cancelled.enable().await, Err(BackupError::SetupCancelled)));

        let temp_dir = TempDir::new()?;
        let target = temp_dir.path().join("picked");
        let provider = DirectoryProvider::with_picker(Box::new(Fixed(target.clone())));
        let label = provider.enable().await?;
        assert_eq!(label, target.display().to_string());
        assert!(target.is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn test_verify_access_reports_lost_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("removable");
        let provider = DirectoryProvider::new(&root);
        provider.enable().await?;
        provider.verify_access().await?;

        std::fs::remove_dir_all(&root)?;
        assert!(provider.verify_access().await.unwrap_err().is_permission());
        Ok(())
    }
}
