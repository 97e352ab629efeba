//! Bring a manifest back in line with what the backend actually holds.

use crate::manifest::{BackupManifest, SnapshotEntry};
use crate::provider::StorageProvider;
use crate::utils::errors::Result;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub manifest: BackupManifest,
    pub changed: bool,
}

/// Drop every entry whose blob can no longer be read.
///
/// A permission failure aborts instead: losing access says nothing about
/// whether the blobs still exist.
pub async fn reconcile(
    provider: &dyn StorageProvider,
    manifest: &BackupManifest,
) -> Result<ReconcileOutcome> {
    let sessions = readable(provider, &manifest.sessions).await?;
    let global = readable(provider, &manifest.global).await?;
    let changed =
        sessions.len() != manifest.sessions.len() || global.len() != manifest.global.len();

    Ok(ReconcileOutcome {
        manifest: BackupManifest {
            version: manifest.version,
            sessions,
            global,
        },
        changed,
    })
}

async fn readable(
    provider: &dyn StorageProvider,
    entries: &[SnapshotEntry],
) -> Result<Vec<SnapshotEntry>> {
    let mut kept = Vec::with_capacity(entries.len());
    for entry in entries {
        match provider.read_snapshot(&entry.path).await {
            Ok(_) => kept.push(entry.clone()),
            Err(e) if e.is_permission() => return Err(e),
            Err(e) => {
                warn!(
                    path = %entry.path,
                    scope = %entry.scope,
                    error = %e,
                    "Dropping stale manifest entry"
                );
            }
        }
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::entry;
    use crate::manifest::GLOBAL_SCOPE;
    use crate::provider::DirectoryProvider;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_drops_missing_blobs() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let provider = DirectoryProvider::new(temp_dir.path());

        let present = entry("aaa", 1);
        let missing = entry("aaa", 2);
        let global = entry(GLOBAL_SCOPE, 1);
        provider.write_snapshot(&present, b"p").await?;
        provider.write_snapshot(&global, b"g").await?;

        let mut manifest = BackupManifest::default();
        manifest.push(present.clone());
        manifest.push(missing);
        manifest.push(global.clone());

        let outcome = reconcile(&provider, &manifest).await?;
        assert!(outcome.changed);
        assert_eq!(outcome.manifest.sessions, vec![present]);
        assert_eq!(outcome.manifest.global, vec![global]);
        Ok(())
    }

    #[tokio::test]
    async fn test_in_sync_manifest_is_unchanged() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let provider = DirectoryProvider::new(temp_dir.path());
        let e = entry("aaa", 1);
        provider.write_snapshot(&e, b"p").await?;

        let mut manifest = BackupManifest::default();
        manifest.push(e);

        let outcome = reconcile(&provider, &manifest).await?;
        assert!(!outcome.changed);
        assert_eq!(outcome.manifest, manifest);
        Ok(())
    }
}
