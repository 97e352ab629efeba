//! Subcommand implementations.

pub mod candidate;
pub mod export;
pub mod list;
pub mod restore;
pub mod verify;
pub mod watch;

use anyhow::Context;
use autosave_core::state::StateDocument;
use autosave_core::{BackupManifest, DirectoryProvider, StorageProvider};
use std::path::Path;

/// Manifest of the directory backend at `dir`; errors when none exists yet.
pub async fn load_manifest(
    provider: &DirectoryProvider,
    dir: &Path,
) -> anyhow::Result<BackupManifest> {
    provider
        .read_manifest()
        .await
        .with_context(|| format!("reading manifest in {}", dir.display()))?
        .with_context(|| format!("no backups found in {}", dir.display()))
}

/// State document at `path`; `None` when the file does not exist yet.
pub async fn read_document(path: &Path) -> anyhow::Result<Option<StateDocument>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let doc = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing state file {}", path.display()))?;
            Ok(Some(doc))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading state file {}", path.display())),
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
