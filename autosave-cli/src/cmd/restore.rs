use super::load_manifest;
use anyhow::Context;
use autosave_core::{
    restore_snapshot, restore_with_fallback, DirectoryProvider, MemoryStateStore, RestoreError,
};
use std::path::Path;

/// Corrupt snapshots tolerated before giving up when following fallbacks
const MAX_FALLBACK_ATTEMPTS: usize = 5;

pub async fn run(
    dir: &Path,
    entry: Option<&str>,
    out: &Path,
    follow_fallback: bool,
) -> anyhow::Result<()> {
    let provider = DirectoryProvider::new(dir);
    let manifest = load_manifest(&provider, dir).await?;

    let entry = match entry {
        Some(path) => manifest
            .find(path)
            .with_context(|| format!("{path} is not listed in the manifest"))?,
        None => manifest
            .newest_session()
            .context("no session snapshots to restore")?,
    }
    .clone();

    let store = MemoryStateStore::load(out).await?;
    let result = if follow_fallback {
        restore_with_fallback(&provider, &entry, &store, MAX_FALLBACK_ATTEMPTS).await
    } else {
        restore_snapshot(&provider, &entry, &store)
            .await
            .map(|snapshot| (entry.clone(), snapshot))
    };

    match result {
        Ok((restored, snapshot)) => {
            println!(
                "Restored {} ({}) from {} into {}",
                restored.label.as_deref().unwrap_or(&snapshot.scope_key),
                restored.created_at.format("%Y-%m-%d %H:%M:%S"),
                restored.path,
                out.display()
            );
            if restored.path != entry.path {
                println!(
                    "Note: {} was corrupt, an older snapshot was used",
                    entry.path
                );
            }
            Ok(())
        }
        Err(RestoreError::Integrity {
            failed,
            reason,
            fallback: Some(next),
        }) => anyhow::bail!(
            "{} is corrupt ({reason}); an older snapshot is available: {} (use --follow-fallback)",
            failed.path,
            next.path
        ),
        Err(e) => Err(e.into()),
    }
}
