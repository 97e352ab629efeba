use super::load_manifest;
use autosave_core::reconcile::reconcile;
use autosave_core::{verify_snapshot, DirectoryProvider, RestoreError};
use std::path::Path;
use tracing::info;

/// Decode every manifest entry. Fails when any snapshot is missing or corrupt.
pub async fn run(dir: &Path) -> anyhow::Result<()> {
    let provider = DirectoryProvider::new(dir);
    let manifest = load_manifest(&provider, dir).await?;

    let outcome = reconcile(&provider, &manifest).await?;
    let missing = manifest.len() - outcome.manifest.len();
    for entry in manifest.entries() {
        if outcome.manifest.find(&entry.path).is_none() {
            println!("MISSING  {}", entry.path);
        }
    }

    let mut failures = missing;
    for entry in outcome.manifest.entries() {
        match verify_snapshot(&provider, entry).await {
            Ok(snapshot) => {
                println!(
                    "OK       {}  ({} {})",
                    entry.path, snapshot.scope_key, snapshot.created_at
                );
            }
            Err(RestoreError::Integrity { reason, .. }) => {
                println!("CORRUPT  {}  {}", entry.path, reason);
                failures += 1;
            }
            Err(e) => {
                println!("ERROR    {}  {}", entry.path, e);
                failures += 1;
            }
        }
    }

    info!(total = manifest.len(), failures, "Verification finished");
    if failures > 0 {
        anyhow::bail!(
            "{failures} of {} snapshot(s) failed verification",
            manifest.len()
        );
    }
    println!("All {} snapshot(s) verified", manifest.len());
    Ok(())
}
