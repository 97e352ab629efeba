use super::load_manifest;
use anyhow::Context;
use autosave_core::{verify_snapshot, DirectoryProvider, ManualExportProvider, StorageProvider};
use std::path::Path;

/// Hand one stored snapshot to the manual-export backend and download it.
pub async fn run(dir: &Path, entry: &str, to: &Path) -> anyhow::Result<()> {
    let source = DirectoryProvider::new(dir);
    let manifest = load_manifest(&source, dir).await?;
    let entry = manifest
        .find(entry)
        .with_context(|| format!("{entry} is not listed in the manifest"))?;

    verify_snapshot(&source, entry).await?;
    let bytes = source.read_snapshot(&entry.path).await?;

    let export = ManualExportProvider::new();
    export.write_snapshot(entry, &bytes).await?;
    let written = export
        .trigger_download(to)
        .await?
        .context("nothing queued for download")?;

    println!("Exported {} to {}", entry.path, written.display());
    Ok(())
}
