use super::read_document;
use autosave_core::{DirectoryProvider, MemoryStateStore, RestoreProbe};
use std::path::Path;

/// Print what a fresh start would offer to restore. Consumes the unload marker.
pub async fn run(dir: &Path, state_file: &Path, unload_marker: &Path) -> anyhow::Result<()> {
    let provider = DirectoryProvider::new(dir);
    let store = MemoryStateStore::new();
    if let Some(doc) = read_document(state_file).await? {
        store.replace_document(doc).await;
    }

    let probe = RestoreProbe::with_marker(unload_marker);
    match probe.find_candidate(&provider, &store).await {
        Some(candidate) => {
            println!("Restore candidate: {}", candidate.label);
            println!("  path:    {}", candidate.entry.path);
            println!("  created: {}", candidate.entry.created_at.to_rfc3339());
            println!("  age:     {} min", candidate.elapsed.num_minutes());
            if candidate.unclean_shutdown {
                println!("  the previous run stopped with unsaved changes");
            }
        }
        None => println!("No restore candidate"),
    }
    Ok(())
}
