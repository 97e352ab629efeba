use super::{format_size, load_manifest};
use autosave_core::{DirectoryProvider, SnapshotEntry};
use std::path::Path;

pub async fn run(dir: &Path) -> anyhow::Result<()> {
    let provider = DirectoryProvider::new(dir);
    let manifest = load_manifest(&provider, dir).await?;

    let mut entries: Vec<&SnapshotEntry> = manifest.entries().collect();
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    println!(
        "{:<24} {:<14} {:<28} {:>10}  {}",
        "CREATED", "REASON", "LABEL", "SIZE", "PATH"
    );
    for entry in &entries {
        println!(
            "{:<24} {:<14} {:<28} {:>10}  {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.reason,
            truncate(entry.label.as_deref().unwrap_or("-"), 28),
            format_size(entry.size),
            entry.path
        );
    }
    println!(
        "{} snapshot(s): {} session, {} global",
        entries.len(),
        manifest.sessions.len(),
        manifest.global.len()
    );
    Ok(())
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("Épisode très long", 8), "Épisode…");
    }
}
