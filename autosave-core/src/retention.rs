//! Keep-newest-N retention over a manifest. Pure; performs no I/O.

use crate::manifest::{BackupManifest, SnapshotEntry};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneOutcome {
    pub manifest: BackupManifest,
    /// Paths of pruned blobs, in manifest order
    pub to_delete: Vec<String>,
}

impl PruneOutcome {
    pub fn changed(&self) -> bool {
        !self.to_delete.is_empty()
    }
}

pub fn prune(manifest: &BackupManifest, max_per_scope: usize, max_global: usize) -> PruneOutcome {
    let mut to_delete = Vec::new();

    let mut sessions = manifest.sessions.clone();
    let mut by_scope: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, entry) in manifest.sessions.iter().enumerate() {
        by_scope.entry(entry.scope.as_str()).or_default().push(idx);
    }
    let mut dropped: HashSet<usize> = HashSet::new();
    for indices in by_scope.values() {
        dropped.extend(surplus(&manifest.sessions, indices, max_per_scope));
    }
    retain_and_collect(&mut sessions, &dropped, &mut to_delete);

    let mut global = manifest.global.clone();
    let all: Vec<usize> = (0..manifest.global.len()).collect();
    let dropped: HashSet<usize> = surplus(&manifest.global, &all, max_global)
        .into_iter()
        .collect();
    retain_and_collect(&mut global, &dropped, &mut to_delete);

    PruneOutcome {
        manifest: BackupManifest {
            version: manifest.version,
            sessions,
            global,
        },
        to_delete,
    }
}

/// Indices beyond the newest `keep`. The sort is stable, so equal
/// timestamps keep their original relative order.
fn surplus(entries: &[SnapshotEntry], indices: &[usize], keep: usize) -> Vec<usize> {
    let mut ranked = indices.to_vec();
    ranked.sort_by(|a, b| entries[*b].created_at.cmp(&entries[*a].created_at));
    ranked.split_off(keep.min(ranked.len()))
}

fn retain_and_collect(
    entries: &mut Vec<SnapshotEntry>,
    dropped: &HashSet<usize>,
    out: &mut Vec<String>,
) {
    let mut idx = 0;
    entries.retain(|entry| {
        let keep = !dropped.contains(&idx);
        if !keep {
            out.push(entry.path.clone());
        }
        idx += 1;
        keep
    });
}
