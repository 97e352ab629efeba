//! Snapshot catalog types.
//!
//! The manifest is serialized as `manifest.json` at the root of a backup
//! location and is the only record of which snapshots exist.

use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const MANIFEST_VERSION: u32 = 1;

/// Scope identifier used for the global settings scope.
pub const GLOBAL_SCOPE: &str = "global";

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupReason {
    Scheduled,
    Critical,
    Manual,
    Enabled,
    BeforeUnload,
}

impl BackupReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupReason::Scheduled => "scheduled",
            BackupReason::Critical => "critical",
            BackupReason::Manual => "manual",
            BackupReason::Enabled => "enabled",
            BackupReason::BeforeUnload => "before-unload",
        }
    }

    /// Routine backups stay quiet; everything else is reported to the user.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, BackupReason::Scheduled)
    }
}

impl std::fmt::Display for BackupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An independently tracked unit of content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Session(String),
    Global,
}

impl Scope {
    /// Identifier stored in the manifest and used as the directory name.
    pub fn id(&self) -> String {
        match self {
            Scope::Session(key) => scope_hash(key),
            Scope::Global => GLOBAL_SCOPE.to_string(),
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Scope::Global)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Session(key) => write!(f, "session:{key}"),
            Scope::Global => f.write_str(GLOBAL_SCOPE),
        }
    }
}

/// Stable, path-safe identifier for a session key.
pub fn scope_hash(session_key: &str) -> String {
    let digest = Sha256::digest(session_key.as_bytes());
    hex::encode(&digest[..8])
}

/// One stored snapshot blob. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    /// Path relative to the backup location root
    pub path: String,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reason: BackupReason,
    pub app_version: String,
    pub schema_version: u32,
    pub size: u64,
    pub checksum: String,
}

impl SnapshotEntry {
    pub fn is_global(&self) -> bool {
        self.scope == GLOBAL_SCOPE
    }

    /// File name component of `path`.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Relative storage path for a new snapshot of `scope_id`.
pub fn snapshot_path(scope_id: &str, created_at: DateTime<Utc>, reason: BackupReason) -> String {
    format!(
        "sessions/{scope_id}/{}_{}.json.gz",
        created_at.format("%Y%m%dT%H%M%S%3fZ"),
        reason.as_str()
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub version: u32,
    pub sessions: Vec<SnapshotEntry>,
    pub global: Vec<SnapshotEntry>,
}

impl Default for BackupManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            sessions: Vec::new(),
            global: Vec::new(),
        }
    }
}

impl BackupManifest {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.global.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len() + self.global.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.sessions.iter().chain(self.global.iter())
    }

    pub fn push(&mut self, entry: SnapshotEntry) {
        if entry.is_global() {
            self.global.push(entry);
        } else {
            self.sessions.push(entry);
        }
    }

    pub fn find(&self, path: &str) -> Option<&SnapshotEntry> {
        self.entries().find(|e| e.path == path)
    }

    /// Most recent session snapshot across all scopes.
    pub fn newest_session(&self) -> Option<&SnapshotEntry> {
        newest(self.sessions.iter())
    }

    pub fn newest_global(&self) -> Option<&SnapshotEntry> {
        newest(self.global.iter())
    }

    /// Latest `created_at` recorded for `scope_id`.
    pub fn last_created_at(&self, scope_id: &str) -> Option<DateTime<Utc>> {
        self.entries()
            .filter(|e| e.scope == scope_id)
            .map(|e| e.created_at)
            .max()
    }

    /// Best older replacement for `failed`: same list, not newer, not itself.
    /// Entries from the same scope are preferred over other scopes.
    pub fn next_older(&self, failed: &SnapshotEntry) -> Option<&SnapshotEntry> {
        let list = if failed.is_global() {
            &self.global
        } else {
            &self.sessions
        };
        list.iter()
            .filter(|e| e.path != failed.path && e.created_at <= failed.created_at)
            .max_by_key(|e| (e.scope == failed.scope, e.created_at))
    }
}

fn newest<'a>(entries: impl Iterator<Item = &'a SnapshotEntry>) -> Option<&'a SnapshotEntry> {
    // Later insertion wins ties.
    entries.fold(None, |best: Option<&SnapshotEntry>, e| match best {
        Some(b) if b.created_at > e.created_at => Some(b),
        _ => Some(e),
    })
}

const REQUIRED_ENTRY_FIELDS: &[&str] = &[
    "path",
    "scope",
    "createdAt",
    "reason",
    "appVersion",
    "checksum",
];

/// Structural validation of a raw manifest document.
///
/// Accepts only the current version tag, requires both entry lists to be
/// arrays and every entry to carry the required non-empty fields.
pub fn validate_manifest(raw: &Value) -> Result<BackupManifest> {
    let obj = raw
        .as_object()
        .ok_or_else(|| BackupError::Config("manifest is not an object".to_string()))?;

    let version = obj.get("version").and_then(Value::as_u64);
    if version != Some(u64::from(MANIFEST_VERSION)) {
        return Err(BackupError::Config(format!("unsupported manifest version: {version:?}")));
    }

    for list in ["sessions", "global"] {
        let entries = obj
            .get(list)
            .and_then(Value::as_array)
            .ok_or_else(|| BackupError::Config(format!("manifest `{list}` is not an array")))?;
        for (idx, entry) in entries.iter().enumerate() {
            for field in REQUIRED_ENTRY_FIELDS {
                let present = entry
                    .get(field)
                    .and_then(Value::as_str)
                    .is_some_and(|s| !s.is_empty());
                if !present {
                    return Err(BackupError::Config(format!(
                        "manifest `{list}[{idx}]` is missing `{field}`"
                    )));
                }
            }
        }
    }

    serde_json::from_value(raw.clone())
        .map_err(|e| BackupError::Config(format!("malformed manifest: {e}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn entry(scope: &str, minute: u32) -> SnapshotEntry {
        let created_at = Utc.with_ymd_and_hms(2026, 10, 15, 12, minute, 0).unwrap();
        SnapshotEntry {
            path: snapshot_path(scope, created_at, BackupReason::Scheduled),
            scope: scope.to_string(),
            label: Some(format!("{scope} @ {minute}")),
            created_at,
            reason: BackupReason::Scheduled,
            app_version: "1.0.0".to_string(),
            schema_version: 1,
            size: 128,
            checksum: "ab".repeat(32),
        }
    }

    #[test]
    fn test_scope_hash_is_stable_and_path_safe() {
        let a = scope_hash("interview-2026.mp3");
        assert_eq!(a, scope_hash("interview-2026.mp3"));
        assert_ne!(a, scope_hash("Interview-2026.mp3"));
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_snapshot_path_layout() {
        let created = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            snapshot_path("global", created, BackupReason::BeforeUnload),
            "sessions/global/20260102T030405000Z_before-unload.json.gz"
        );
    }

    #[test]
    fn test_next_older_prefers_same_scope() {
        let mut manifest = BackupManifest::default();
        manifest.push(entry("aaa", 1));
        manifest.push(entry("bbb", 2));
        manifest.push(entry("aaa", 3));
        let failed = entry("aaa", 5);
        manifest.push(failed.clone());

        let fallback = manifest.next_older(&failed).unwrap();
        assert_eq!(fallback.scope, "aaa");
        assert_eq!(fallback.created_at, entry("aaa", 3).created_at);
    }

    #[test]
    fn test_validate_manifest_accepts_serialized() {
        let mut manifest = BackupManifest::default();
        manifest.push(entry("aaa", 1));
        manifest.push(entry(GLOBAL_SCOPE, 2));
        let raw = serde_json::to_value(&manifest).unwrap();
        assert_eq!(validate_manifest(&raw).unwrap(), manifest);
    }

    #[test]
    fn test_validate_manifest_rejects_bad_shapes() {
        let wrong_version = serde_json::json!({"version": 99, "sessions": [], "global": []});
        assert!(matches!(validate_manifest(&wrong_version), Err(BackupError::Config(_))));

        let not_array = serde_json::json!({"version": 1, "sessions": {}, "global": []});
        assert!(validate_manifest(&not_array).is_err());

        let mut blank = serde_json::to_value(entry("aaa", 1)).unwrap();
        blank["checksum"] = Value::String(String::new());
        let missing_field = serde_json::json!({"version": 1, "sessions": [blank], "global": []});
        assert!(validate_manifest(&missing_field).is_err());
    }
}
