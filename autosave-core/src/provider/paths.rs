//! Relative path validation for backup locations.
//!
//! Every path handed to a provider is checked here before any filesystem
//! call. The legacy `global/...` layout is accepted for reads and deletes and
//! normalized to `sessions/global/...`; it is never produced for writes.

use crate::manifest::GLOBAL_SCOPE;
use crate::utils::errors::{BackupError, Result};

pub const TMP_PREFIX: &str = ".tmp_";

/// Validate `path` and return its canonical segment list.
pub fn normalize(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Err(BackupError::UnsafePath("empty path".to_string()));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(BackupError::UnsafePath(path.to_string()));
    }

    let mut segments = Vec::new();
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." || !is_safe_segment(segment) {
            return Err(BackupError::UnsafePath(path.to_string()));
        }
        segments.push(segment);
    }

    if segments.first() == Some(&GLOBAL_SCOPE) {
        segments.insert(0, "sessions");
    }
    Ok(segments)
}

/// Canonical string form of `path`.
pub fn canonical(path: &str) -> Result<String> {
    Ok(normalize(path)?.join("/"))
}

fn is_safe_segment(segment: &str) -> bool {
    segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_paths_pass_through() {
        assert_eq!(
            canonical("sessions/0a1b2c3d4e5f6071/20261015T120000000Z_scheduled.json.gz").unwrap(),
            "sessions/0a1b2c3d4e5f6071/20261015T120000000Z_scheduled.json.gz"
        );
        assert_eq!(canonical("manifest.json").unwrap(), "manifest.json");
    }

    #[test]
    fn test_legacy_global_is_normalized() {
        assert_eq!(
            canonical("global/20261015T120000000Z_manual.json.gz").unwrap(),
            "sessions/global/20261015T120000000Z_manual.json.gz"
        );
    }

    #[test]
    fn test_unsafe_paths_are_rejected() {
        for bad in [
            "",
            "/etc/passwd",
            "../outside.json",
            "sessions/../../x",
            "sessions/./x",
            "sessions\\global\\x",
            "sessions//x",
            "sessions/a b/x",
            "sessions/ünïcode/x",
            "sessions/x/",
        ] {
            assert!(
                matches!(normalize(bad), Err(BackupError::UnsafePath(_))),
                "accepted {bad:?}"
            );
        }
    }
}
