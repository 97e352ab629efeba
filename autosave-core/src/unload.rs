//! "Dirty at unload" marker kept outside the backup store.
//!
//! Written on teardown only when unsaved changes exist, and consumed by the
//! restore path on the next start.

use crate::state::write_file_atomic;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnloadMarker {
    pub dirty_at: DateTime<Utc>,
    /// Display names of the scopes that were dirty
    pub scopes: Vec<String>,
}

pub async fn write_marker(path: &Path, marker: &UnloadMarker) -> Result<()> {
    let bytes = serde_json::to_vec(marker)?;
    write_file_atomic(path, &bytes).await
}

/// Read and remove the marker. A corrupt marker is discarded.
pub async fn take_marker(path: &Path) -> Result<Option<UnloadMarker>> {
    let label = path.display().to_string();
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BackupError::from_io(e, &label)),
    };
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %label, error = %e, "Failed to remove unload marker");
    }
    match serde_json::from_slice(&bytes) {
        Ok(marker) => Ok(Some(marker)),
        Err(e) => {
            warn!(path = %label, error = %e, "Discarding unreadable unload marker");
            Ok(None)
        }
    }
}
