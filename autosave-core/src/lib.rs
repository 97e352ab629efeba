//! Automatic, integrity-checked backups of editor session state.
//!
//! The [`scheduler::BackupScheduler`] watches a [`state::StateSource`] for
//! content changes and writes compressed, checksummed snapshots through a
//! [`provider::StorageProvider`], keeping a manifest and pruning old
//! snapshots. [`restore`] finds and applies snapshots on the way back.

pub mod codec;
pub mod config;
pub mod dirty;
pub mod events;
pub mod manifest;
pub mod provider;
pub mod reconcile;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod state;
pub mod unload;
pub mod utils;

pub use config::{BackendKind, BackupConfig, TimingPolicy};
pub use events::{BackupEvent, EventBus};
pub use manifest::{BackupManifest, BackupReason, Scope, SnapshotEntry};
pub use provider::{DirectoryProvider, ManualExportProvider, StorageProvider};
pub use restore::{
    restore_snapshot, restore_with_fallback, verify_snapshot, RestoreCandidate, RestoreError,
    RestoreProbe,
};
pub use scheduler::{BackupRuntimeState, BackupScheduler, BackupStatus, SchedulerOptions};
pub use state::{MemoryStateStore, StateSource};
pub use utils::logger;
pub use utils::{BackupError, Result};
