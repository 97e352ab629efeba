//! Utility modules shared by the backup core.

pub mod errors;
pub mod logger;

pub use errors::{BackupError, Result};
