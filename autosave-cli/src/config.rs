//! Configuration for the `autosave` binary.
//!
//! Loaded from a TOML file, then overridden by environment variables (a
//! `.env` file is honoured), then by command-line flags in `main`.

use autosave_core::BackupConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Backup behaviour; keys use the same camelCase names as the stored settings
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory backend root
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// JSON state document being protected
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Left behind when the watcher stops with unsaved changes
    #[serde(default = "default_unload_marker")]
    pub unload_marker: PathBuf,

    /// Download target for the manual-export backend
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("autosave-backups")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("autosave-state.json")
}

fn default_unload_marker() -> PathBuf {
    PathBuf::from(".autosave-unload.json")
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("autosave-exports")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            state_file: default_state_file(),
            unload_marker: default_unload_marker(),
            export_dir: default_export_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// File (or defaults) with environment overrides applied.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.backup.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("AUTOSAVE_BACKUP_DIR") {
            self.paths.backup_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup("AUTOSAVE_STATE_FILE") {
            self.paths.state_file = PathBuf::from(file);
        }
        if let Some(level) = lookup("AUTOSAVE_LOG_LEVEL") {
            self.log.level = level;
        }
    }
}
