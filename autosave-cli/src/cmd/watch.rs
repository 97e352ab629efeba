//! Long-running host: protects a JSON state file with scheduled backups.

use super::read_document;
use crate::config::{AppConfig, PathsConfig};
use crate::shutdown::shutdown_signal;
use autosave_core::unload;
use autosave_core::{
    BackendKind, BackupEvent, BackupReason, BackupScheduler, DirectoryProvider, EventBus,
    ManualExportProvider, MemoryStateStore, RestoreProbe, SchedulerOptions, StorageProvider,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATE_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let paths = config.paths.clone();

    let store = Arc::new(MemoryStateStore::new());
    let mut modified = None;
    reload_if_changed(&store, &paths.state_file, &mut modified).await?;

    let export = match config.backup.backend {
        BackendKind::ManualExport => Some(Arc::new(ManualExportProvider::new())),
        BackendKind::Directory => None,
    };
    let provider: Arc<dyn StorageProvider> = match &export {
        Some(export) => export.clone(),
        None => Arc::new(DirectoryProvider::new(&paths.backup_dir)),
    };

    let mut backup = config.backup;
    let label = open_backend(provider.as_ref(), backup.enabled).await?;
    info!(location = %label, "Backup location ready");
    backup.location_label = Some(label);

    let probe = RestoreProbe::with_marker(&paths.unload_marker);
    if let Some(candidate) = probe
        .find_candidate(provider.as_ref(), store.as_ref())
        .await
    {
        println!(
            "A backup from {} ago is available: {} ({}). Run `autosave restore` to recover it.",
            humanize(candidate.elapsed),
            candidate.label,
            candidate.entry.path
        );
    }

    let events = EventBus::new();
    let mut event_rx = events.subscribe();
    let scheduler = BackupScheduler::new(
        backup,
        provider.clone(),
        store.clone(),
        events,
        SchedulerOptions {
            app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            unload_marker: Some(paths.unload_marker.clone()),
        },
    );
    scheduler.refresh().await;
    scheduler.start().await;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let backend = scheduler.config().await.backend;
    info!(state_file = %paths.state_file.display(), %backend, "Watching for changes");

    let mut poll = tokio::time::interval(STATE_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = poll.tick() => {
                if let Err(e) = reload_if_changed(&store, &paths.state_file, &mut modified).await {
                    warn!("Failed to reload state file: {:#}", e);
                }
            }
            event = event_rx.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if let (Some(export), BackupEvent::BackupComplete { .. }) = (&export, &event) {
                        match export.trigger_download(&paths.export_dir).await {
                            Ok(Some(path)) => println!("Saved export to {}", path.display()),
                            Ok(None) => {}
                            Err(e) => warn!("Export download failed: {}", e),
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event listener lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    shutdown(&scheduler, provider.as_ref(), export.as_deref(), &paths).await;
    Ok(())
}

/// Refuse to run with backups disabled; otherwise prepare the location,
/// which also sweeps temp files left by an interrupted run.
async fn open_backend(provider: &dyn StorageProvider, enabled: bool) -> anyhow::Result<String> {
    if !enabled {
        anyhow::bail!("backups are disabled; set `enabled = true` in the [backup] table");
    }
    Ok(provider.enable().await?)
}

/// Leave a marker for unsaved work, try one last backup, stop the scheduler.
///
/// The marker is cleared only once the changes are durable: written by a
/// silent backend, or downloaded from the manual-export queue.
async fn shutdown(
    scheduler: &BackupScheduler,
    provider: &dyn StorageProvider,
    export: Option<&ManualExportProvider>,
    paths: &PathsConfig,
) {
    match scheduler.before_unload().await {
        Ok(true) => match scheduler.backup_now(BackupReason::BeforeUnload).await {
            Ok(report) => {
                info!(
                    batch_id = %report.batch_id,
                    written = report.written.len(),
                    "Backed up changes before exit"
                );
                let durable = match export {
                    Some(export) => match export.trigger_download(&paths.export_dir).await {
                        Ok(Some(path)) => {
                            println!("Saved export to {}", path.display());
                            true
                        }
                        Ok(None) => false,
                        Err(e) => {
                            warn!("Export download failed: {}", e);
                            false
                        }
                    },
                    None => provider.persists_silently(),
                };
                if durable {
                    if let Err(e) = unload::take_marker(&paths.unload_marker).await {
                        warn!("Failed to clear unload marker: {}", e);
                    }
                } else {
                    warn!("Changes not saved to durable storage, unsaved changes recorded");
                }
            }
            Err(e) => warn!("Backup before exit failed, unsaved changes recorded: {}", e),
        },
        Ok(false) => debug!("No unsaved changes at exit"),
        Err(e) => warn!("Failed to record unsaved changes: {}", e),
    }
    scheduler.stop().await;
}

/// Replace the store's document when the file's mtime moved.
async fn reload_if_changed(
    store: &MemoryStateStore,
    path: &Path,
    modified: &mut Option<SystemTime>,
) -> anyhow::Result<()> {
    let current = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.modified().ok(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    if current.is_none() || current == *modified {
        return Ok(());
    }

    if let Some(doc) = read_document(path).await? {
        debug!(
            sessions = doc.sessions.len(),
            "State file changed, reloading"
        );
        store.replace_document(doc).await;
    }
    *modified = current;
    Ok(())
}

fn print_event(event: &BackupEvent) {
    match event {
        BackupEvent::DirtyReminder {
            manual_export_available,
            dirty_for_secs,
        } => {
            println!("Unsaved changes for {} min.", dirty_for_secs / 60);
            if *manual_export_available {
                println!("Run `autosave export` to save a copy.");
            }
        }
        BackupEvent::BackupComplete { reason, scopes, at } => {
            println!(
                "Backup ({reason}) of {scopes} scope(s) at {}",
                at.format("%H:%M:%S")
            );
        }
        BackupEvent::StorageQuotaExceeded { message } => {
            println!("Backup location is full: {message}");
        }
        BackupEvent::BackupFailed { reason, error } => {
            println!("Backup ({reason}) failed: {error}");
        }
    }
}

fn humanize(elapsed: chrono::Duration) -> String {
    let minutes = elapsed.num_minutes().max(0);
    match minutes {
        0 => "less than a minute".to_string(),
        1..=59 => format!("{minutes} min"),
        60..=1439 => format!("{} h", minutes / 60),
        _ => format!("{} days", minutes / 1440),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autosave_core::{BackupConfig, StateSource};
    use serde_json::json;
    use tempfile::TempDir;

    struct Host {
        dir: TempDir,
        paths: PathsConfig,
        store: Arc<MemoryStateStore>,
    }

    fn host() -> Host {
        let dir = TempDir::new().unwrap();
        let paths = PathsConfig {
            backup_dir: dir.path().join("backups"),
            state_file: dir.path().join("state.json"),
            unload_marker: dir.path().join("unload.json"),
            export_dir: dir.path().join("exports"),
        };
        Host {
            dir,
            paths,
            store: Arc::new(MemoryStateStore::new()),
        }
    }

    impl Host {
        async fn scheduler(
            &self,
            backend: BackendKind,
            provider: Arc<dyn StorageProvider>,
        ) -> BackupScheduler {
            let config = BackupConfig {
                backend,
                enabled: true,
                ..BackupConfig::default()
            };
            let scheduler = BackupScheduler::new(
                config,
                provider,
                self.store.clone(),
                EventBus::new(),
                SchedulerOptions {
                    app_version: None,
                    unload_marker: Some(self.paths.unload_marker.clone()),
                },
            );
            scheduler.refresh().await;
            self.store
                .upsert_session("ep1", None, json!({ "segments": [1] }))
                .await;
            scheduler
        }

        fn exported_files(&self) -> usize {
            std::fs::read_dir(&self.paths.export_dir)
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    #[tokio::test]
    async fn test_manual_export_shutdown_downloads_before_clearing_marker() {
        let host = host();
        let export = Arc::new(ManualExportProvider::new());
        let scheduler = host
            .scheduler(BackendKind::ManualExport, export.clone())
            .await;

        shutdown(
            &scheduler,
            export.as_ref(),
            Some(export.as_ref()),
            &host.paths,
        )
        .await;

        assert_eq!(host.exported_files(), 1);
        assert!(!export.has_pending_download().await);
        assert!(!host.paths.unload_marker.exists());
    }

    #[tokio::test]
    async fn test_failed_export_keeps_unload_marker() {
        let mut host = host();
        let blocker = host.dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        host.paths.export_dir = blocker.join("exports");

        let export = Arc::new(ManualExportProvider::new());
        let scheduler = host
            .scheduler(BackendKind::ManualExport, export.clone())
            .await;

        shutdown(
            &scheduler,
            export.as_ref(),
            Some(export.as_ref()),
            &host.paths,
        )
        .await;

        assert!(export.has_pending_download().await);
        assert!(host.paths.unload_marker.exists());
    }

    #[tokio::test]
    async fn test_directory_shutdown_saves_and_clears_marker() {
        let host = host();
        std::fs::create_dir_all(&host.paths.backup_dir).unwrap();
        let provider = Arc::new(DirectoryProvider::new(&host.paths.backup_dir));
        let scheduler = host
            .scheduler(BackendKind::Directory, provider.clone())
            .await;

        shutdown(&scheduler, provider.as_ref(), None, &host.paths).await;

        assert!(host.paths.backup_dir.join("manifest.json").exists());
        assert!(!host.paths.unload_marker.exists());
    }

    #[tokio::test]
    async fn test_open_backend_respects_flag_and_sweeps_leftovers() {
        let host = host();
        let leftover = host
            .paths
            .backup_dir
            .join("sessions")
            .join("abc")
            .join(".tmp_half.json.gz");
        std::fs::create_dir_all(leftover.parent().unwrap()).unwrap();
        std::fs::write(&leftover, b"partial").unwrap();
        let provider = DirectoryProvider::new(&host.paths.backup_dir);

        assert!(open_backend(&provider, false).await.is_err());
        assert!(leftover.exists());

        let label = open_backend(&provider, true).await.unwrap();
        assert_eq!(label, host.paths.backup_dir.display().to_string());
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn test_reload_only_on_mtime_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = MemoryStateStore::new();
        let mut seen = None;

        reload_if_changed(&store, &path, &mut seen).await.unwrap();
        assert!(seen.is_none());
        assert!(!store.has_content().await);

        let doc = json!({ "sessions": { "ep1": { "content": { "segments": [1] } } } });
        std::fs::write(&path, doc.to_string()).unwrap();
        reload_if_changed(&store, &path, &mut seen).await.unwrap();
        assert!(seen.is_some());
        assert!(store.has_content().await);

        let before = store.observe().await;
        reload_if_changed(&store, &path, &mut seen).await.unwrap();
        assert_eq!(store.observe().await, before);
    }

    #[test]
    fn test_humanize() {
        assert_eq!(
            humanize(chrono::Duration::seconds(20)),
            "less than a minute"
        );
        assert_eq!(humanize(chrono::Duration::minutes(42)), "42 min");
        assert_eq!(humanize(chrono::Duration::hours(5)), "5 h");
        assert_eq!(humanize(chrono::Duration::days(3)), "3 days");
    }
}
