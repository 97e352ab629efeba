//! Backup scheduler: owns dirty tracking and timing, runs backup batches.
//!
//! All triggers (hard interval, defer timer, critical requests, explicit
//! `backup_now`) converge on one batch gate. Timer-driven triggers that find
//! a batch in flight are absorbed; explicit calls wait for it and then only
//! write what is still dirty, so overlapping requests never duplicate
//! snapshots.
//!
//! Status is published on its own `watch` channel, never through the
//! application state, so publishing it cannot re-trigger change detection.

pub mod status;
pub mod timing;

pub use status::{BackupRuntimeState, BackupStatus};
pub use timing::{Decision, Phase, TimingMachine};

use crate::codec::{self, SessionSnapshot, SCHEMA_VERSION};
use crate::config::{
    BackendKind, BackupConfig, TimingPolicy, MAX_INTERVAL_MINUTES, MIN_INTERVAL_MINUTES,
};
use crate::dirty::DirtyTracker;
use crate::events::{BackupEvent, EventBus};
use crate::manifest::{
    snapshot_path, BackupManifest, BackupReason, Scope, SnapshotEntry, GLOBAL_SCOPE,
};
use crate::provider::StorageProvider;
use crate::reconcile::reconcile;
use crate::retention;
use crate::state::{ScopeContent, StateSource};
use crate::unload::{self, UnloadMarker};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMMAND_CAPACITY: usize = 32;
const GLOBAL_LABEL: &str = "Global settings";

/// Inbound requests handled by the scheduler loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    /// Back up now, skipping the grace window
    CriticalBackup,
    /// Application teardown: leave a marker if anything is unsaved
    BeforeUnload,
    SetInterval(u32),
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    /// Version recorded in every snapshot
    pub app_version: Option<String>,
    /// Where to leave the unload marker
    pub unload_marker: Option<PathBuf>,
}

/// Outcome of one batch.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub reason: BackupReason,
    pub written: Vec<SnapshotEntry>,
    pub pruned: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

struct Inner {
    config: RwLock<BackupConfig>,
    provider: Arc<dyn StorageProvider>,
    state: Arc<dyn StateSource>,
    events: EventBus,
    tracker: Mutex<DirtyTracker>,
    timing: Mutex<TimingMachine>,
    status: watch::Sender<BackupRuntimeState>,
    gate: Mutex<()>,
    reconciled: AtomicBool,
    app_version: String,
    unload_marker: Option<PathBuf>,
}

pub struct BackupScheduler {
    inner: Arc<Inner>,
    commands: mpsc::Sender<SchedulerCommand>,
    receiver: std::sync::Mutex<Option<mpsc::Receiver<SchedulerCommand>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BackupScheduler {
    pub fn new(
        config: BackupConfig,
        provider: Arc<dyn StorageProvider>,
        state: Arc<dyn StateSource>,
        events: EventBus,
        options: SchedulerOptions,
    ) -> Self {
        let (status, _) = watch::channel(BackupRuntimeState::new(config.enabled));
        let (commands, receiver) = mpsc::channel(COMMAND_CAPACITY);
        let policy = TimingPolicy::from_config(&config);

        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                provider,
                state,
                events,
                tracker: Mutex::new(DirtyTracker::new()),
                timing: Mutex::new(TimingMachine::new(policy)),
                status,
                gate: Mutex::new(()),
                reconciled: AtomicBool::new(false),
                app_version: options
                    .app_version
                    .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
                unload_marker: options.unload_marker,
            }),
            commands,
            receiver: std::sync::Mutex::new(Some(receiver)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawn the scheduling loop. Calling it twice is a no-op.
    pub async fn start(&self) {
        let receiver = match self.receiver.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(receiver) = receiver else {
            warn!("Backup scheduler already started");
            return;
        };

        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(run_loop(inner, receiver, cancel));
        *self.task.lock().await = Some(handle);
        info!("Backup scheduler started");
    }

    /// Stop the loop and wait for it. An in-flight batch runs to completion.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Backup scheduler task panicked");
            }
        }
        info!("Backup scheduler stopped");
    }

    pub fn status(&self) -> BackupRuntimeState {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<BackupRuntimeState> {
        self.inner.status.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub async fn config(&self) -> BackupConfig {
        self.inner.config.read().await.clone()
    }

    pub async fn phase(&self) -> Phase {
        let status = self.status();
        if status.is_saving {
            Phase::Saving
        } else if status.status == BackupStatus::Error {
            Phase::Error
        } else if self.inner.timing.lock().await.is_deferred() {
            Phase::Deferred
        } else if self.inner.tracker.lock().await.any_dirty() {
            Phase::Dirty
        } else {
            Phase::Idle
        }
    }

    /// Feed the current application state into the dirty tracker.
    pub async fn refresh(&self) -> bool {
        self.inner.refresh().await
    }

    pub async fn send(&self, command: SchedulerCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BackupError::Config("backup scheduler is not running".to_string()))
    }

    pub async fn request_critical(&self) -> Result<()> {
        self.send(SchedulerCommand::CriticalBackup).await
    }

    /// Change the hard interval, clamped to the supported range.
    /// Accumulated dirty state is kept.
    pub async fn set_interval(&self, minutes: u32) -> Result<()> {
        self.inner.apply_interval(minutes).await;
        self.send(SchedulerCommand::SetInterval(minutes)).await
    }

    /// Set up the storage location and take a first full backup.
    ///
    /// Returns the location label, which is also recorded in the config.
    pub async fn enable(&self) -> Result<String> {
        let provider = &self.inner.provider;
        if !provider.is_supported() {
            return Err(BackupError::Config(format!(
                "{} backups are not supported here",
                provider.kind()
            )));
        }
        let label = provider.enable().await?;

        {
            let mut config = self.inner.config.write().await;
            config.enabled = true;
            config.backend = provider.kind();
            config.location_label = Some(label.clone());
        }
        self.inner.reconciled.store(false, Ordering::SeqCst);
        self.inner.status.send_modify(|s| {
            s.status = BackupStatus::Enabled;
            s.last_error = None;
        });
        info!(backend = %provider.kind(), location = %label, "Backups enabled");

        let _gate = self.inner.gate.lock().await;
        self.inner.run_batch(BackupReason::Enabled, true).await?;
        Ok(label)
    }

    pub async fn disable(&self) {
        self.inner.config.write().await.enabled = false;
        self.inner.status.send_modify(|s| {
            s.status = BackupStatus::Disabled;
            s.is_saving = false;
        });
        info!("Backups disabled");
    }

    /// User-initiated backup. Waits for any in-flight batch, then writes
    /// whatever is still dirty and reports the result synchronously.
    pub async fn backup_now(&self, reason: BackupReason) -> Result<BatchReport> {
        let _gate = self.inner.gate.lock().await;
        let result = self.inner.run_batch(reason, false).await;
        self.inner.timing.lock().await.backup_finished();
        result
    }

    /// Trigger-style backup: absorbed when a batch is already running.
    pub async fn trigger(&self, reason: BackupReason) {
        self.inner.trigger(reason).await;
    }

    /// Leave an unload marker if anything is unsaved. Returns whether one was written.
    pub async fn before_unload(&self) -> Result<bool> {
        self.inner.before_unload().await
    }

    /// Emit a reminder if warranted at `now`. Returns whether one was sent.
    pub async fn check_reminder_at(&self, now: Instant) -> bool {
        self.inner.check_reminder_at(now).await
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reads tokio's clock so deadlines agree with the loop timers.
fn clock_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn run_loop(
    inner: Arc<Inner>,
    mut commands: mpsc::Receiver<SchedulerCommand>,
    cancel: CancellationToken,
) {
    let mut changes = inner.state.subscribe();
    inner.refresh().await;

    let policy = *inner.timing.lock().await.policy();
    let mut interval = ticker(policy.interval);
    let mut reminder = ticker(policy.reminder_period);
    let far_future = Duration::from_secs(365 * 24 * 3600);
    let defer = tokio::time::sleep(far_future);
    tokio::pin!(defer);
    let mut defer_armed = false;
    let mut state_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            changed = changes.changed(), if state_open => {
                if changed.is_err() {
                    debug!("State source closed; no further change notifications");
                    state_open = false;
                } else {
                    inner.refresh().await;
                }
            }

            _ = interval.tick() => {
                inner.resume_if_paused().await;
                let decision = inner.decide(false).await;
                defer_armed = false;
                if let Some(until) = inner.apply_decision(decision).await {
                    defer.as_mut().reset(tokio::time::Instant::from_std(until));
                    defer_armed = true;
                }
            }

            _ = &mut defer, if defer_armed => {
                defer_armed = false;
                let decision = inner.decide(true).await;
                if let Some(until) = inner.apply_decision(decision).await {
                    defer.as_mut().reset(tokio::time::Instant::from_std(until));
                    defer_armed = true;
                }
            }

            _ = reminder.tick() => {
                inner.check_reminder_at(clock_now()).await;
            }

            Some(command) = commands.recv() => match command {
                SchedulerCommand::CriticalBackup => {
                    defer_armed = false;
                    inner.trigger(BackupReason::Critical).await;
                }
                SchedulerCommand::BeforeUnload => {
                    if let Err(e) = inner.before_unload().await {
                        warn!(error = %e, "Failed to record unload marker");
                    }
                }
                SchedulerCommand::SetInterval(minutes) => {
                    let period = inner.apply_interval(minutes).await;
                    interval = ticker(period);
                    debug!(minutes, "Hard interval timer restarted");
                }
            },
        }
    }
    debug!("Backup scheduler loop exited");
}

impl Inner {
    async fn refresh(&self) -> bool {
        let observation = self.state.observe().await;
        let dirty = self.tracker.lock().await.observe(&observation, clock_now());
        self.status.send_if_modified(|s| {
            let changed = s.is_dirty != dirty;
            s.is_dirty = dirty;
            changed
        });
        dirty
    }

    async fn apply_interval(&self, minutes: u32) -> Duration {
        let clamped = minutes.clamp(MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES);
        if clamped != minutes {
            warn!(
                requested = minutes,
                applied = clamped,
                "Backup interval out of range"
            );
        }
        let mut config = self.config.write().await;
        config.interval_minutes = clamped;
        let policy = TimingPolicy::from_config(&config);
        self.timing.lock().await.set_policy(policy);
        policy.interval
    }

    async fn decide(&self, from_defer: bool) -> Decision {
        let now = clock_now();
        let (dirty, last_change) = {
            let tracker = self.tracker.lock().await;
            (tracker.any_dirty(), tracker.last_change())
        };
        let mut timing = self.timing.lock().await;
        if from_defer {
            timing.on_defer_at(now, dirty, last_change)
        } else {
            timing.on_interval_at(now, dirty, last_change)
        }
    }

    /// Returns the instant to re-evaluate at when deferred.
    async fn apply_decision(&self, decision: Decision) -> Option<Instant> {
        match decision {
            Decision::Idle => None,
            Decision::Defer { until } => {
                debug!(
                    in_secs = until.saturating_duration_since(clock_now()).as_secs(),
                    "Content still changing, deferring backup"
                );
                Some(until)
            }
            Decision::Backup => {
                self.trigger(BackupReason::Scheduled).await;
                None
            }
        }
    }

    async fn resume_if_paused(&self) {
        if self.status.borrow().status != BackupStatus::Paused {
            return;
        }
        match self.provider.verify_access().await {
            Ok(()) => {
                info!("Backup location accessible again");
                self.status.send_modify(|s| {
                    s.status = BackupStatus::Enabled;
                    s.last_error = None;
                });
            }
            Err(e) => debug!(error = %e, "Backup location still unavailable"),
        }
    }

    async fn trigger(&self, reason: BackupReason) {
        if !self.config.read().await.enabled {
            return;
        }
        if reason == BackupReason::Scheduled && !self.provider.persists_silently() {
            debug!(
                backend = %self.provider.kind(),
                "Backend needs user action, skipping scheduled backup"
            );
            self.timing.lock().await.backup_finished();
            return;
        }
        let Ok(_gate) = self.gate.try_lock() else {
            debug!(reason = %reason, "Backup already in flight, trigger absorbed");
            return;
        };
        if let Err(e) = self.run_batch(reason, false).await {
            debug!(reason = %reason, error = %e, "Triggered backup failed");
        }
        self.timing.lock().await.backup_finished();
    }

    /// Run one batch. The caller must hold `gate`.
    async fn run_batch(&self, reason: BackupReason, force: bool) -> Result<BatchReport> {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return Err(BackupError::Config("backups are disabled".to_string()));
        }

        self.refresh().await;
        let scopes: Vec<Scope> = {
            let tracker = self.tracker.lock().await;
            let candidates = if force {
                tracker.all_scopes()
            } else {
                tracker.dirty_scopes()
            };
            candidates
                .into_iter()
                .filter(|s| config.include_global || !s.is_global())
                .collect()
        };

        let batch_id = Uuid::new_v4();
        if scopes.is_empty() {
            debug!(%batch_id, reason = %reason, "Nothing to back up");
            return Ok(BatchReport {
                batch_id,
                reason,
                written: Vec::new(),
                pruned: Vec::new(),
                completed_at: Utc::now(),
            });
        }

        self.status.send_modify(|s| s.is_saving = true);
        info!(%batch_id, reason = %reason, scopes = scopes.len(), "Starting backup batch");

        // Only a failed access check pauses; later failures are ordinary batch errors.
        let (result, access_lost) = match self.provider.verify_access().await {
            Ok(()) => (self.execute_batch(batch_id, reason, &config, &scopes).await, false),
            Err(e) => {
                let lost = e.is_permission();
                (Err(e), lost)
            }
        };
        match &result {
            Ok(report) => {
                let dirty = self.tracker.lock().await.any_dirty();
                self.status.send_modify(|s| {
                    s.status = BackupStatus::Enabled;
                    s.is_saving = false;
                    s.is_dirty = dirty;
                    s.last_backup_at = Some(report.completed_at);
                    s.last_error = None;
                });
                info!(
                    %batch_id,
                    reason = %reason,
                    written = report.written.len(),
                    pruned = report.pruned.len(),
                    "Backup batch completed"
                );
                if reason.is_user_visible() {
                    self.events.publish(BackupEvent::BackupComplete {
                        reason,
                        scopes: report.written.len(),
                        at: report.completed_at,
                    });
                }
            }
            Err(e) => {
                let message = e.to_string();
                let status = if access_lost {
                    BackupStatus::Paused
                } else {
                    BackupStatus::Error
                };
                self.status.send_modify(|s| {
                    s.status = status;
                    s.is_saving = false;
                    s.last_error = Some(message.clone());
                });
                error!(%batch_id, reason = %reason, error = %message, "Backup batch failed");
                if e.is_quota() {
                    self.events.publish(BackupEvent::StorageQuotaExceeded {
                        message: message.clone(),
                    });
                }
                self.events.publish(BackupEvent::BackupFailed {
                    reason,
                    error: message,
                });
            }
        }
        result
    }

    async fn execute_batch(
        &self,
        batch_id: Uuid,
        reason: BackupReason,
        config: &BackupConfig,
        scopes: &[Scope],
    ) -> Result<BatchReport> {
        let mut manifest = match self.provider.read_manifest().await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => BackupManifest::default(),
            Err(BackupError::Config(msg)) => {
                warn!(%batch_id, error = %msg, "Existing manifest is invalid, starting a new one");
                BackupManifest::default()
            }
            Err(e) => return Err(e),
        };

        if !self.reconciled.load(Ordering::SeqCst) {
            let outcome = reconcile(self.provider.as_ref(), &manifest).await?;
            if outcome.changed {
                info!(
                    %batch_id,
                    dropped = manifest.len() - outcome.manifest.len(),
                    "Reconciled manifest with backup location"
                );
                manifest = outcome.manifest;
            }
            self.reconciled.store(true, Ordering::SeqCst);
        }

        let mut written = Vec::with_capacity(scopes.len());
        let mut captured = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let content = match scope {
                Scope::Session(key) => match self.state.session_content(key).await? {
                    Some(content) => content,
                    None => {
                        debug!(%batch_id, scope = %scope, "Session closed before backup, skipping");
                        continue;
                    }
                },
                Scope::Global => self.state.global_content().await?,
            };
            let fingerprint = content.fingerprint.clone();
            let entry = self
                .write_scope(&mut manifest, scope, content, reason)
                .await?;
            debug!(
                %batch_id,
                scope = %scope,
                path = %entry.path,
                size = entry.size,
                "Snapshot written"
            );
            captured.push((scope.clone(), fingerprint));
            written.push(entry);
        }

        let outcome = retention::prune(
            &manifest,
            config.retention_per_scope(),
            config.retention_global(),
        );
        self.provider.write_manifest(&outcome.manifest).await?;

        {
            let mut tracker = self.tracker.lock().await;
            for (scope, fingerprint) in &captured {
                tracker.mark_backed_up(scope, fingerprint);
            }
        }

        if outcome.changed() {
            if let Err(e) = self.provider.delete_snapshots(&outcome.to_delete).await {
                warn!(%batch_id, error = %e, "Failed to delete pruned snapshots");
            }
        }

        Ok(BatchReport {
            batch_id,
            reason,
            written,
            pruned: outcome.to_delete,
            completed_at: Utc::now(),
        })
    }

    async fn write_scope(
        &self,
        manifest: &mut BackupManifest,
        scope: &Scope,
        content: ScopeContent,
        reason: BackupReason,
    ) -> Result<SnapshotEntry> {
        let scope_id = scope.id();
        let created_at = next_created_at(manifest.last_created_at(&scope_id), Utc::now());

        let (scope_key, session, global, label) = match scope {
            Scope::Session(key) => (key.clone(), content.content, None, content.label),
            Scope::Global => (
                GLOBAL_SCOPE.to_string(),
                Value::Null,
                Some(content.content),
                Some(GLOBAL_LABEL.to_string()),
            ),
        };
        let snapshot = SessionSnapshot {
            schema_version: SCHEMA_VERSION,
            app_version: self.app_version.clone(),
            created_at,
            scope_key,
            reason,
            checksum: String::new(),
            session,
            global,
        };
        let encoded = codec::serialize(&snapshot)?;

        let entry = SnapshotEntry {
            path: snapshot_path(&scope_id, created_at, reason),
            scope: scope_id,
            label,
            created_at,
            reason,
            app_version: self.app_version.clone(),
            schema_version: SCHEMA_VERSION,
            size: encoded.bytes.len() as u64,
            checksum: encoded.checksum,
        };
        self.provider.write_snapshot(&entry, &encoded.bytes).await?;
        manifest.push(entry.clone());
        Ok(entry)
    }

    async fn before_unload(&self) -> Result<bool> {
        self.refresh().await;
        let scopes = self.tracker.lock().await.dirty_scopes();
        if scopes.is_empty() {
            return Ok(false);
        }
        let Some(path) = &self.unload_marker else {
            warn!(
                dirty = scopes.len(),
                "Unsaved changes at unload but no marker location configured"
            );
            return Ok(false);
        };

        let marker = UnloadMarker {
            dirty_at: Utc::now(),
            scopes: scopes.iter().map(Scope::to_string).collect(),
        };
        unload::write_marker(path, &marker).await?;
        info!(
            dirty = scopes.len(),
            path = %path.display(),
            "Recorded unsaved changes at unload"
        );
        Ok(true)
    }

    async fn check_reminder_at(&self, now: Instant) -> bool {
        let config = self.config.read().await.clone();
        if config.suppress_reminders || !config.enabled {
            return false;
        }
        let silent = self.provider.persists_silently()
            && self.status.borrow().status != BackupStatus::Paused;
        if silent {
            return false;
        }

        let Some(since) = self.tracker.lock().await.dirty_since() else {
            return false;
        };
        let threshold = self.timing.lock().await.policy().reminder_threshold;
        let dirty_for = now.saturating_duration_since(since);
        if dirty_for < threshold {
            return false;
        }

        self.events.publish(BackupEvent::DirtyReminder {
            manual_export_available: self.provider.kind() == BackendKind::ManualExport,
            dirty_for_secs: dirty_for.as_secs(),
        });
        true
    }
}

/// Millisecond-precision timestamp strictly after `last`.
fn next_created_at(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(3);
    match last {
        Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
        _ => now,
    }
}
