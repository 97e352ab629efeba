//! Boundary with the application state being protected.
//!
//! The backup core never interprets session content. It needs three things
//! from the application: a cheap per-scope change token, the authoritative
//! in-memory content for a scope, and a way to write restored data back.

use crate::codec::{content_hash, SessionSnapshot};
use crate::manifest::GLOBAL_SCOPE;
use crate::provider::paths::TMP_PREFIX;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque change token for one scope.
///
/// Must change exactly when the scope's persisted content changes, and never
/// for UI-only state such as scroll position or playback time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Token from a version counter the application bumps on every content edit
    pub fn version(version: u64) -> Self {
        Self(format!("v{version}"))
    }

    /// Token from the content itself
    pub fn of_content<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self(content_hash(value)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Change tokens for every live scope, taken at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateObservation {
    pub sessions: Vec<(String, Fingerprint)>,
    pub global: Fingerprint,
}

/// Authoritative copy of one scope together with the token it corresponds to.
#[derive(Debug, Clone)]
pub struct ScopeContent {
    pub fingerprint: Fingerprint,
    pub label: Option<String>,
    pub content: Value,
}

#[async_trait]
pub trait StateSource: Send + Sync {
    async fn observe(&self) -> StateObservation;

    /// Counter that moves on every state notification, UI-only ones included
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Whether local state already holds user content
    async fn has_content(&self) -> bool;

    async fn session_content(&self, key: &str) -> Result<Option<ScopeContent>>;

    async fn global_content(&self) -> Result<ScopeContent>;

    /// Overwrite local state from a snapshot with auto-persistence suppressed.
    async fn apply_restore(&self, snapshot: &SessionSnapshot) -> Result<()>;
}

/// On-disk form of the application state used by `MemoryStateStore`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub global: Value,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub content: Value,
}

struct SessionRecord {
    label: Option<String>,
    content: Value,
    ui: Value,
    version: u64,
}

#[derive(Default)]
struct StoreInner {
    sessions: BTreeMap<String, SessionRecord>,
    global: Value,
    global_ui: Value,
    global_version: u64,
}

/// In-memory application state with version-counter fingerprints and
/// optional auto-persistence to a JSON file.
pub struct MemoryStateStore {
    inner: RwLock<StoreInner>,
    next_version: AtomicU64,
    changes: watch::Sender<u64>,
    persist_path: Option<PathBuf>,
    /// Held across document build, tmp write and rename
    persist_lock: Mutex<()>,
    suspended: AtomicUsize,
}

/// Keeps auto-persistence off while alive.
pub struct PersistenceSuspended<'a> {
    store: &'a MemoryStateStore,
}

impl Drop for PersistenceSuspended<'_> {
    fn drop(&mut self) {
        self.store.suspended.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: RwLock::new(StoreInner::default()),
            next_version: AtomicU64::new(1),
            changes,
            persist_path: None,
            persist_lock: Mutex::new(()),
            suspended: AtomicUsize::new(0),
        }
    }

    /// Store that writes its document to `path` after every content edit
    pub fn with_persistence(path: impl Into<PathBuf>) -> Self {
        Self {
            persist_path: Some(path.into()),
            ..Self::new()
        }
    }

    /// Load a state document from disk; a missing file yields an empty store.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = Self::with_persistence(path.clone());
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let doc: StateDocument = serde_json::from_slice(&bytes)?;
                store.replace_document(doc).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BackupError::from_io(e, &path.display().to_string())),
        }
        Ok(store)
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn notify(&self) {
        self.changes.send_modify(|n| *n += 1);
    }

    pub fn suspend_persistence(&self) -> PersistenceSuspended<'_> {
        self.suspended.fetch_add(1, Ordering::SeqCst);
        PersistenceSuspended { store: self }
    }

    pub fn persistence_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst) > 0
    }

    pub async fn upsert_session(&self, key: &str, label: Option<String>, content: Value) {
        {
            let version = self.bump();
            let mut inner = self.inner.write().await;
            let record = inner.sessions.entry(key.to_string()).or_insert_with(|| SessionRecord {
                label: None,
                content: Value::Null,
                ui: Value::Null,
                version,
            });
            record.label = label;
            record.content = content;
            record.version = version;
        }
        self.notify();
        self.auto_persist().await;
    }

    /// UI-only update: notifies observers but leaves the fingerprint alone.
    pub async fn set_session_ui(&self, key: &str, ui: Value) {
        {
            let mut inner = self.inner.write().await;
            if let Some(record) = inner.sessions.get_mut(key) {
                record.ui = ui;
            }
        }
        self.notify();
    }

    pub async fn session_ui(&self, key: &str) -> Option<Value> {
        let inner = self.inner.read().await;
        inner.sessions.get(key).map(|r| r.ui.clone())
    }

    pub async fn remove_session(&self, key: &str) -> bool {
        let removed = self.inner.write().await.sessions.remove(key).is_some();
        if removed {
            self.notify();
            self.auto_persist().await;
        }
        removed
    }

    pub async fn set_global(&self, global: Value) {
        {
            let version = self.bump();
            let mut inner = self.inner.write().await;
            inner.global = global;
            inner.global_version = version;
        }
        self.notify();
        self.auto_persist().await;
    }

    /// Session-local preference stored alongside globals but never persisted.
    pub async fn set_global_ui(&self, ui: Value) {
        self.inner.write().await.global_ui = ui;
        self.notify();
    }

    /// Replace the whole document, bumping only scopes whose content differs.
    pub async fn replace_document(&self, doc: StateDocument) {
        let mut changed = false;
        {
            let mut inner = self.inner.write().await;
            let before = inner.sessions.len();
            let keep = &doc.sessions;
            inner.sessions.retain(|key, _| keep.contains_key(key));
            changed |= inner.sessions.len() != before;

            for (key, session) in doc.sessions {
                let same = inner
                    .sessions
                    .get(&key)
                    .is_some_and(|r| r.content == session.content && r.label == session.label);
                if same {
                    continue;
                }
                let version = self.bump();
                let record = inner.sessions.entry(key).or_insert_with(|| SessionRecord {
                    label: None,
                    content: Value::Null,
                    ui: Value::Null,
                    version,
                });
                record.label = session.label;
                record.content = session.content;
                record.version = version;
                changed = true;
            }

            if inner.global != doc.global {
                inner.global = doc.global;
                inner.global_version = self.bump();
                changed = true;
            }
        }
        if changed {
            self.notify();
        }
    }

    pub async fn document(&self) -> StateDocument {
        let inner = self.inner.read().await;
        StateDocument {
            global: inner.global.clone(),
            sessions: inner
                .sessions
                .iter()
                .map(|(key, r)| {
                    (
                        key.clone(),
                        SessionDocument {
                            label: r.label.clone(),
                            content: r.content.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    async fn auto_persist(&self) {
        if self.persistence_suspended() {
            debug!("Auto-persistence suspended, skipping write");
            return;
        }
        if let Err(e) = self.persist_now().await {
            warn!(error = %e, "Failed to persist application state");
        }
    }

    /// Write the current document to the persistence path, if any.
    pub async fn persist_now(&self) -> Result<()> {
        let _writer = self.persist_lock.lock().await;
        self.write_document().await
    }

    /// Caller must hold `persist_lock`; the document is built under it so a
    /// queued writer never lands an older snapshot of the state.
    async fn write_document(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&self.document().await)?;
        write_file_atomic(path, &bytes).await
    }
}

/// Write `bytes` to `path` via a unique `.tmp_` sibling and rename.
pub(crate) async fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let label = path.display().to_string();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BackupError::UnsafePath(label.clone()))?;
    let tmp = path.with_file_name(format!("{TMP_PREFIX}{file_name}.{}", Uuid::new_v4().simple()));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BackupError::from_io(e, &label))?;
    }
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(BackupError::from_io(e, &label));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(BackupError::from_io(e, &label));
    }
    Ok(())
}

#[async_trait]
impl StateSource for MemoryStateStore {
    async fn observe(&self) -> StateObservation {
        let inner = self.inner.read().await;
        StateObservation {
            sessions: inner
                .sessions
                .iter()
                .map(|(key, r)| (key.clone(), Fingerprint::version(r.version)))
                .collect(),
            global: Fingerprint::version(inner.global_version),
        }
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    async fn has_content(&self) -> bool {
        let inner = self.inner.read().await;
        inner.sessions.values().any(|r| !is_blank(&r.content))
    }

    async fn session_content(&self, key: &str) -> Result<Option<ScopeContent>> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(key).map(|r| ScopeContent {
            fingerprint: Fingerprint::version(r.version),
            label: r.label.clone(),
            content: r.content.clone(),
        }))
    }

    async fn global_content(&self) -> Result<ScopeContent> {
        let inner = self.inner.read().await;
        Ok(ScopeContent {
            fingerprint: Fingerprint::version(inner.global_version),
            label: None,
            content: inner.global.clone(),
        })
    }

    async fn apply_restore(&self, snapshot: &SessionSnapshot) -> Result<()> {
        // Writers already in flight drain first; later ones queue behind the
        // restored document and rebuild from it.
        let _writer = self.persist_lock.lock().await;
        {
            let mut inner = self.inner.write().await;
            if snapshot.scope_key != GLOBAL_SCOPE {
                let version = self.bump();
                let record = inner
                    .sessions
                    .entry(snapshot.scope_key.clone())
                    .or_insert_with(|| SessionRecord {
                        label: None,
                        content: Value::Null,
                        ui: Value::Null,
                        version,
                    });
                record.content = snapshot.session.clone();
                record.ui = Value::Null;
                record.version = version;
            }
            if let Some(global) = &snapshot.global {
                inner.global = global.clone();
                inner.global_version = self.bump();
            }
        }
        self.notify();
        self.write_document().await
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SCHEMA_VERSION;
    use crate::manifest::BackupReason;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ui_updates_keep_fingerprint() {
        let store = MemoryStateStore::new();
        store
            .upsert_session("ep1", None, json!({"segments": [1]}))
            .await;
        let before = store.observe().await;

        store
            .set_session_ui("ep1", json!({"scroll": 420, "playhead": 12.5}))
            .await;
        store.set_global_ui(json!({"sidebar": "collapsed"})).await;

        assert_eq!(store.observe().await, before);
    }

    #[tokio::test]
    async fn test_content_updates_move_fingerprint() {
        let store = MemoryStateStore::new();
        store
            .upsert_session("ep1", None, json!({"segments": [1]}))
            .await;
        let before = store.observe().await;

        store
            .upsert_session("ep1", None, json!({"segments": [1, 2]}))
            .await;
        let after = store.observe().await;
        assert_ne!(after.sessions, before.sessions);
        assert_eq!(after.global, before.global);

        store.set_global(json!({"theme": "light"})).await;
        assert_ne!(store.observe().await.global, after.global);
    }

    #[tokio::test]
    async fn test_replace_document_bumps_only_changed_scopes() {
        let store = MemoryStateStore::new();
        let mut doc = StateDocument::default();
        doc.sessions.insert(
            "a".to_string(),
            SessionDocument {
                label: None,
                content: json!([1]),
            },
        );
        doc.sessions.insert(
            "b".to_string(),
            SessionDocument {
                label: None,
                content: json!([2]),
            },
        );
        store.replace_document(doc.clone()).await;
        let before = store.observe().await;

        doc.sessions.get_mut("b").unwrap().content = json!([2, 3]);
        store.replace_document(doc).await;
        let after = store.observe().await;

        assert_eq!(after.sessions[0], before.sessions[0]);
        assert_ne!(after.sessions[1], before.sessions[1]);
    }

    #[tokio::test]
    async fn test_notifications_fire_for_every_change() {
        let store = MemoryStateStore::new();
        let mut rx = store.subscribe();
        store.set_session_ui("missing", json!(1)).await;
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();
        store.set_global(json!({"x": 1})).await;
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_restore_suppresses_auto_persist_then_writes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("state.json");
        let store = MemoryStateStore::with_persistence(&path);
        store
            .upsert_session("ep1", Some("Episode".into()), json!({"v": "old"}))
            .await;

        {
            let _guard = store.suspend_persistence();
            store
                .upsert_session("ep1", None, json!({"v": "stale in-flight"}))
                .await;
        }
        let on_disk: StateDocument = serde_json::from_slice(&std::fs::read(&path)?)?;
        assert_eq!(on_disk.sessions["ep1"].content, json!({"v": "old"}));

        let snapshot = SessionSnapshot {
            schema_version: SCHEMA_VERSION,
            app_version: "1.0.0".into(),
            created_at: chrono::Utc::now(),
            scope_key: "ep1".into(),
            reason: BackupReason::Manual,
            checksum: String::new(),
            session: json!({"v": "restored"}),
            global: Some(json!({"theme": "dark"})),
        };
        store.apply_restore(&snapshot).await?;
        assert!(!store.persistence_suspended());

        let on_disk: StateDocument = serde_json::from_slice(&std::fs::read(&path)?)?;
        assert_eq!(on_disk.sessions["ep1"].content, json!({"v": "restored"}));
        assert_eq!(on_disk.global, json!({"theme": "dark"}));
        Ok(())
    }

    fn restored(round: usize) -> SessionSnapshot {
        SessionSnapshot {
            schema_version: SCHEMA_VERSION,
            app_version: "1.0.0".into(),
            created_at: chrono::Utc::now(),
            scope_key: "ep1".into(),
            reason: BackupReason::Manual,
            checksum: String::new(),
            session: json!({"v": "restored", "round": round}),
            global: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_restore_is_not_clobbered_by_concurrent_writers() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("state.json");
        let store = Arc::new(MemoryStateStore::with_persistence(&path));

        for round in 0..25 {
            store
                .upsert_session("ep1", None, json!({"v": "old", "round": round}))
                .await;

            let mut writers = Vec::new();
            for i in 0..8 {
                let store = Arc::clone(&store);
                writers.push(tokio::spawn(async move {
                    let key = format!("other{i}");
                    store
                        .upsert_session(&key, None, json!({"round": round}))
                        .await;
                }));
            }
            store.apply_restore(&restored(round)).await?;
            for writer in writers {
                writer.await.unwrap();
            }

            let on_disk: StateDocument = serde_json::from_slice(&std::fs::read(&path)?)?;
            assert_eq!(
                on_disk.sessions["ep1"].content,
                json!({"v": "restored", "round": round})
            );
            assert_eq!(on_disk, store.document().await);
        }

        let leftovers = std::fs::read_dir(temp_dir.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TMP_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("absent.json");
        let store = MemoryStateStore::load(path).await?;
        assert!(!store.has_content().await);
        assert!(store.observe().await.sessions.is_empty());
        Ok(())
    }
}
