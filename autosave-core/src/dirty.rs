//! Per-scope dirty tracking.
//!
//! A scope is dirty iff its current fingerprint differs from the fingerprint
//! captured at its last successful backup. The first observation of a run
//! primes every scope as clean; scopes that appear later start dirty, since
//! nothing of theirs has been backed up yet.

use crate::manifest::Scope;
use crate::state::{Fingerprint, StateObservation};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

#[derive(Debug, Clone)]
struct ScopeState {
    baseline: Option<Fingerprint>,
    current: Fingerprint,
    /// When the scope first went dirty since its last backup
    dirty_since: Option<Instant>,
    /// When the fingerprint last moved
    last_change: Option<Instant>,
}

impl ScopeState {
    fn is_dirty(&self) -> bool {
        self.baseline.as_ref() != Some(&self.current)
    }
}

#[derive(Debug, Default)]
pub struct DirtyTracker {
    scopes: HashMap<Scope, ScopeState>,
    primed: bool,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one state notification. Returns true if any scope is dirty afterwards.
    pub fn observe(&mut self, observation: &StateObservation, now: Instant) -> bool {
        let mut live = HashSet::with_capacity(observation.sessions.len() + 1);
        for (key, fingerprint) in &observation.sessions {
            let scope = Scope::Session(key.clone());
            self.track(&scope, fingerprint, now);
            live.insert(scope);
        }
        self.track(&Scope::Global, &observation.global, now);
        live.insert(Scope::Global);

        self.scopes.retain(|scope, _| live.contains(scope));
        self.primed = true;
        self.any_dirty()
    }

    fn track(&mut self, scope: &Scope, fingerprint: &Fingerprint, now: Instant) {
        match self.scopes.get_mut(scope) {
            Some(state) => {
                if &state.current != fingerprint {
                    state.current = fingerprint.clone();
                    state.last_change = Some(now);
                }
                if state.is_dirty() {
                    state.dirty_since.get_or_insert(now);
                } else {
                    state.dirty_since = None;
                }
            }
            None => {
                let baseline = (!self.primed).then(|| fingerprint.clone());
                let dirty = baseline.is_none();
                self.scopes.insert(
                    scope.clone(),
                    ScopeState {
                        baseline,
                        current: fingerprint.clone(),
                        dirty_since: dirty.then_some(now),
                        last_change: dirty.then_some(now),
                    },
                );
            }
        }
    }

    /// Record that `fingerprint` of `scope` is now safely stored.
    ///
    /// Edits that landed after the content was captured keep the scope dirty.
    pub fn mark_backed_up(&mut self, scope: &Scope, fingerprint: &Fingerprint) {
        let state = self.scopes.entry(scope.clone()).or_insert_with(|| ScopeState {
            baseline: None,
            current: fingerprint.clone(),
            dirty_since: None,
            last_change: None,
        });
        state.baseline = Some(fingerprint.clone());
        if state.is_dirty() {
            state.dirty_since = state.last_change;
        } else {
            state.dirty_since = None;
        }
    }

    pub fn is_dirty(&self, scope: &Scope) -> bool {
        self.scopes.get(scope).is_some_and(ScopeState::is_dirty)
    }

    pub fn any_dirty(&self) -> bool {
        self.scopes.values().any(ScopeState::is_dirty)
    }

    /// Dirty scopes, sessions first, in a stable order
    pub fn dirty_scopes(&self) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = self
            .scopes
            .iter()
            .filter(|(_, s)| s.is_dirty())
            .map(|(scope, _)| scope.clone())
            .collect();
        scopes.sort();
        scopes
    }

    /// Every tracked scope, sessions first
    pub fn all_scopes(&self) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = self.scopes.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Most recent content change among dirty scopes
    pub fn last_change(&self) -> Option<Instant> {
        self.scopes
            .values()
            .filter(|s| s.is_dirty())
            .filter_map(|s| s.last_change)
            .max()
    }

    /// Longest-standing dirty moment among dirty scopes
    pub fn dirty_since(&self) -> Option<Instant> {
        self.scopes
            .values()
            .filter(|s| s.is_dirty())
            .filter_map(|s| s.dirty_since)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn obs(sessions: &[(&str, u64)], global: u64) -> StateObservation {
        StateObservation {
            sessions: sessions
                .iter()
                .map(|(k, v)| (k.to_string(), Fingerprint::version(*v)))
                .collect(),
            global: Fingerprint::version(global),
        }
    }

    #[test]
    fn test_first_observation_primes_clean() {
        let mut tracker = DirtyTracker::new();
        assert!(!tracker.observe(&obs(&[("a", 1), ("b", 2)], 3), Instant::now()));
        assert!(tracker.dirty_scopes().is_empty());
    }

    #[test]
    fn test_repeated_notifications_without_content_change_stay_clean() {
        let mut tracker = DirtyTracker::new();
        let now = Instant::now();
        let same = obs(&[("a", 1)], 2);
        tracker.observe(&same, now);
        for i in 1..50 {
            assert!(!tracker.observe(&same, now + Duration::from_secs(i)));
        }
        assert_eq!(tracker.last_change(), None);
    }

    #[test]
    fn test_change_marks_dirty_with_timestamps() {
        let mut tracker = DirtyTracker::new();
        let t0 = Instant::now();
        tracker.observe(&obs(&[("a", 1)], 9), t0);

        let t1 = t0 + Duration::from_secs(10);
        assert!(tracker.observe(&obs(&[("a", 2)], 9), t1));
        let t2 = t0 + Duration::from_secs(20);
        tracker.observe(&obs(&[("a", 3)], 9), t2);

        assert_eq!(tracker.dirty_scopes(), vec![Scope::Session("a".into())]);
        assert_eq!(tracker.dirty_since(), Some(t1));
        assert_eq!(tracker.last_change(), Some(t2));
        assert!(!tracker.is_dirty(&Scope::Global));
    }

    #[test]
    fn test_new_session_after_priming_is_dirty() {
        let mut tracker = DirtyTracker::new();
        let now = Instant::now();
        tracker.observe(&obs(&[("a", 1)], 1), now);
        tracker.observe(&obs(&[("a", 1), ("b", 5)], 1), now);
        assert_eq!(tracker.dirty_scopes(), vec![Scope::Session("b".into())]);
    }

    #[test]
    fn test_backup_resets_and_later_edits_remain_dirty() {
        let mut tracker = DirtyTracker::new();
        let now = Instant::now();
        tracker.observe(&obs(&[("a", 1)], 1), now);
        tracker.observe(&obs(&[("a", 2)], 4), now);
        assert_eq!(tracker.dirty_scopes().len(), 2);

        tracker.mark_backed_up(&Scope::Session("a".into()), &Fingerprint::version(2));
        tracker.mark_backed_up(&Scope::Global, &Fingerprint::version(3));
        assert!(!tracker.is_dirty(&Scope::Session("a".into())));
        // Global moved to 4 after version 3 was captured.
        assert!(tracker.is_dirty(&Scope::Global));
    }

    #[test]
    fn test_reverting_to_backed_up_content_is_clean() {
        let mut tracker = DirtyTracker::new();
        let now = Instant::now();
        let original = Fingerprint::of_content(&serde_json::json!({"t": "x"})).unwrap();
        let edited = Fingerprint::of_content(&serde_json::json!({"t": "y"})).unwrap();
        let observe = |fp: &Fingerprint| StateObservation {
            sessions: vec![("a".to_string(), fp.clone())],
            global: Fingerprint::version(0),
        };

        tracker.observe(&observe(&original), now);
        assert!(tracker.observe(&observe(&edited), now));
        assert!(!tracker.observe(&observe(&original), now));
    }

    #[test]
    fn test_removed_sessions_are_forgotten() {
        let mut tracker = DirtyTracker::new();
        let now = Instant::now();
        tracker.observe(&obs(&[("a", 1)], 1), now);
        tracker.observe(&obs(&[("a", 2)], 1), now);
        assert!(tracker.any_dirty());
        assert!(!tracker.observe(&obs(&[], 1), now));
    }
}
