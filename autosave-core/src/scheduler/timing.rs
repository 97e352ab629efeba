//! Clock-injected timing decisions for scheduled backups.
//!
//! The hard interval is the primary trigger. When it fires while content is
//! still changing, the backup is deferred until the grace window has passed
//! without edits, but never beyond `max_defer` after the first deferral.

use crate::config::TimingPolicy;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing dirty; nothing to do
    Idle,
    /// Re-evaluate at `until`
    Defer { until: Instant },
    Backup,
}

/// Coarse scheduler phase, for status displays and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Dirty,
    Deferred,
    Saving,
    Error,
}

#[derive(Debug, Clone)]
pub struct TimingMachine {
    policy: TimingPolicy,
    deferred_since: Option<Instant>,
}

impl TimingMachine {
    pub fn new(policy: TimingPolicy) -> Self {
        Self {
            policy,
            deferred_since: None,
        }
    }

    pub fn policy(&self) -> &TimingPolicy {
        &self.policy
    }

    /// Swap the policy (e.g. new interval); an active deferral is kept.
    pub fn set_policy(&mut self, policy: TimingPolicy) {
        self.policy = policy;
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred_since.is_some()
    }

    pub fn on_interval_at(
        &mut self,
        now: Instant,
        dirty: bool,
        last_change: Option<Instant>,
    ) -> Decision {
        self.evaluate(now, dirty, last_change)
    }

    pub fn on_defer_at(
        &mut self,
        now: Instant,
        dirty: bool,
        last_change: Option<Instant>,
    ) -> Decision {
        self.evaluate(now, dirty, last_change)
    }

    /// A batch ran (successfully or not); the next interval starts fresh.
    pub fn backup_finished(&mut self) {
        self.deferred_since = None;
    }

    fn evaluate(&mut self, now: Instant, dirty: bool, last_change: Option<Instant>) -> Decision {
        if !dirty {
            self.deferred_since = None;
            return Decision::Idle;
        }

        let quiet = match last_change {
            Some(t) => now.saturating_duration_since(t) >= self.policy.grace,
            None => true,
        };
        if quiet {
            return Decision::Backup;
        }

        let since = *self.deferred_since.get_or_insert(now);
        let cap = since + self.policy.max_defer;
        if now >= cap {
            return Decision::Backup;
        }

        let settle = last_change.map_or(now, |t| t + self.policy.grace);
        Decision::Defer {
            until: settle.min(cap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(interval_secs: u64) -> TimingPolicy {
        TimingPolicy {
            interval: Duration::from_secs(interval_secs),
            grace: Duration::from_secs(30),
            max_defer: Duration::from_secs(300),
            reminder_period: Duration::from_secs(1200),
            reminder_threshold: Duration::from_secs(1200),
        }
    }

    /// Drive the machine second by second. Returns the seconds at which a
    /// backup was written.
    fn simulate(policy: TimingPolicy, edit_at: impl Fn(u64) -> bool, horizon: u64) -> Vec<u64> {
        let base = Instant::now();
        let interval = policy.interval.as_secs();
        let mut machine = TimingMachine::new(policy);
        let mut dirty = false;
        let mut last_change = None;
        let mut defer_at: Option<Instant> = None;
        let mut writes = Vec::new();

        for s in 0..=horizon {
            let now = base + Duration::from_secs(s);
            if edit_at(s) {
                dirty = true;
                last_change = Some(now);
            }

            let decision = if s > 0 && s % interval == 0 {
                Some(machine.on_interval_at(now, dirty, last_change))
            } else if defer_at.is_some_and(|d| d <= now) {
                Some(machine.on_defer_at(now, dirty, last_change))
            } else {
                None
            };

            match decision {
                Some(Decision::Backup) => {
                    writes.push(s);
                    dirty = false;
                    defer_at = None;
                    machine.backup_finished();
                }
                Some(Decision::Defer { until }) => defer_at = Some(until),
                Some(Decision::Idle) => defer_at = None,
                None => {}
            }
        }
        writes
    }

    #[test]
    fn test_idle_interval_is_noop() {
        let mut machine = TimingMachine::new(policy(300));
        assert_eq!(
            machine.on_interval_at(Instant::now(), false, None),
            Decision::Idle
        );
    }

    #[test]
    fn test_quiet_dirty_content_backs_up_immediately() {
        let now = Instant::now();
        let mut machine = TimingMachine::new(policy(300));
        let decision = machine.on_interval_at(now + Duration::from_secs(60), true, Some(now));
        assert_eq!(decision, Decision::Backup);
    }

    #[test]
    fn test_recent_edit_defers_until_grace_elapses() {
        let base = Instant::now();
        let now = base + Duration::from_secs(60);
        let edited = base + Duration::from_secs(50);
        let mut machine = TimingMachine::new(policy(300));
        assert_eq!(
            machine.on_interval_at(now, true, Some(edited)),
            Decision::Defer {
                until: edited + Duration::from_secs(30)
            }
        );
        assert!(machine.is_deferred());
    }

    #[test]
    fn test_rapid_edits_collapse_into_one_write() {
        let writes = simulate(policy(300), |s| (290..300).contains(&s), 900);
        assert_eq!(writes, vec![329]);
    }

    #[test]
    fn test_max_defer_forces_write_under_continuous_editing() {
        let writes = simulate(policy(300), |s| s % 20 == 0 && s <= 600, 600);
        assert!(!writes.is_empty(), "no backup within the defer cap");
        assert!(writes[0] <= 600);
    }

    #[test]
    fn test_policy_change_keeps_deferral() {
        let now = Instant::now();
        let mut machine = TimingMachine::new(policy(300));
        machine.on_interval_at(now, true, Some(now));
        machine.set_policy(policy(600));
        assert!(machine.is_deferred());
        assert_eq!(machine.policy().interval, Duration::from_secs(600));
    }
}
