//! Report velocity and violation tracking
//!
//! Each actor's standing is locked on its own. A mute produced here is a
//! precondition for mutating calls, checked before any ledger work.

use crate::{AbuseConfig, ActorId, Clock, MutedReportPolicy, PairingError, Registry, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Standing {
    /// (reporter, reported_at) inside the window, one entry per reporter
    reports: VecDeque<(ActorId, u64)>,
    violation_count: u32,
    last_violation_millis: Option<u64>,
    muted_until_millis: Option<u64>,
}

impl Standing {
    fn is_muted(&self, now_millis: u64) -> bool {
        self.muted_until_millis.is_some_and(|until| until > now_millis)
    }

    /// Raise the mute end; it never moves backwards
    fn mute_until(&mut self, until_millis: u64) -> u64 {
        let until = self.muted_until_millis.map_or(until_millis, |cur| cur.max(until_millis));
        self.muted_until_millis = Some(until);
        until
    }

    fn prune_reports(&mut self, now_millis: u64, window_millis: u64) {
        while self
            .reports
            .front()
            .is_some_and(|(_, at)| now_millis.saturating_sub(*at) >= window_millis)
        {
            self.reports.pop_front();
        }
    }
}

/// Result of a report
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportOutcome {
    /// Target is muted after this report
    pub muted: bool,
    /// End of the running mute, if any
    pub muted_until_millis: Option<u64>,
    /// Distinct reporters currently inside the window
    pub distinct_reporters: usize,
}

/// What a violation earned
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationAction {
    /// Counted, no mute yet
    Warning,
    Muted {
        /// End of the mute
        until_millis: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
/// Result of recording a violation
pub struct ViolationOutcome {
    /// Violations counted so far
    pub violation_count: u32,
    /// What the count earned
    pub action: ViolationAction,
}

/// Snapshot of an actor's violation counter
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationCounter {
    /// Actor the counter belongs to
    pub actor_id: ActorId,
    /// Violations counted so far
    pub violation_count: u32,
    /// End of the latest mute, possibly already past
    pub muted_until_millis: Option<u64>,
}

/// Tracks reports and violations per actor
pub struct AbuseMonitor {
    config: AbuseConfig,
    standings: Registry<ActorId, Mutex<Standing>>,
    clock: Arc<dyn Clock>,
}

impl AbuseMonitor {
    /// Create a monitor with no standings
    pub fn new(config: AbuseConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            standings: Registry::new(),
            clock,
        }
    }

    fn standing(&self, actor: &ActorId) -> Result<Arc<Mutex<Standing>>, StoreError> {
        self.standings.get_or_insert_with(actor, || Mutex::new(Standing::default()))
    }

    /// `reporter` flags `target`.
    ///
    /// Enough distinct reporters inside the window mute the target. Reports
    /// against an already muted actor follow the configured policy.
    pub fn report(&self, reporter: &ActorId, target: &ActorId) -> Result<ReportOutcome, PairingError> {
        if reporter == target {
            return Err(PairingError::validation("actors cannot report themselves"));
        }
        let now = self.clock.now_millis();
        let standing = self.standing(target)?;
        let mut standing = standing.lock().map_err(StoreError::poisoned)?;

        standing.prune_reports(now, self.config.report_window_millis);
        standing.reports.retain(|(who, _)| who != reporter);
        standing.reports.push_back((reporter.clone(), now));
        let distinct_reporters = standing.reports.len();

        let mute_end = now.saturating_add(self.config.report_mute_millis);
        if standing.is_muted(now) {
            if self.config.muted_report_policy == MutedReportPolicy::Extend {
                let until = standing.mute_until(mute_end);
                tracing::debug!(actor = %target, until, "Mute extended by report");
            }
        } else if distinct_reporters >= self.config.report_threshold {
            let until = standing.mute_until(mute_end);
            tracing::info!(actor = %target, distinct_reporters, until, "Actor muted by reports");
        }

        Ok(ReportOutcome {
            muted: standing.is_muted(now),
            muted_until_millis: standing.muted_until_millis.filter(|until| *until > now),
            distinct_reporters,
        })
    }

    /// Count a violation and apply the escalation ladder
    pub fn record_violation(&self, actor: &ActorId) -> Result<ViolationOutcome, PairingError> {
        let now = self.clock.now_millis();
        let standing = self.standing(actor)?;
        let mut standing = standing.lock().map_err(StoreError::poisoned)?;

        if let (Some(reset_after), Some(last)) =
            (self.config.violation_reset_millis, standing.last_violation_millis)
        {
            if now.saturating_sub(last) >= reset_after {
                standing.violation_count = 0;
            }
        }
        standing.violation_count = standing.violation_count.saturating_add(1);
        standing.last_violation_millis = Some(now);

        let ladder = &self.config.escalation_millis;
        let step = (standing.violation_count as usize - 1).min(ladder.len().saturating_sub(1));
        let mute_millis = ladder.get(step).copied().unwrap_or(0);

        let action = if mute_millis == 0 {
            tracing::debug!(actor = %actor, count = standing.violation_count, "Violation warning");
            ViolationAction::Warning
        } else {
            let until = standing.mute_until(now.saturating_add(mute_millis));
            tracing::info!(actor = %actor, count = standing.violation_count, until, "Actor muted for violation");
            ViolationAction::Muted { until_millis: until }
        };

        Ok(ViolationOutcome {
            violation_count: standing.violation_count,
            action,
        })
    }

    /// Reject with `Muted` if the actor is currently muted
    pub fn check_muted(&self, actor: &ActorId) -> Result<(), PairingError> {
        let Some(standing) = self.standings.get(actor)? else {
            return Ok(());
        };
        let now = self.clock.now_millis();
        let standing = standing.lock().map_err(StoreError::poisoned)?;
        match standing.muted_until_millis {
            Some(until) if until > now => Err(PairingError::Muted {
                actor: actor.clone(),
                muted_until_millis: until,
            }),
            _ => Ok(()),
        }
    }

    /// Violation count and mute end for `actor`
    pub fn counter(&self, actor: &ActorId) -> Result<ViolationCounter, PairingError> {
        let mut counter = ViolationCounter {
            actor_id: actor.clone(),
            violation_count: 0,
            muted_until_millis: None,
        };
        if let Some(standing) = self.standings.get(actor)? {
            let standing = standing.lock().map_err(StoreError::poisoned)?;
            counter.violation_count = standing.violation_count;
            counter.muted_until_millis = standing.muted_until_millis;
        }
        Ok(counter)
    }

    /// Explicit reset: forget violations, keep any running mute
    pub fn reset_violations(&self, actor: &ActorId) -> Result<(), PairingError> {
        if let Some(standing) = self.standings.get(actor)? {
            let mut standing = standing.lock().map_err(StoreError::poisoned)?;
            standing.violation_count = 0;
            standing.last_violation_millis = None;
        }
        Ok(())
    }

    /// Moderator override: lift the mute and drop pending reports
    pub fn unmute(&self, actor: &ActorId) -> Result<(), PairingError> {
        if let Some(standing) = self.standings.get(actor)? {
            let mut standing = standing.lock().map_err(StoreError::poisoned)?;
            standing.muted_until_millis = None;
            standing.reports.clear();
        }
        Ok(())
    }

    /// Drop standings that carry no state worth keeping and that no
    /// in-flight call is holding
    pub fn prune(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        let window = self.config.report_window_millis;
        self.standings.retain_idle(|_, standing| match standing.lock() {
            Ok(mut s) => {
                s.prune_reports(now, window);
                !s.reports.is_empty() || s.violation_count > 0 || s.is_muted(now)
            }
            Err(_) => false,
        })
    }

    /// Teardown: forget every standing
    pub fn clear(&self) -> Result<(), StoreError> {
        self.standings.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;

    const MINUTE: u64 = 60_000;

    fn monitor(config: AbuseConfig) -> (Arc<ManualClock>, AbuseMonitor) {
        let clock = Arc::new(ManualClock::new(1_000 * MINUTE));
        (clock.clone(), AbuseMonitor::new(config, clock))
    }

    fn id(s: &str) -> ActorId {
        ActorId::new(s)
    }

    #[test]
    fn three_distinct_reporters_mute_for_thirty_minutes() {
        let (clock, monitor) = monitor(AbuseConfig::default());
        let x = id("x");
        assert!(!monitor.report(&id("r1"), &x).unwrap().muted);
        clock.advance_millis(2 * MINUTE);
        assert!(!monitor.report(&id("r2"), &x).unwrap().muted);
        clock.advance_millis(2 * MINUTE);
        let outcome = monitor.report(&id("r3"), &x).unwrap();
        assert!(outcome.muted);
        assert_eq!(outcome.muted_until_millis, Some(clock.now_millis() + 30 * MINUTE));
        assert!(matches!(monitor.check_muted(&x), Err(PairingError::Muted { .. })));
    }

    #[test]
    fn repeat_reporter_counts_once() {
        let (_clock, monitor) = monitor(AbuseConfig::default());
        let x = id("x");
        for _ in 0..5 {
            monitor.report(&id("r1"), &x).unwrap();
        }
        let outcome = monitor.report(&id("r2"), &x).unwrap();
        assert_eq!(outcome.distinct_reporters, 2);
        assert!(!outcome.muted);
    }

    #[test]
    fn reports_outside_window_do_not_count() {
        let (clock, monitor) = monitor(AbuseConfig::default());
        let x = id("x");
        monitor.report(&id("r1"), &x).unwrap();
        monitor.report(&id("r2"), &x).unwrap();
        clock.advance_millis(10 * MINUTE);
        let outcome = monitor.report(&id("r3"), &x).unwrap();
        assert_eq!(outcome.distinct_reporters, 1);
        assert!(!outcome.muted);
    }

    #[test]
    fn fourth_report_while_muted_is_ignored_by_default() {
        let (clock, monitor) = monitor(AbuseConfig::default());
        let x = id("x");
        for r in ["r1", "r2", "r3"] {
            monitor.report(&id(r), &x).unwrap();
        }
        let until = monitor.counter(&x).unwrap().muted_until_millis;
        clock.advance_millis(5 * MINUTE);
        let outcome = monitor.report(&id("r4"), &x).unwrap();
        assert!(outcome.muted);
        assert_eq!(outcome.muted_until_millis, until);
    }

    #[test]
    fn fourth_report_while_muted_extends_when_configured() {
        let (clock, monitor) = monitor(AbuseConfig {
            muted_report_policy: MutedReportPolicy::Extend,
            ..AbuseConfig::default()
        });
        let x = id("x");
        for r in ["r1", "r2", "r3"] {
            monitor.report(&id(r), &x).unwrap();
        }
        clock.advance_millis(5 * MINUTE);
        let outcome = monitor.report(&id("r4"), &x).unwrap();
        assert_eq!(outcome.muted_until_millis, Some(clock.now_millis() + 30 * MINUTE));
    }

    #[test]
    fn self_report_is_rejected() {
        let (_clock, monitor) = monitor(AbuseConfig::default());
        assert!(matches!(
            monitor.report(&id("x"), &id("x")),
            Err(PairingError::Validation(_))
        ));
    }

    #[test]
    fn violation_ladder_escalates() {
        let (clock, monitor) = monitor(AbuseConfig::default());
        let x = id("x");
        let now = clock.now_millis();

        let first = monitor.record_violation(&x).unwrap();
        assert_eq!(first.action, ViolationAction::Warning);
        assert!(monitor.check_muted(&x).is_ok());

        let second = monitor.record_violation(&x).unwrap();
        assert_eq!(second.action, ViolationAction::Muted { until_millis: now + 10 * MINUTE });

        let third = monitor.record_violation(&x).unwrap();
        assert_eq!(third.action, ViolationAction::Muted { until_millis: now + 60 * MINUTE });

        let fourth = monitor.record_violation(&x).unwrap();
        assert_eq!(fourth.violation_count, 4);
        assert_eq!(fourth.action, ViolationAction::Muted { until_millis: now + 60 * MINUTE });
    }

    #[test]
    fn mute_end_never_moves_backwards() {
        let (_clock, monitor) = monitor(AbuseConfig {
            escalation_millis: vec![60 * MINUTE, 10 * MINUTE],
            ..AbuseConfig::default()
        });
        let x = id("x");
        let first = monitor.record_violation(&x).unwrap();
        let second = monitor.record_violation(&x).unwrap();
        assert_eq!(first.action, second.action);
    }

    #[test]
    fn violations_reset_only_when_configured() {
        let (clock, monitor) = monitor(AbuseConfig {
            violation_reset_millis: Some(24 * 60 * MINUTE),
            ..AbuseConfig::default()
        });
        let x = id("x");
        monitor.record_violation(&x).unwrap();
        monitor.record_violation(&x).unwrap();
        clock.advance_millis(24 * 60 * MINUTE);
        assert_eq!(monitor.record_violation(&x).unwrap().violation_count, 1);

        monitor.reset_violations(&x).unwrap();
        assert_eq!(monitor.counter(&x).unwrap().violation_count, 0);
    }

    #[test]
    fn mute_lapses_and_unmute_lifts() {
        let (clock, monitor) = monitor(AbuseConfig::default());
        let x = id("x");
        monitor.record_violation(&x).unwrap();
        monitor.record_violation(&x).unwrap();
        assert!(monitor.check_muted(&x).is_err());
        clock.advance_millis(10 * MINUTE);
        assert!(monitor.check_muted(&x).is_ok());

        monitor.record_violation(&x).unwrap();
        monitor.unmute(&x).unwrap();
        assert!(monitor.check_muted(&x).is_ok());
    }

    #[test]
    fn prune_drops_clean_standings() {
        let (clock, monitor) = monitor(AbuseConfig::default());
        monitor.report(&id("r1"), &id("x")).unwrap();
        monitor.record_violation(&id("y")).unwrap();
        clock.advance_millis(10 * MINUTE);
        assert_eq!(monitor.prune().unwrap(), 1);
        assert_eq!(monitor.counter(&id("y")).unwrap().violation_count, 1);
    }

    #[test]
    fn prune_running_alongside_reports_loses_none() {
        let (_clock, monitor) = monitor(AbuseConfig::default());
        let monitor = Arc::new(monitor);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let pruner = {
            let (monitor, stop) = (monitor.clone(), stop.clone());
            std::thread::spawn(move || {
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    monitor.prune().unwrap();
                }
            })
        };

        let mut unmuted = 0;
        for i in 0..2_000 {
            let target = ActorId::new(format!("t{i}"));
            for reporter in ["r1", "r2", "r3"] {
                monitor.report(&id(reporter), &target).unwrap();
            }
            if monitor.check_muted(&target).is_ok() {
                unmuted += 1;
            }
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        pruner.join().unwrap();
        assert_eq!(unmuted, 0);
    }
}
