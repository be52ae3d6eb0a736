//! Component N: the `Running <-> Degraded -> Halted` state machine that
//! background workers (`BackendPromoter`, `FailOverCacheClient`,
//! `SCOCache` cleanup) report failures to.

use parking_lot::RwLock;
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Running,
    Degraded,
    Halted,
}

#[derive(Debug, Clone, Copy)]
pub struct ComponentFailure {
    pub at: Instant,
}

struct Inner {
    state: HealthState,
    recent_failures: VecDeque<Instant>,
    halted_reason: Option<String>,
}

/// `degraded_error_threshold` transient failures within `degraded_window`
/// move `Running -> Degraded`; the rolling counter decaying back below
/// threshold (and the failing component reporting `recovered()`) moves
/// `Degraded -> Running`. `halt` is a one-way transition.
pub struct HealthMonitor {
    inner: RwLock<Inner>,
    degraded_error_threshold: usize,
    degraded_window: Duration,
}

impl HealthMonitor {
    pub fn new(degraded_error_threshold: usize, degraded_window: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: HealthState::Running,
                recent_failures: VecDeque::new(),
                halted_reason: None,
            }),
            degraded_error_threshold,
            degraded_window,
        }
    }

    pub fn state(&self) -> HealthState {
        self.inner.read().state
    }

    pub fn halted_reason(&self) -> Option<String> {
        self.inner.read().halted_reason.clone()
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some(front) = inner.recent_failures.front() {
            if now.duration_since(*front) > self.degraded_window {
                inner.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Records a transient backend failure from a background worker.
    /// Moves `Running -> Degraded` once the rolling count within
    /// `degraded_window` crosses `degraded_error_threshold`. No-op once
    /// `Halted`.
    pub fn report(&self, failure: ComponentFailure) {
        let mut inner = self.inner.write();
        if inner.state == HealthState::Halted {
            return;
        }
        self.prune(&mut inner, failure.at);
        inner.recent_failures.push_back(failure.at);
        if inner.recent_failures.len() >= self.degraded_error_threshold {
            inner.state = HealthState::Degraded;
        }
    }

    /// The degrading component reports it has recovered (e.g. the FOC
    /// client reconnected). Moves `Degraded -> Running` only once the
    /// rolling failure count has also decayed below threshold.
    pub fn recovered(&self, at: Instant) {
        let mut inner = self.inner.write();
        if inner.state != HealthState::Degraded {
            return;
        }
        self.prune(&mut inner, at);
        if inner.recent_failures.len() < self.degraded_error_threshold {
            inner.state = HealthState::Running;
        }
    }

    /// One-way transition: no recovery from `Halted` short of a fresh
    /// `VolumeEngine::open`.
    pub fn halt(&self, reason: String) {
        let mut inner = self.inner.write();
        inner.state = HealthState::Halted;
        inner.halted_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_failures_within_window_degrade() {
        let hm = HealthMonitor::new(3, Duration::from_secs(60));
        let now = Instant::now();
        for _ in 0 .. 3 {
            hm.report(ComponentFailure { at: now });
        }
        assert_eq!(hm.state(), HealthState::Degraded);
    }

    #[test]
    fn recovery_requires_decayed_count() {
        let hm = HealthMonitor::new(2, Duration::from_millis(10));
        let t0 = Instant::now();
        hm.report(ComponentFailure { at: t0 });
        hm.report(ComponentFailure { at: t0 });
        assert_eq!(hm.state(), HealthState::Degraded);

        let t1 = t0 + Duration::from_millis(50);
        hm.recovered(t1);
        assert_eq!(hm.state(), HealthState::Running);
    }

    #[test]
    fn halt_is_one_way() {
        let hm = HealthMonitor::new(3, Duration::from_secs(60));
        hm.halt("disk full".to_string());
        assert_eq!(hm.state(), HealthState::Halted);
        hm.report(ComponentFailure { at: Instant::now() });
        assert_eq!(hm.state(), HealthState::Halted);
    }
}
