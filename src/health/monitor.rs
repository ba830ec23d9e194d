//! HealthMonitor: periodically invokes a [`HealthChecker`], applies hysteresis via
//! failure/success thresholds, and emits a stream of status records.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::config::{HealthCheckConfig, HealthCheckMode};
use crate::context::Context;

use super::checker::{HealthCheckError, HealthChecker};

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_check_succeeded: bool,
    pub error: Option<String>,
}

struct Hysteresis {
    currently_healthy: bool,
    consecutive_fails: u32,
    consecutive_successes: u32,
    failure_threshold: u32,
    success_threshold: u32,
}

impl Hysteresis {
    fn new(failure_threshold: u32, success_threshold: u32) -> Self {
        Self {
            currently_healthy: true,
            consecutive_fails: 0,
            consecutive_successes: 0,
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
        }
    }

    /// Applies one probe outcome and returns the `healthy` value to emit.
    fn record(&mut self, succeeded: bool) -> bool {
        if succeeded {
            self.consecutive_fails = 0;
            self.consecutive_successes += 1;
        } else {
            self.consecutive_successes = 0;
            self.consecutive_fails += 1;
        }

        if self.currently_healthy {
            if !succeeded && self.consecutive_fails >= self.failure_threshold {
                self.currently_healthy = false;
            }
        } else if succeeded && self.consecutive_successes >= self.success_threshold {
            self.currently_healthy = true;
        }

        self.currently_healthy
    }
}

/// Spawns the monitor loop on a dedicated thread. The returned receiver delivers
/// one [`HealthStatus`] per probe, newest overwriting any unread prior record when
/// the channel is saturated (bounded to capacity 1: the latest record always
/// supersedes older ones for restart purposes, per the design notes).
pub fn spawn_health_monitor(
    checker: Arc<dyn HealthChecker>,
    config: HealthCheckConfig,
    cancel: Context<bool>,
) -> (Receiver<HealthStatus>, JoinHandle<()>) {
    let (tx, rx) = bounded(1);

    let handle = thread::spawn(move || {
        if wait_cancellable(&cancel, config.initial_delay()) {
            return;
        }

        let mut hysteresis = Hysteresis::new(config.failure_threshold, config.success_threshold);

        loop {
            let result = checker.check(config.timeout());
            let succeeded = result.is_ok();
            let healthy = hysteresis.record(succeeded);

            let status = HealthStatus {
                healthy,
                last_check_succeeded: succeeded,
                error: result.err().map(|e: HealthCheckError| e.to_string()),
            };
            send_latest(&tx, status);

            if wait_cancellable(&cancel, config.period()) {
                return;
            }
        }
    });

    (rx, handle)
}

fn send_latest(tx: &Sender<HealthStatus>, status: HealthStatus) {
    if tx.try_send(status.clone()).is_err() {
        // Channel full: drop the stale record, keep the newest.
        let _ = tx.try_recv();
        let _ = tx.try_send(status);
    }
}

/// Waits for `duration` or until `cancel` fires, whichever is sooner. Returns
/// `true` if the wait was interrupted by cancellation.
fn wait_cancellable(cancel: &Context<bool>, duration: Duration) -> bool {
    let (lock, cvar) = cancel.get_lock_cvar();
    let guard = lock.lock().unwrap_or_else(|p| p.into_inner());
    if *guard {
        return true;
    }
    let (guard, _timeout) = cvar
        .wait_timeout(guard, duration)
        .unwrap_or_else(|p| p.into_inner());
    *guard
}

/// Derives whether the gate bound to this monitor should be considered ready,
/// independent of the liveness hysteresis: readiness cares about
/// `last_check_succeeded`, not the hysteresis-smoothed `healthy` value.
pub fn drives_readiness(mode: HealthCheckMode) -> bool {
    matches!(mode, HealthCheckMode::Readiness | HealthCheckMode::Both)
}

pub fn drives_liveness(mode: HealthCheckMode) -> bool {
    matches!(mode, HealthCheckMode::Liveness | HealthCheckMode::Both)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1, vec![true, false, true, false], vec![true, false, true, false])]
    fn flips_on_every_alternating_probe_when_thresholds_are_one(
        #[case] failure_threshold: u32,
        #[case] success_threshold: u32,
        #[case] outcomes: Vec<bool>,
        #[case] expected: Vec<bool>,
    ) {
        let mut hysteresis = Hysteresis::new(failure_threshold, success_threshold);
        let actual: Vec<bool> = outcomes.into_iter().map(|o| hysteresis.record(o)).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn requires_three_consecutive_to_flip_with_threshold_three() {
        let mut hysteresis = Hysteresis::new(3, 3);
        assert!(hysteresis.record(false));
        assert!(hysteresis.record(false));
        assert!(!hysteresis.record(false));
        assert!(!hysteresis.record(true));
        assert!(!hysteresis.record(true));
        assert!(hysteresis.record(true));
    }

    #[test]
    fn successes_reset_the_failure_counter() {
        let mut hysteresis = Hysteresis::new(3, 1);
        assert!(hysteresis.record(false));
        assert!(hysteresis.record(false));
        assert!(hysteresis.record(true));
        assert!(hysteresis.record(false));
        assert!(hysteresis.record(false));
        assert!(!hysteresis.record(false));
    }
}
