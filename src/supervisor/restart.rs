//! Pure restart-decision and backoff functions. No I/O, no locking: these are
//! evaluated by the instance monitor on every child exit.

use std::time::Duration;

use crate::config::RestartMode;

const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// `restart_count` is clamped before being used as a shift amount so `2^n` never
/// overflows a `u64` backoff computed in nanoseconds.
const MAX_SHIFT: u32 = 62;

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    mode: RestartMode,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RestartPolicy {
    pub fn new(mode: RestartMode, max_attempts: u32) -> Self {
        Self {
            mode,
            max_attempts,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    pub fn with_initial_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = if initial.is_zero() {
            DEFAULT_INITIAL_BACKOFF
        } else {
            initial
        };
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Whether the instance should be respawned given the exit code it produced
    /// and the number of restarts already performed for this slot.
    pub fn should_restart(&self, exit_code: i32, restart_count: u32) -> bool {
        match self.mode {
            RestartMode::Never => false,
            RestartMode::OnFailure => {
                exit_code != 0 && self.within_attempts(restart_count)
            }
            RestartMode::Always => self.within_attempts(restart_count),
        }
    }

    fn within_attempts(&self, restart_count: u32) -> bool {
        self.max_attempts == 0 || restart_count < self.max_attempts
    }

    /// `initial * 2^restart_count`, capped at `max_backoff`. `restart_count` is
    /// clamped to a safe shift range first so huge counts saturate instead of
    /// overflowing.
    pub fn backoff(&self, restart_count: u32) -> Duration {
        if matches!(self.mode, RestartMode::Never) {
            return Duration::ZERO;
        }
        let shift = restart_count.min(MAX_SHIFT);
        let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let factor = u32::try_from(factor).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn never_never_restarts() {
        let policy = RestartPolicy::new(RestartMode::Never, 0);
        assert!(!policy.should_restart(1, 0));
        assert!(!policy.should_restart(0, 0));
        assert_eq!(policy.backoff(5), Duration::ZERO);
    }

    #[test]
    fn on_failure_does_not_restart_clean_exit() {
        let policy = RestartPolicy::new(RestartMode::OnFailure, 0);
        assert!(!policy.should_restart(0, 0));
        assert!(policy.should_restart(1, 0));
    }

    #[test]
    fn on_failure_respects_max_attempts() {
        let policy = RestartPolicy::new(RestartMode::OnFailure, 5);
        assert!(policy.should_restart(1, 4));
        assert!(!policy.should_restart(1, 5));
    }

    #[test]
    fn on_failure_unlimited_when_max_attempts_zero() {
        let policy = RestartPolicy::new(RestartMode::OnFailure, 0);
        assert!(policy.should_restart(1, 1_000_000));
    }

    #[test]
    fn always_restarts_regardless_of_exit_code() {
        let policy = RestartPolicy::new(RestartMode::Always, 3);
        assert!(policy.should_restart(0, 0));
        assert!(policy.should_restart(1, 2));
        assert!(!policy.should_restart(0, 3));
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    fn backoff_doubles_until_cap(#[case] restart_count: u32, #[case] expected_secs: u64) {
        let policy = RestartPolicy::new(RestartMode::Always, 0)
            .with_initial_backoff(Duration::from_secs(1))
            .with_max_backoff(Duration::from_secs(8));
        assert_eq!(policy.backoff(restart_count), Duration::from_secs(expected_secs));
    }

    #[test]
    fn backoff_seed_suite_schedule() {
        // scenario 2 from the seed suite: initial 1s, max 8s
        let policy = RestartPolicy::new(RestartMode::OnFailure, 5)
            .with_initial_backoff(Duration::from_secs(1))
            .with_max_backoff(Duration::from_secs(8));
        let expected = [1, 2, 4, 8, 8];
        for (count, secs) in expected.iter().enumerate() {
            assert_eq!(policy.backoff(count as u32), Duration::from_secs(*secs));
        }
    }

    #[rstest]
    #[case(0)]
    #[case(10)]
    #[case(62)]
    #[case(63)]
    #[case(1_000_000)]
    fn backoff_is_always_finite_and_bounded(#[case] restart_count: u32) {
        let policy = RestartPolicy::new(RestartMode::Always, 0);
        let backoff = policy.backoff(restart_count);
        assert!(backoff <= DEFAULT_MAX_BACKOFF);
    }

    #[rstest]
    #[case(32)]
    #[case(62)]
    #[case(63)]
    fn backoff_saturates_at_max_instead_of_wrapping_to_zero(#[case] restart_count: u32) {
        let policy = RestartPolicy::new(RestartMode::Always, 0)
            .with_initial_backoff(Duration::from_secs(1))
            .with_max_backoff(Duration::from_secs(300));
        assert_eq!(policy.backoff(restart_count), Duration::from_secs(300));
    }

    #[test]
    fn zero_initial_backoff_normalizes_to_one_second() {
        let policy = RestartPolicy::new(RestartMode::Always, 0).with_initial_backoff(Duration::ZERO);
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
    }

    #[test]
    fn backoff_is_monotone_non_decreasing_until_saturation() {
        let policy = RestartPolicy::new(RestartMode::Always, 0)
            .with_initial_backoff(Duration::from_secs(1))
            .with_max_backoff(Duration::from_secs(60));
        let mut previous = Duration::ZERO;
        for count in 0..20 {
            let current = policy.backoff(count);
            assert!(current >= previous);
            previous = current;
        }
    }
}
