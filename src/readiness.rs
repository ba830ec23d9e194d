//! Monotonic readiness latch. Becomes `true` exactly once per Supervisor lifetime
//! and stays `true`; downstream dependents block on it via [`ReadinessGate::wait`].

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

const POLL_PERIOD: Duration = Duration::from_millis(500);

#[derive(Error, Debug, Clone)]
pub enum ReadinessError {
    #[error("readiness wait timed out after {0:?}")]
    Timeout(Duration),

    #[error("readiness wait timed out after {0:?}: last probe error: {1}")]
    TimeoutWithLastError(Duration, String),
}

#[derive(Default)]
struct GateState {
    ready: bool,
    last_error: Option<String>,
}

pub struct ReadinessGate {
    state: Mutex<GateState>,
    cvar: Condvar,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cvar: Condvar::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).ready
    }

    /// Sets the latch. Idempotent: once true, further calls are no-ops, preserving
    /// the false→true-at-most-once invariant.
    pub fn mark_ready(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if !state.ready {
            state.ready = true;
            self.cvar.notify_all();
        }
    }

    /// Records the most recent probe failure so a subsequent readiness timeout can
    /// surface it instead of a bare timeout error.
    pub fn record_probe_error(&self, error: impl Into<String>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.last_error = Some(error.into());
    }

    /// Blocks until ready or `deadline` elapses, polling at a 500 ms period as
    /// specified. Returns the last recorded probe error on timeout when available.
    pub fn wait(&self, deadline: Duration) -> Result<(), ReadinessError> {
        let start = Instant::now();
        loop {
            let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if state.ready {
                return Ok(());
            }
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return match state.last_error.clone() {
                    Some(err) => Err(ReadinessError::TimeoutWithLastError(deadline, err)),
                    None => Err(ReadinessError::Timeout(deadline)),
                };
            }
            let remaining = deadline - elapsed;
            let wait_for = remaining.min(POLL_PERIOD);
            let (_guard, _timeout) = self
                .cvar
                .wait_timeout(state, wait_for)
                .unwrap_or_else(|p| p.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn becomes_ready_immediately_when_already_marked() {
        let gate = ReadinessGate::new();
        gate.mark_ready();
        assert!(gate.wait(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn times_out_when_never_marked_ready() {
        let gate = ReadinessGate::new();
        assert!(matches!(
            gate.wait(Duration::from_millis(50)),
            Err(ReadinessError::Timeout(_))
        ));
    }

    #[test]
    fn times_out_with_last_error_when_probe_failed() {
        let gate = ReadinessGate::new();
        gate.record_probe_error("connect-failed");
        assert!(matches!(
            gate.wait(Duration::from_millis(50)),
            Err(ReadinessError::TimeoutWithLastError(_, _))
        ));
    }

    #[test]
    fn unblocks_as_soon_as_another_thread_marks_ready() {
        let gate = Arc::new(ReadinessGate::new());
        let writer = gate.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.mark_ready();
        });
        assert!(gate.wait(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn mark_ready_is_idempotent() {
        let gate = ReadinessGate::new();
        gate.mark_ready();
        gate.mark_ready();
        assert!(gate.is_ready());
    }
}
