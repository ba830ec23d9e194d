use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::context::Context;

use super::CommandError;

pub const DEFAULT_GRACE_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends `signal` to a process, then escalates to `SIGKILL` if the process has not
/// exited within `grace_timeout`. The caller is expected to run a concurrent task
/// that blocks on the child's exit and flips `exited` to `true`, notifying the
/// associated condvar; this terminator only drives the signal escalation, it does
/// not reap the child itself.
pub struct ProcessTerminator {
    pid: u32,
    signal: Signal,
    grace_timeout: Duration,
}

impl ProcessTerminator {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            signal: Signal::SIGTERM,
            grace_timeout: DEFAULT_GRACE_TIMEOUT,
        }
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_grace_timeout(mut self, grace_timeout: Duration) -> Self {
        self.grace_timeout = grace_timeout;
        self
    }

    /// Sends the configured signal, then waits on `exited` for up to `grace_timeout`
    /// before escalating to `SIGKILL`. Returns once the process has been observed to
    /// exit (by the caller's concurrent waiter) or once `SIGKILL` has been sent.
    pub fn shutdown(self, exited: Context<bool>) -> Result<(), CommandError> {
        signal::kill(Pid::from_raw(self.pid as i32), self.signal)?;

        let (lock, cvar) = exited.get_lock_cvar();
        let mut guard = lock.lock().unwrap_or_else(|poison| poison.into_inner());

        loop {
            if *guard {
                return Ok(());
            }
            let (next_guard, timeout) = cvar
                .wait_timeout(guard, self.grace_timeout)
                .unwrap_or_else(|poison| poison.into_inner());
            guard = next_guard;
            if *guard {
                return Ok(());
            }
            if timeout.timed_out() {
                let _ = signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
                // One more wait, uncapped in practice but SIGKILL cannot be caught
                // so the process will die promptly; we still bound it defensively.
                let (next_guard, _) = cvar
                    .wait_timeout(guard, self.grace_timeout)
                    .unwrap_or_else(|poison| poison.into_inner());
                guard = next_guard;
                return if *guard { Ok(()) } else { Err(CommandError::Timeout) };
            }
        }
    }
}
