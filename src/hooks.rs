//! Hook executor: runs a named command around a process's lifecycle transitions
//! and enforces a timeout on it. A narrow, externally-collaborating interface per
//! the component design — the core only depends on the [`HookExecutor`] trait, not
//! on a specific shell or sandboxing mechanism.

use std::process::Command;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookType {
    PreStart,
    PostStart,
    PreStop,
    PostStop,
}

impl HookType {
    pub fn label(&self) -> &'static str {
        match self {
            HookType::PreStart => "pre_start",
            HookType::PostStart => "post_start",
            HookType::PreStop => "pre_stop",
            HookType::PostStop => "post_stop",
        }
    }

    /// Pre-start failures are fatal to Supervisor::start; every other hook only
    /// logs a warning and continues (see error handling design).
    pub fn is_fatal(&self) -> bool {
        matches!(self, HookType::PreStart)
    }
}

#[derive(Error, Debug)]
pub enum HookError {
    #[error("hook command failed to spawn: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("hook exited with non-zero status: {0}")]
    NonZeroExit(std::process::ExitStatus),

    #[error("hook did not complete within {0:?}")]
    Timeout(Duration),
}

pub trait HookExecutor: Send + Sync {
    fn run_hook(&self, hook: HookType, command: &str, timeout: Duration) -> Result<(), HookError>;
}

/// Runs the hook command through `sh -c`, killing it if it outruns `timeout`.
pub struct ShellHookExecutor;

impl HookExecutor for ShellHookExecutor {
    fn run_hook(&self, _hook: HookType, command: &str, timeout: Duration) -> Result<(), HookError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .spawn()
            .map_err(HookError::Spawn)?;

        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait().map_err(HookError::Spawn)? {
                return if status.success() {
                    Ok(())
                } else {
                    Err(HookError::NonZeroExit(status))
                };
            }
            if std::time::Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HookError::Timeout(timeout));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeding_hook_returns_ok() {
        let executor = ShellHookExecutor;
        assert!(executor
            .run_hook(HookType::PreStop, "true", Duration::from_secs(1))
            .is_ok());
    }

    #[test]
    fn failing_hook_returns_non_zero_exit() {
        let executor = ShellHookExecutor;
        assert!(matches!(
            executor.run_hook(HookType::PostStop, "exit 3", Duration::from_secs(1)),
            Err(HookError::NonZeroExit(_))
        ));
    }

    #[test]
    fn slow_hook_times_out() {
        let executor = ShellHookExecutor;
        assert!(matches!(
            executor.run_hook(HookType::PreStop, "sleep 5", Duration::from_millis(100)),
            Err(HookError::Timeout(_))
        ));
    }

    #[test]
    fn pre_start_is_the_only_fatal_hook() {
        assert!(HookType::PreStart.is_fatal());
        assert!(!HookType::PostStart.is_fatal());
        assert!(!HookType::PreStop.is_fatal());
        assert!(!HookType::PostStop.is_fatal());
    }
}
