//! Resource collector: samples CPU and memory usage for running instances. Optional
//! — the Supervisor only consults it when `max_memory_mb > 0` or metrics are
//! requested, so a `NoopResourceCollector` is a legitimate production choice.

use std::sync::Mutex;
use std::time::Instant;

use sysinfo::{System, SystemExt};

#[cfg(feature = "resource-metrics")]
use sysinfo::{Pid, PidExt, ProcessExt, ProcessRefreshKind};

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_rss_bytes: u64,
    pub memory_percent: f32,
}

impl ResourceSample {
    /// Samples are considered too fresh to act on until this much time has passed
    /// since the instance spawned, guarding against false positives from a process
    /// still warming up (design notes, resource metrics feedback loop).
    pub fn is_stale_guard_elapsed(spawned_at: Instant, min_sample_age: std::time::Duration) -> bool {
        spawned_at.elapsed() >= min_sample_age
    }
}

pub trait ResourceCollector: Send + Sync {
    /// Samples resource usage for the process with the given OS pid. Returns
    /// `None` if the pid is no longer known to the collector.
    fn sample(&self, pid: u32) -> Option<ResourceSample>;
}

/// Collector backed by `sysinfo`'s process table. Maintains its own `System`
/// behind a mutex since `sysinfo`'s refresh methods take `&mut self`.
pub struct SysinfoResourceCollector {
    system: Mutex<System>,
}

impl Default for SysinfoResourceCollector {
    fn default() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl ResourceCollector for SysinfoResourceCollector {
    #[cfg(feature = "resource-metrics")]
    fn sample(&self, pid: u32) -> Option<ResourceSample> {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        let sysinfo_pid = Pid::from_u32(pid);
        system.refresh_process_specifics(
            sysinfo_pid,
            ProcessRefreshKind::new().with_cpu(),
        );
        let process = system.process(sysinfo_pid)?;
        let total_memory = system.total_memory().max(1);
        Some(ResourceSample {
            cpu_percent: process.cpu_usage(),
            memory_rss_bytes: process.memory(),
            memory_percent: (process.memory() as f32 / total_memory as f32) * 100.0,
        })
    }

    #[cfg(not(feature = "resource-metrics"))]
    fn sample(&self, _pid: u32) -> Option<ResourceSample> {
        None
    }
}

/// Used where the embedder has no resource collector (`resource_metrics_enabled =
/// false`); the memory-ceiling kill path and metrics sink simply see no samples.
pub struct NoopResourceCollector;

impl ResourceCollector for NoopResourceCollector {
    fn sample(&self, _pid: u32) -> Option<ResourceSample> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_collector_returns_no_samples() {
        let collector = NoopResourceCollector;
        assert!(collector.sample(1).is_none());
    }

    #[test]
    fn stale_guard_respects_minimum_age() {
        let spawned_at = Instant::now();
        assert!(!ResourceSample::is_stale_guard_elapsed(
            spawned_at,
            std::time::Duration::from_secs(5)
        ));
    }
}
