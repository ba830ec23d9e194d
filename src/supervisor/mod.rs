//! Supervisor: owns every running instance of one configured process, drives
//! startup/shutdown, scaling and the readiness gate for that process.

pub mod error;
pub mod instance;
pub mod restart;

pub use error::SupervisorError;
pub use instance::{DeathNotifier, Instance, InstanceSnapshot, InstanceState, SpawnConfig};
pub use restart::RestartPolicy;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::Sender;
use tracing::warn;

use crate::command::stream::Event;
use crate::config::{HealthCheckConfig, ProcessConfig};
use crate::health::{checker_for, drives_readiness, HealthChecker};
use crate::hooks::HookExecutor;
use crate::readiness::ReadinessGate;
use crate::resources::ResourceCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Runtime parameters an instance needs that are derived once from `ProcessConfig`
/// and shared across every instance of that process.
struct SharedInstanceParams {
    shutdown_signal: nix::sys::signal::Signal,
    grace_timeout: Duration,
    pre_stop_hook: Option<String>,
    restart_policy: RestartPolicy,
    health_checker: Option<Arc<dyn HealthChecker>>,
    health_check_config: Option<HealthCheckConfig>,
}

pub struct Supervisor {
    process_name: String,
    config: ProcessConfig,
    params: SharedInstanceParams,
    instances: Mutex<Vec<Instance>>,
    next_index: AtomicU32,
    readiness: Arc<ReadinessGate>,
    hooks: Arc<dyn HookExecutor>,
    resource_collector: Arc<dyn ResourceCollector>,
    log_sink: Sender<Event>,
    death_notifier: Mutex<Option<DeathNotifier>>,
    state: Mutex<SupervisorState>,
}

impl Supervisor {
    pub fn new(
        config: ProcessConfig,
        hooks: Arc<dyn HookExecutor>,
        resource_collector: Arc<dyn ResourceCollector>,
        log_sink: Sender<Event>,
    ) -> Result<Self, SupervisorError> {
        let signal = crate::config::signal_from_name(&config.shutdown.signal).ok_or_else(|| {
            SupervisorError::Internal(
                config.name.clone(),
                format!("unknown shutdown signal `{}`", config.shutdown.signal),
            )
        })?;

        let health_checker: Option<Arc<dyn HealthChecker>> = config
            .health_check
            .as_ref()
            .map(|hc| Arc::from(checker_for(&hc.kind)));

        let restart_policy = RestartPolicy::new(config.restart, config.restart_max_attempts)
            .with_initial_backoff(Duration::from_secs(config.restart_initial_backoff_secs.max(1)))
            .with_max_backoff(Duration::from_secs(
                config.restart_max_backoff_secs.max(config.restart_initial_backoff_secs.max(1)),
            ));

        let params = SharedInstanceParams {
            shutdown_signal: signal,
            grace_timeout: config.shutdown.grace_timeout(),
            pre_stop_hook: config.shutdown.pre_stop_hook.clone(),
            restart_policy,
            health_checker,
            health_check_config: config.health_check.clone(),
        };

        Ok(Self {
            process_name: config.name.clone(),
            config,
            params,
            instances: Mutex::new(Vec::new()),
            next_index: AtomicU32::new(0),
            readiness: Arc::new(ReadinessGate::new()),
            hooks,
            resource_collector,
            log_sink,
            death_notifier: Mutex::new(None),
            state: Mutex::new(SupervisorState::Idle),
        })
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn readiness_gate(&self) -> Arc<ReadinessGate> {
        self.readiness.clone()
    }

    pub fn set_death_notifier(&self, notifier: DeathNotifier) {
        *self.death_notifier.lock().unwrap_or_else(|p| p.into_inner()) = Some(notifier);
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn instance_snapshots(&self) -> Vec<InstanceSnapshot> {
        self.instances
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(Instance::snapshot)
            .collect()
    }

    /// Stops every instance, running each one's pre-stop hook and waiting up to
    /// `deadline` in total for the whole process to quiesce.
    pub fn stop(&self, deadline: Duration) -> Result<(), SupervisorError> {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = SupervisorState::Stopping;
        let start = std::time::Instant::now();

        let instances: Vec<Instance> = {
            let mut guard = self.instances.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        let count = instances.len();

        let handles: Vec<_> = instances
            .into_iter()
            .map(|instance| std::thread::spawn(move || instance.stop()))
            .collect();

        for handle in handles {
            let _ = handle.join();
        }

        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = SupervisorState::Stopped;

        if start.elapsed() > deadline {
            return Err(SupervisorError::StopTimeout(self.process_name.clone(), count));
        }
        Ok(())
    }

    pub fn wait_for_readiness(&self, deadline: Duration) -> Result<(), SupervisorError> {
        self.readiness.wait(deadline).map_err(|_| {
            SupervisorError::ReadinessTimeout(self.process_name.clone(), deadline)
        })
    }

    pub fn mark_ready_immediately(&self) {
        self.readiness.mark_ready();
    }

    /// Scales the process to `target` instances. Rejects scaling oneshot/scheduled
    /// processes and rejects targets above `max_scale` or outside the 0..1 range
    /// for scale-locked processes.
    pub fn scale_to(&self, target: u32) -> Result<(), SupervisorError> {
        use crate::config::ProcessType;
        if self.config.process_type != ProcessType::Longrun {
            return Err(SupervisorError::OneshotCannotScale(self.process_name.clone()));
        }
        if self.config.scale_locked && target > 1 {
            return Err(SupervisorError::ScaleLocked(self.process_name.clone()));
        }
        if self.config.max_scale != 0 && target > self.config.max_scale {
            return Err(SupervisorError::ScaleExceedsMax(
                self.process_name.clone(),
                target,
                self.config.max_scale,
            ));
        }

        let mut instances = self.instances.lock().unwrap_or_else(|p| p.into_inner());
        let current = instances.len() as u32;

        if target > current {
            for _ in current..target {
                let index = self.next_index.fetch_add(1, Ordering::SeqCst);
                let instance = self.spawn_instance(index);
                instances.push(instance);
            }
        } else if target < current {
            let removed: Vec<Instance> = instances.split_off(target as usize);
            drop(instances);
            for instance in removed {
                instance.stop();
            }
        }
        Ok(())
    }

    fn spawn_instance(&self, index: u32) -> Instance {
        let spawn_config = Arc::new(SpawnConfig {
            process_name: self.process_name.clone(),
            command: self.config.command.clone(),
            env: self.config.env.clone(),
            working_dir: self.config.working_dir.as_ref().map(std::path::PathBuf::from),
            port_base: self.config.port_base,
            shutdown_signal: self.params.shutdown_signal,
            grace_timeout: self.params.grace_timeout,
            pre_stop_hook: self.params.pre_stop_hook.clone(),
            restart_policy: self.params.restart_policy.clone(),
            log_sink: self.log_sink.clone(),
            scheduled: false,
            schedule_expression: None,
            health_checker: self.params.health_checker.clone(),
            health_check_config: self.params.health_check_config.clone(),
            resource_collector: self.resource_collector.clone(),
            max_memory_mb: self.config.max_memory_mb,
        });

        let process_name = self.process_name.clone();
        let outer_notifier = self.death_notifier.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let notifier: DeathNotifier = Arc::new(move || {
            warn!(process = %process_name, "instance exhausted its restart policy");
            if let Some(cb) = &outer_notifier {
                cb();
            }
        });

        Instance::spawn(index, spawn_config, self.hooks.clone(), notifier)
    }

    /// Runs the pre-start hook, spawns the configured scale of instances, and
    /// spawns a readiness watcher thread against an `Arc` handle so it can safely
    /// poll instance state from the background. Manager always holds Supervisors
    /// behind `Arc`, so this is the entry point it calls.
    pub fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = SupervisorState::Starting;
        self.scale_to(self.config.scale)?;
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = SupervisorState::Running;

        let mode = self.config.health_check.as_ref().map(|hc| hc.mode());
        let readiness_driven_by_health = mode.map(drives_readiness).unwrap_or(false);

        let supervisor = self.clone();
        std::thread::spawn(move || loop {
            let snapshots = supervisor.instance_snapshots();
            if snapshots.is_empty() {
                std::thread::sleep(Duration::from_millis(200));
                continue;
            }
            let all_running = snapshots
                .iter()
                .all(|s| s.state == InstanceState::Running);
            let healthy_ok = if readiness_driven_by_health {
                let guard = supervisor.instances.lock().unwrap_or_else(|p| p.into_inner());
                guard.iter().all(Instance::last_check_succeeded)
            } else {
                true
            };

            if all_running && healthy_ok {
                supervisor.readiness.mark_ready();
                break;
            }
            if supervisor.state() != SupervisorState::Running {
                break;
            }
            std::thread::sleep(Duration::from_millis(200));
        });

        Ok(())
    }
}
