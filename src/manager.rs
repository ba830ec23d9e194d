//! Manager: the top-level entry point. Owns every process's Supervisor, the
//! Scheduler, and the shared ambient services (resource metrics, oneshot
//! history, readiness file, audit log) that they all draw on. Orders startup by
//! the dependency graph and shutdown in reverse.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crossbeam::channel::{bounded, Sender};
use thiserror::Error;
use tracing::{error, warn};

use crate::audit::{AuditEvent, AuditLogger, NoopAuditLogger};
use crate::command::logger::EventReceiver;
use crate::command::stream::{Event, Metadata};
use crate::command::{CommandExecutor, CommandHandle, EventLogger, EventStreamer, ProcessRunner};
use crate::config::{Config, InitialState, ProcessConfig, ProcessType};
use crate::context::Context;
use crate::dependency_graph::{DependencyGraph, DependencyGraphError};
use crate::hooks::{HookExecutor, ShellHookExecutor};
use crate::metrics::{MetricsSink, NoopMetricsSink};
use crate::oneshot_history::{OneshotExecution, OneshotHistory, TriggerType};
use crate::readiness_file::ReadinessFileManager;
use crate::resources::{NoopResourceCollector, ResourceCollector, SysinfoResourceCollector};
use crate::scheduler::{CronJob, Scheduler, SchedulerError};
use crate::supervisor::{InstanceState, Supervisor, SupervisorError};

const DEFAULT_DEPENDENCY_TIMEOUT: Duration = Duration::from_secs(300);
const DEATH_CHANNEL_CAPACITY: usize = 10;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("process `{0}` not found")]
    ProcessNotFound(String),

    #[error("process `{0}` already exists")]
    ProcessAlreadyExists(String),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    DependencyGraph(#[from] DependencyGraphError),

    #[error("config validation failed: {0}")]
    Config(#[from] crate::config::ConfigError),
}

#[derive(Debug, Clone)]
pub struct ProcessSummary {
    pub name: String,
    pub process_type: ProcessType,
    pub state: Option<crate::supervisor::SupervisorState>,
    pub instance_count: usize,
}

pub struct Manager {
    config: RwLock<Config>,
    supervisors: RwLock<HashMap<String, Arc<Supervisor>>>,
    scheduler: Arc<Scheduler>,
    resource_collector: Arc<dyn ResourceCollector>,
    oneshot_history: Arc<OneshotHistory>,
    readiness_file: Arc<ReadinessFileManager>,
    hooks: Arc<dyn HookExecutor>,
    metrics: Arc<dyn MetricsSink>,
    audit: Arc<dyn AuditLogger>,
    log_sink: Sender<Event>,
    death_tx: Sender<String>,
    all_dead: Context<bool>,
}

impl Manager {
    pub fn new(config: Config, readiness_path: Option<PathBuf>) -> Result<Arc<Self>, ManagerError> {
        config.validate()?;

        let (log_tx, log_rx) = crossbeam::channel::unbounded::<Event>();
        std::thread::spawn(move || {
            EventReceiver::new(log_rx).log();
        });

        let resource_collector: Arc<dyn ResourceCollector> = if config.global.resource_metrics_enabled
        {
            Arc::new(SysinfoResourceCollector::default())
        } else {
            Arc::new(NoopResourceCollector)
        };

        let oneshot_history = Arc::new(OneshotHistory::new(
            config.global.oneshot_history_max_entries,
            Duration::from_secs(config.global.oneshot_history_max_age_secs),
        ));

        let scheduler = Arc::new(Scheduler::new(oneshot_history.clone(), log_tx.clone()));
        let (death_tx, death_rx) = bounded::<String>(DEATH_CHANNEL_CAPACITY);

        let manager = Arc::new(Self {
            config: RwLock::new(config),
            supervisors: RwLock::new(HashMap::new()),
            scheduler,
            resource_collector,
            oneshot_history,
            readiness_file: Arc::new(ReadinessFileManager::new(readiness_path)),
            hooks: Arc::new(ShellHookExecutor),
            metrics: Arc::new(NoopMetricsSink),
            audit: Arc::new(NoopAuditLogger),
            log_sink: log_tx,
            death_tx,
            all_dead: Context::new(),
        });

        let monitor = manager.clone();
        std::thread::spawn(move || {
            for name in death_rx.iter() {
                warn!(process = %name, "death notification received");
                monitor.check_all_processes_dead();
            }
        });

        Ok(manager)
    }

    /// Scans every registered Supervisor and, if each has zero running instances
    /// and at least one process is configured, fires the all-dead latch. The
    /// latch closes at most once and never reopens.
    fn check_all_processes_dead(&self) {
        let supervisors = self.supervisors.read().unwrap_or_else(|p| p.into_inner());
        if supervisors.is_empty() {
            return;
        }
        let all_dead = supervisors.values().all(|supervisor| {
            supervisor
                .instance_snapshots()
                .iter()
                .all(|snapshot| snapshot.state != InstanceState::Running)
        });
        if all_dead {
            let _ = self.all_dead.cancel_all(true);
        }
    }

    /// Builds the dependency graph, starts every enabled process in topological
    /// order (waiting on each dependency's readiness gate first), registers
    /// scheduled processes with the Scheduler, and runs startup oneshots.
    pub fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        let config = self.config.read().unwrap_or_else(|p| p.into_inner()).clone();
        let graph = DependencyGraph::build(&config.processes);
        let order = graph.topo_order()?;

        self.scheduler.start();

        for name in order {
            let Some(process) = config.processes.get(&name) else { continue };
            if !process.enabled {
                continue;
            }

            for dep in &process.depends_on {
                if let Some(dep_supervisor) = self.supervisors.read().unwrap_or_else(|p| p.into_inner()).get(dep)
                {
                    dep_supervisor
                        .wait_for_readiness(DEFAULT_DEPENDENCY_TIMEOUT)
                        .map_err(ManagerError::Supervisor)?;
                }
            }

            match process.process_type {
                ProcessType::Scheduled => self.register_scheduled(process)?,
                ProcessType::Oneshot => self.run_startup_oneshot(process),
                ProcessType::Longrun => self.start_longrun(process)?,
            }
        }

        if let Err(err) = self.readiness_file.mark_ready() {
            error!(error = %err, "failed to write readiness file");
        }
        Ok(())
    }

    /// Creates this process's Supervisor and registers it in the map. For
    /// `initial_state = running` it starts the instances normally; for
    /// `initial_state = stopped` it leaves the instance pool empty and marks the
    /// readiness gate ready immediately, so downstream dependents are not blocked
    /// waiting on a process the operator asked to start paused.
    fn start_longrun(self: &Arc<Self>, process: &ProcessConfig) -> Result<(), ManagerError> {
        let supervisor = Arc::new(Supervisor::new(
            process.clone(),
            self.hooks.clone(),
            self.resource_collector.clone(),
            self.log_sink.clone(),
        )?);

        let manager = self.clone();
        let name = process.name.clone();
        supervisor.set_death_notifier(Arc::new(move || {
            if manager.death_tx.try_send(name.clone()).is_err() {
                warn!(process = %name, "death channel saturated, checking inline");
                manager.check_all_processes_dead();
            }
        }));

        if process.initial_state == InitialState::Stopped {
            supervisor.mark_ready_immediately();
        } else {
            supervisor.start()?;
            self.audit.record(AuditEvent::ProcessStarted {
                process_name: process.name.clone(),
            });
        }

        self.supervisors
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(process.name.clone(), supervisor);
        Ok(())
    }

    fn register_scheduled(&self, process: &ProcessConfig) -> Result<(), ManagerError> {
        let Some(schedule) = &process.schedule else {
            return Ok(());
        };
        let timezone = chrono_tz::Tz::from_str(&schedule.timezone).unwrap_or(chrono_tz::UTC);
        self.scheduler.add_job(CronJob {
            process_name: process.name.clone(),
            command: process.command.clone(),
            env: process.env.clone(),
            working_dir: process.working_dir.as_ref().map(PathBuf::from),
            cron_expression: schedule.cron_expression.clone(),
            timezone,
            timeout: schedule.timeout(),
            max_concurrent: schedule.max_concurrent,
        })?;
        Ok(())
    }

    /// Runs a non-scheduled oneshot process once at startup, fire-and-forget,
    /// recording the outcome to the shared oneshot history.
    fn run_startup_oneshot(&self, process: &ProcessConfig) {
        let process = process.clone();
        let history = self.oneshot_history.clone();
        let log_sink = self.log_sink.clone();
        std::thread::spawn(move || {
            let instance_id = format!("{}-startup", process.name);
            let started_at = std::time::SystemTime::now();
            let metadata = Metadata::new(process.name.clone(), instance_id.clone());

            let outcome = (|| -> Result<std::process::ExitStatus, String> {
                let runner = ProcessRunner::new(&process.command[0], &process.command[1..])
                    .with_env(&process.env)
                    .with_working_dir(process.working_dir.as_ref().map(PathBuf::from).as_ref())
                    .with_metadata(metadata);
                let started = runner.start().map_err(|e| e.to_string())?;
                let streaming = started.stream(log_sink).map_err(|e| e.to_string())?;
                streaming.wait().map_err(|e| e.to_string())
            })();

            let finished_at = std::time::SystemTime::now();
            let duration = finished_at.duration_since(started_at).unwrap_or_default();
            let (exit_code, success, error_text) = match outcome {
                Ok(status) => (status.code(), status.success(), None),
                Err(err) => (None, false, Some(err)),
            };

            history.record(OneshotExecution {
                id: 0,
                process_name: process.name.clone(),
                instance_id,
                started_at,
                finished_at,
                exit_code,
                success,
                error_text,
                duration,
                trigger_type: TriggerType::Manual,
            });
        });
    }

    /// Stops the scheduler first, then every longrun process's Supervisor in
    /// reverse dependency order, concurrently within each order level.
    pub fn stop(self: &Arc<Self>, deadline: Duration) -> Result<(), ManagerError> {
        self.scheduler.stop();

        let config = self.config.read().unwrap_or_else(|p| p.into_inner()).clone();
        let graph = DependencyGraph::build(&config.processes);
        let order = graph.shutdown_order().unwrap_or_default();

        let supervisors = self.supervisors.write().unwrap_or_else(|p| p.into_inner());
        for name in order {
            if let Some(supervisor) = supervisors.get(&name) {
                if let Err(err) = supervisor.stop(deadline) {
                    error!(process = %name, error = %err, "error stopping process");
                }
                self.audit.record(AuditEvent::ProcessStopped { process_name: name });
            }
        }
        drop(supervisors);

        self.readiness_file.clear();
        Ok(())
    }

    pub fn add_process(self: &Arc<Self>, process: ProcessConfig) -> Result<(), ManagerError> {
        process.validate()?;
        {
            let mut config = self.config.write().unwrap_or_else(|p| p.into_inner());
            if config.processes.contains_key(&process.name) {
                return Err(ManagerError::ProcessAlreadyExists(process.name.clone()));
            }
            config.processes.insert(process.name.clone(), process.clone());
        }

        if process.enabled {
            match process.process_type {
                ProcessType::Scheduled => self.register_scheduled(&process)?,
                ProcessType::Oneshot => self.run_startup_oneshot(&process),
                ProcessType::Longrun => self.start_longrun(&process)?,
            }
        }
        self.audit.record(AuditEvent::ProcessAdded {
            process_name: process.name,
        });
        Ok(())
    }

    pub fn remove_process(self: &Arc<Self>, name: &str) -> Result<(), ManagerError> {
        let stop_timeout = Duration::from_secs(
            self.config.read().unwrap_or_else(|p| p.into_inner()).global.process_stop_timeout,
        );
        let removed = self
            .supervisors
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
        if let Some(supervisor) = removed {
            supervisor.stop(stop_timeout)?;
        }
        let _ = self.scheduler.remove_job(name);
        self.config
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .processes
            .remove(name)
            .ok_or_else(|| ManagerError::ProcessNotFound(name.to_string()))?;

        self.audit.record(AuditEvent::ProcessRemoved {
            process_name: name.to_string(),
        });
        Ok(())
    }

    /// Replaces a process's configuration. Stops and restarts its Supervisor; on
    /// failure to bring the new configuration up, restores the previous one.
    pub fn update_process(self: &Arc<Self>, process: ProcessConfig) -> Result<(), ManagerError> {
        let previous = {
            let config = self.config.read().unwrap_or_else(|p| p.into_inner());
            config
                .processes
                .get(&process.name)
                .cloned()
                .ok_or_else(|| ManagerError::ProcessNotFound(process.name.clone()))?
        };

        self.remove_process(&process.name)?;
        match self.add_process(process.clone()) {
            Ok(()) => {
                self.audit.record(AuditEvent::ProcessUpdated {
                    process_name: process.name,
                });
                Ok(())
            }
            Err(err) => {
                warn!(process = %process.name, error = %err, "rolling back failed process update");
                let _ = self.add_process(previous);
                Err(err)
            }
        }
    }

    /// Diff-based reload: removes processes no longer present, adds new ones,
    /// and updates ones whose command changed. Processes with no change are left
    /// untouched.
    pub fn reload_config(self: &Arc<Self>, new_config: Config) -> Result<(), ManagerError> {
        new_config.validate()?;
        let previous_names: Vec<String> = {
            let config = self.config.read().unwrap_or_else(|p| p.into_inner());
            config.processes.keys().cloned().collect()
        };

        for name in &previous_names {
            if !new_config.processes.contains_key(name) {
                self.remove_process(name)?;
            }
        }

        for (name, process) in &new_config.processes {
            let config = self.config.read().unwrap_or_else(|p| p.into_inner());
            let existing = config.processes.get(name).cloned();
            drop(config);

            match existing {
                None => self.add_process(process.clone())?,
                Some(current) if !configs_equivalent(&current, process) => {
                    self.update_process(process.clone())?
                }
                Some(_) => {}
            }
        }

        self.config.write().unwrap_or_else(|p| p.into_inner()).global = new_config.global;
        self.audit.record(AuditEvent::ConfigReloaded);
        Ok(())
    }

    pub fn scale_process(&self, name: &str, target: u32) -> Result<(), ManagerError> {
        let global_max = self.config.read().unwrap_or_else(|p| p.into_inner()).global.max_process_scale;
        if global_max != 0 && target > global_max {
            return Err(ManagerError::Supervisor(SupervisorError::ScaleExceedsMax(
                name.to_string(),
                target,
                global_max,
            )));
        }

        let supervisors = self.supervisors.read().unwrap_or_else(|p| p.into_inner());
        let supervisor = supervisors
            .get(name)
            .ok_or_else(|| ManagerError::ProcessNotFound(name.to_string()))?;
        supervisor.scale_to(target)?;
        self.metrics.scale_changed(name, target);
        Ok(())
    }

    pub fn list_processes(&self) -> Vec<ProcessSummary> {
        let config = self.config.read().unwrap_or_else(|p| p.into_inner());
        let supervisors = self.supervisors.read().unwrap_or_else(|p| p.into_inner());

        config
            .processes
            .values()
            .map(|process| {
                let supervisor = supervisors.get(&process.name);
                ProcessSummary {
                    name: process.name.clone(),
                    process_type: process.process_type,
                    state: supervisor.map(|s| s.state()),
                    instance_count: supervisor.map(|s| s.instance_snapshots().len()).unwrap_or(0),
                }
            })
            .collect()
    }

    /// Per-instance snapshots for one process, for detailed status reporting
    /// (`ListProcesses` detail view, restart-count inspection in tests).
    pub fn process_instances(&self, name: &str) -> Option<Vec<crate::supervisor::InstanceSnapshot>> {
        self.supervisors
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .map(|supervisor| supervisor.instance_snapshots())
    }

    pub fn oneshot_history(&self) -> &Arc<OneshotHistory> {
        &self.oneshot_history
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Blocks until every configured longrun process has exhausted its restart
    /// policy and stopped for good, or `deadline` elapses. A one-shot latch: once
    /// fired it stays fired.
    pub fn wait_for_all_dead(&self, deadline: Duration) -> bool {
        let (lock, cvar) = self.all_dead.get_lock_cvar();
        let guard = lock.lock().unwrap_or_else(|p| p.into_inner());
        if *guard {
            return true;
        }
        let (guard, _timeout) = cvar.wait_timeout(guard, deadline).unwrap_or_else(|p| p.into_inner());
        *guard
    }
}

fn configs_equivalent(a: &ProcessConfig, b: &ProcessConfig) -> bool {
    a.command == b.command
        && a.env == b.env
        && a.scale == b.scale
        && a.restart == b.restart
        && a.enabled == b.enabled
}
