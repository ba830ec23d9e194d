//! Instance: one running child process occupying a stable slot within a
//! Supervisor, plus its monitor task (§4.5).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use nix::sys::signal::Signal;
use tracing::{error, info, info_span, warn};

use crate::command::stream::{Event, Metadata};
use crate::command::{
    CommandError, CommandExecutor, CommandHandle, EventStreamer, ProcessRunner, ProcessTerminator,
};
use crate::config::HealthCheckConfig;
use crate::context::Context;
use crate::health::{drives_liveness, spawn_health_monitor, HealthChecker};
use crate::hooks::{HookExecutor, HookType};
use crate::resources::ResourceCollector;

use super::restart::RestartPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub id: String,
    pub index: u32,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub restart_count: u32,
    pub state: InstanceState,
    pub last_exit_code: Option<i32>,
}

struct Inner {
    pid: Option<u32>,
    started_at: Option<Instant>,
    restart_count: u32,
    state: InstanceState,
    last_exit_code: Option<i32>,
}

/// What to launch for one slot. Shared immutably across respawns of that slot; only
/// `restart_count` and the runtime `Inner` fields change between spawns.
pub struct SpawnConfig {
    pub process_name: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub port_base: u16,
    pub shutdown_signal: Signal,
    pub grace_timeout: Duration,
    pub pre_stop_hook: Option<String>,
    pub restart_policy: RestartPolicy,
    pub log_sink: Sender<Event>,
    pub scheduled: bool,
    pub schedule_expression: Option<String>,
    pub health_checker: Option<Arc<dyn HealthChecker>>,
    pub health_check_config: Option<HealthCheckConfig>,
    pub resource_collector: Arc<dyn ResourceCollector>,
    pub max_memory_mb: u64,
}

/// Callback fired once the instance's monitor loop has ended (either the restart
/// policy declined to respawn, or the slot was torn down by scale-down/shutdown).
pub type DeathNotifier = Arc<dyn Fn() + Send + Sync>;

pub struct Instance {
    pub index: u32,
    pub id: String,
    inner: Arc<Mutex<Inner>>,
    /// Fires when the slot is being torn down (scale-down or supervisor stop): the
    /// monitor must not restart after observing this.
    stop_ctx: Context<bool>,
    /// Fires to force an immediate kill of the running child while leaving the
    /// restart path intact (health-driven restart, memory ceiling).
    kill_ctx: Context<bool>,
    /// Last observed `last_check_succeeded` from the liveness probe, distinct from
    /// the hysteresis-smoothed `healthy` value (§4.3): readiness cares about this.
    /// Optimistically `true` for processes with no configured health check.
    last_check_succeeded: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl Instance {
    /// Spawns the instance's monitor thread, which itself spawns the first child
    /// process before returning control here — construction does not block on the
    /// spawn succeeding; spawn failures surface through `death_notifier` plus the
    /// instance transitioning to `Failed` on the very first attempt, which the
    /// caller can observe via `snapshot()` shortly after.
    pub fn spawn(
        index: u32,
        config: Arc<SpawnConfig>,
        hooks: Arc<dyn HookExecutor>,
        death_notifier: DeathNotifier,
    ) -> Self {
        let id = format!("{}-{}", config.process_name, index);
        let inner = Arc::new(Mutex::new(Inner {
            pid: None,
            started_at: None,
            restart_count: 0,
            state: InstanceState::Starting,
            last_exit_code: None,
        }));

        let stop_ctx = Context::<bool>::new();
        let kill_ctx = Context::<bool>::new();
        let last_check_succeeded = Arc::new(AtomicBool::new(true));

        let monitor = spawn_monitor_thread(
            id.clone(),
            index,
            config,
            inner.clone(),
            stop_ctx.clone(),
            kill_ctx.clone(),
            last_check_succeeded.clone(),
            hooks,
            death_notifier,
        );

        Self {
            index,
            id,
            inner,
            stop_ctx,
            kill_ctx,
            last_check_succeeded,
            monitor: Some(monitor),
        }
    }

    /// Last observed liveness/readiness probe outcome; `true` when no health check
    /// is configured for this process.
    pub fn last_check_succeeded(&self) -> bool {
        self.last_check_succeeded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        InstanceSnapshot {
            id: self.id.clone(),
            index: self.index,
            pid: inner.pid,
            started_at: inner.started_at,
            restart_count: inner.restart_count,
            state: inner.state,
            last_exit_code: inner.last_exit_code,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).state == InstanceState::Running
    }

    /// Requests an immediate kill while leaving the restart path intact. Used for
    /// health-driven restarts and the memory-ceiling kill policy.
    pub fn kill_now(&self) {
        let _ = self.kill_ctx.cancel_all(true);
    }

    /// Tears the slot down: signals the monitor to stop and not to restart, then
    /// blocks until it has exited. Returns once the monitor thread has joined.
    pub fn stop(mut self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if inner.state != InstanceState::Stopped {
                inner.state = InstanceState::Stopping;
            }
        }
        let _ = self.stop_ctx.cancel_all(true);
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.monitor.is_some() {
            let _ = self.stop_ctx.cancel_all(true);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_monitor_thread(
    id: String,
    index: u32,
    config: Arc<SpawnConfig>,
    inner: Arc<Mutex<Inner>>,
    stop_ctx: Context<bool>,
    kill_ctx: Context<bool>,
    last_check_succeeded: Arc<AtomicBool>,
    hooks: Arc<dyn HookExecutor>,
    death_notifier: DeathNotifier,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let span = info_span!("instance_monitor", instance = %id);
        let _enter = span.enter();

        loop {
            if is_signaled(&stop_ctx) {
                break;
            }

            let restart_count = inner.lock().unwrap_or_else(|p| p.into_inner()).restart_count;
            let env = build_env(&config, &id, index, restart_count);

            info!(restart_count, "starting instance");
            let runner = ProcessRunner::new(&config.command[0], &config.command[1..])
                .with_env(&env)
                .with_working_dir(config.working_dir.as_ref())
                .with_metadata(Metadata::new(config.process_name.clone(), id.clone()));

            let started = match runner.start() {
                Ok(started) => started,
                Err(err) => {
                    error!(error = %err, "failed to spawn instance");
                    let mut guard = inner.lock().unwrap_or_else(|p| p.into_inner());
                    guard.state = InstanceState::Failed;
                    drop(guard);
                    death_notifier();
                    return;
                }
            };

            let streaming = match started.stream(config.log_sink.clone()) {
                Ok(streaming) => streaming,
                Err(err) => {
                    error!(error = %err, "failed to attach output stream");
                    let mut guard = inner.lock().unwrap_or_else(|p| p.into_inner());
                    guard.state = InstanceState::Failed;
                    drop(guard);
                    death_notifier();
                    return;
                }
            };

            let pid = streaming.get_pid();
            {
                let mut guard = inner.lock().unwrap_or_else(|p| p.into_inner());
                guard.pid = Some(pid);
                guard.started_at = Some(Instant::now());
                guard.state = InstanceState::Running;
            }

            let child_exited = Context::<bool>::new();
            let watcher = spawn_termination_watcher(
                pid,
                config.clone(),
                stop_ctx.clone(),
                kill_ctx.clone(),
                child_exited.clone(),
                hooks.clone(),
                id.clone(),
            );
            let health_watcher = spawn_health_watcher(
                pid,
                config.clone(),
                kill_ctx.clone(),
                child_exited.clone(),
                last_check_succeeded.clone(),
                id.clone(),
            );
            let memory_watcher = spawn_memory_watcher(
                pid,
                config.clone(),
                kill_ctx.clone(),
                child_exited.clone(),
                id.clone(),
            );

            let exit_status = match streaming.wait() {
                Ok(status) => status,
                Err(err) => {
                    error!(error = %err, "error waiting for instance to exit");
                    let _ = child_exited.cancel_all(true);
                    let _ = watcher.join();
                    let mut guard = inner.lock().unwrap_or_else(|p| p.into_inner());
                    guard.state = InstanceState::Failed;
                    drop(guard);
                    death_notifier();
                    return;
                }
            };

            let _ = child_exited.cancel_all(true);
            let _ = watcher.join();
            if let Some(handle) = health_watcher {
                let _ = handle.join();
            }
            if let Some(handle) = memory_watcher {
                let _ = handle.join();
            }

            #[cfg(target_family = "unix")]
            let exit_code = std::os::unix::process::ExitStatusExt::signal(&exit_status)
                .map(|_| -1)
                .unwrap_or_else(|| exit_status.code().unwrap_or(-1));
            #[cfg(not(target_family = "unix"))]
            let exit_code = exit_status.code().unwrap_or(-1);

            let was_stopping;
            let current_restart_count;
            {
                let mut guard = inner.lock().unwrap_or_else(|p| p.into_inner());
                guard.state = InstanceState::Stopped;
                guard.pid = None;
                guard.last_exit_code = Some(exit_code);
                was_stopping = is_signaled(&stop_ctx);
                current_restart_count = guard.restart_count;
            }

            if was_stopping {
                info!("instance stopped, slot is being torn down");
                break;
            }

            if !config.restart_policy.should_restart(exit_code, current_restart_count) {
                info!(exit_code, "restart policy declined to restart instance");
                death_notifier();
                break;
            }

            let backoff = config.restart_policy.backoff(current_restart_count);
            info!(?backoff, "sleeping before respawn");
            if wait_cancellable(&stop_ctx, backoff) {
                info!("restart backoff interrupted by shutdown");
                break;
            }

            let mut guard = inner.lock().unwrap_or_else(|p| p.into_inner());
            guard.restart_count = current_restart_count + 1;
            guard.state = InstanceState::Starting;
        }
    })
}

/// Watches for either the slot-level stop signal or an immediate-kill request and
/// terminates the running child accordingly. Exits as soon as the child itself
/// exits (`child_exited` fires) so it never outlives the instance it is watching.
#[allow(clippy::too_many_arguments)]
fn spawn_termination_watcher(
    pid: u32,
    config: Arc<SpawnConfig>,
    stop_ctx: Context<bool>,
    kill_ctx: Context<bool>,
    child_exited: Context<bool>,
    hooks: Arc<dyn HookExecutor>,
    id: String,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let stop_signaled = wait_any(&[&stop_ctx, &kill_ctx, &child_exited]);
        if child_exited.is_signaled() {
            return;
        }

        if stop_signaled == TriggerSource::Stop {
            if let Some(hook) = &config.pre_stop_hook {
                if let Err(err) =
                    hooks.run_hook(HookType::PreStop, hook, Duration::from_secs(30))
                {
                    warn!(instance = %id, error = %err, "pre-stop hook failed");
                }
            }
            let terminator = ProcessTerminator::new(pid)
                .with_signal(config.shutdown_signal)
                .with_grace_timeout(config.grace_timeout);
            if let Err(err) = terminator.shutdown(child_exited.clone()) {
                error!(instance = %id, error = %err, "graceful shutdown failed");
            }
        } else {
            // Health-driven or memory-ceiling kill: immediate SIGKILL equivalent,
            // no grace period.
            let terminator = ProcessTerminator::new(pid)
                .with_signal(nix::sys::signal::Signal::SIGKILL)
                .with_grace_timeout(Duration::from_secs(5));
            if let Err(err) = terminator.shutdown(child_exited.clone()) {
                error!(instance = %id, error = %err, "forced kill failed");
            }
        }
    })
}

/// If the process declares a liveness-driving health check, probes it on its own
/// schedule and requests an immediate kill (leaving the restart path intact) the
/// first time the hysteresis-smoothed status goes unhealthy. Returns `None` when
/// no liveness check is configured, so callers can skip joining it.
fn spawn_health_watcher(
    _pid: u32,
    config: Arc<SpawnConfig>,
    kill_ctx: Context<bool>,
    child_exited: Context<bool>,
    last_check_succeeded: Arc<AtomicBool>,
    id: String,
) -> Option<JoinHandle<()>> {
    let checker = config.health_checker.clone()?;
    let health_config = config.health_check_config.clone()?;
    let drives_restart = drives_liveness(health_config.mode());

    Some(thread::spawn(move || {
        let (rx, monitor_handle) = spawn_health_monitor(checker, health_config, child_exited.clone());
        loop {
            match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(status) => {
                    last_check_succeeded.store(status.last_check_succeeded, Ordering::Relaxed);
                    if drives_restart && !status.healthy {
                        warn!(instance = %id, error = ?status.error, "liveness check failed, killing instance");
                        let _ = kill_ctx.cancel_all(true);
                        break;
                    }
                }
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                    if child_exited.is_signaled() {
                        break;
                    }
                }
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        let _ = monitor_handle.join();
    }))
}

/// If a memory ceiling is configured, samples RSS at a fixed interval and requests
/// an immediate kill the first time it is exceeded.
fn spawn_memory_watcher(
    pid: u32,
    config: Arc<SpawnConfig>,
    kill_ctx: Context<bool>,
    child_exited: Context<bool>,
    id: String,
) -> Option<JoinHandle<()>> {
    if config.max_memory_mb == 0 {
        return None;
    }
    let collector = config.resource_collector.clone();
    let ceiling_bytes = config.max_memory_mb * 1_000_000;

    Some(thread::spawn(move || loop {
        if wait_cancellable(&child_exited, Duration::from_secs(5)) {
            break;
        }
        if let Some(sample) = collector.sample(pid) {
            if sample.memory_rss_bytes > ceiling_bytes {
                warn!(instance = %id, rss = sample.memory_rss_bytes, ceiling = ceiling_bytes, "memory ceiling exceeded, killing instance");
                let _ = kill_ctx.cancel_all(true);
                break;
            }
        }
    }))
}

#[derive(PartialEq, Eq)]
enum TriggerSource {
    Stop,
    Kill,
    ChildExited,
}

fn wait_any(contexts: &[&Context<bool>]) -> TriggerSource {
    loop {
        if contexts[0].is_signaled() {
            return TriggerSource::Stop;
        }
        if contexts[1].is_signaled() {
            return TriggerSource::Kill;
        }
        if contexts[2].is_signaled() {
            return TriggerSource::ChildExited;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

impl Context<bool> {
    fn is_signaled(&self) -> bool {
        let (lock, _cvar) = self.get_lock_cvar();
        *lock.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn is_signaled(ctx: &Context<bool>) -> bool {
    ctx.is_signaled()
}

fn wait_cancellable(ctx: &Context<bool>, duration: Duration) -> bool {
    let (lock, cvar) = ctx.get_lock_cvar();
    let guard = lock.lock().unwrap_or_else(|p| p.into_inner());
    if *guard {
        return true;
    }
    let (guard, _timeout) = cvar
        .wait_timeout(guard, duration)
        .unwrap_or_else(|p| p.into_inner());
    *guard
}

/// Merges the process's declared env with the inherited environment and the
/// synthetic variables from §4.6.
fn build_env(
    config: &SpawnConfig,
    instance_id: &str,
    index: u32,
    _restart_count: u32,
) -> HashMap<String, String> {
    let mut env = config.env.clone();
    env.insert("PHPEEK_PM_PROCESS_NAME".to_string(), config.process_name.clone());
    env.insert("PHPEEK_PM_INSTANCE_ID".to_string(), instance_id.to_string());
    env.insert("PHPEEK_PM_INSTANCE_INDEX".to_string(), index.to_string());
    if config.port_base > 0 {
        env.insert("PORT".to_string(), (config.port_base + index as u16).to_string());
    }
    if config.scheduled {
        env.insert("PHPEEK_PM_SCHEDULED".to_string(), "true".to_string());
        if let Some(expr) = &config.schedule_expression {
            env.insert("PHPEEK_PM_SCHEDULE".to_string(), expr.clone());
        }
        env.insert(
            "PHPEEK_PM_START_TIME".to_string(),
            chrono::Utc::now().to_rfc3339(),
        );
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::stream::OutputEvent;
    use crate::config::RestartMode;
    use crate::hooks::ShellHookExecutor;
    use crate::resources::NoopResourceCollector;
    use crate::supervisor::restart::RestartPolicy;

    fn config(command: Vec<&str>, restart: RestartPolicy) -> Arc<SpawnConfig> {
        let (tx, _rx) = crossbeam::channel::unbounded::<Event>();
        Arc::new(SpawnConfig {
            process_name: "test".to_string(),
            command: command.into_iter().map(String::from).collect(),
            env: HashMap::new(),
            working_dir: None,
            port_base: 0,
            shutdown_signal: Signal::SIGTERM,
            grace_timeout: Duration::from_millis(500),
            pre_stop_hook: None,
            restart_policy: restart,
            log_sink: tx,
            scheduled: false,
            schedule_expression: None,
            health_checker: None,
            health_check_config: None,
            resource_collector: Arc::new(NoopResourceCollector),
            max_memory_mb: 0,
        })
    }

    #[test]
    fn instance_reaches_running_state_for_long_lived_process() {
        let cfg = config(vec!["sleep", "2"], RestartPolicy::new(RestartMode::Never, 0));
        let notified = Arc::new(Mutex::new(false));
        let notified_writer = notified.clone();
        let instance = Instance::spawn(
            0,
            cfg,
            Arc::new(ShellHookExecutor),
            Arc::new(move || {
                *notified_writer.lock().unwrap() = true;
            }),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while !instance.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(instance.is_running());
        assert!(instance.snapshot().pid.is_some());
        instance.stop();
    }

    #[test]
    fn on_failure_restarts_until_max_attempts() {
        let restart = RestartPolicy::new(RestartMode::OnFailure, 2)
            .with_initial_backoff(Duration::from_millis(10))
            .with_max_backoff(Duration::from_millis(50));
        let cfg = config(vec!["sh", "-c", "exit 1"], restart);

        let death_count = Arc::new(Mutex::new(0));
        let death_writer = death_count.clone();
        let instance = Instance::spawn(
            0,
            cfg,
            Arc::new(ShellHookExecutor),
            Arc::new(move || {
                *death_writer.lock().unwrap() += 1;
            }),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = instance.snapshot();
            if snapshot.state == InstanceState::Stopped && snapshot.restart_count >= 2 {
                break;
            }
            assert!(Instant::now() < deadline, "instance did not converge in time");
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(*death_count.lock().unwrap(), 1);
        instance.stop();
    }

    #[test]
    fn output_is_captured_from_streamed_instance() {
        let cfg = config(vec!["echo", "hi"], RestartPolicy::new(RestartMode::Never, 0));
        let (tx, rx) = crossbeam::channel::unbounded::<Event>();
        let mut cfg = (*cfg).clone_for_test();
        cfg.log_sink = tx;
        let instance = Instance::spawn(0, Arc::new(cfg), Arc::new(ShellHookExecutor), Arc::new(|| {}));

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event.output, OutputEvent::Stdout(ref s) if s == "hi"));
        instance.stop();
    }

    impl SpawnConfig {
        fn clone_for_test(&self) -> SpawnConfig {
            SpawnConfig {
                process_name: self.process_name.clone(),
                command: self.command.clone(),
                env: self.env.clone(),
                working_dir: self.working_dir.clone(),
                port_base: self.port_base,
                shutdown_signal: self.shutdown_signal,
                grace_timeout: self.grace_timeout,
                pre_stop_hook: self.pre_stop_hook.clone(),
                restart_policy: self.restart_policy.clone(),
                log_sink: self.log_sink.clone(),
                scheduled: self.scheduled,
                schedule_expression: self.schedule_expression.clone(),
                health_checker: self.health_checker.clone(),
                health_check_config: self.health_check_config.clone(),
                resource_collector: self.resource_collector.clone(),
                max_memory_mb: self.max_memory_mb,
            }
        }
    }
}
