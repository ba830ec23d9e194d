//! Cron-driven scheduler for oneshot processes of type `scheduled`. One ticker
//! thread walks every job's upcoming fire times each second; firing spawns an
//! execution on its own thread, bounded by the job's `max_concurrent` and
//! `timeout_secs`.

pub mod error;

pub use error::SchedulerError;

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use crossbeam::channel::Sender;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{error, warn};

use crate::command::stream::{Event, Metadata};
use crate::command::{CommandExecutor, CommandHandle, EventStreamer, ProcessRunner};
use crate::context::Context;
use crate::oneshot_history::{OneshotExecution, OneshotHistory, TriggerType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Running,
    Paused,
}

#[derive(Clone)]
pub struct CronJob {
    pub process_name: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub cron_expression: String,
    pub timezone: Tz,
    pub timeout: Duration,
    pub max_concurrent: u32,
}

struct JobState {
    job: CronJob,
    schedule: cron::Schedule,
    paused: AtomicBool,
    running: AtomicU32,
    missed_fires: AtomicU64,
    last_checked: Mutex<DateTime<Utc>>,
}

pub struct Scheduler {
    jobs: Mutex<HashMap<String, Arc<JobState>>>,
    history: Arc<OneshotHistory>,
    log_sink: Sender<Event>,
    cancel: Context<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(history: Arc<OneshotHistory>, log_sink: Sender<Event>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            history,
            log_sink,
            cancel: Context::new(),
            ticker: Mutex::new(None),
        }
    }

    pub fn add_job(&self, job: CronJob) -> Result<(), SchedulerError> {
        let schedule = cron::Schedule::from_str(&crate::config::normalize_cron_expression(
            &job.cron_expression,
        ))
        .map_err(|e| SchedulerError::InvalidSchedule(job.process_name.clone(), e.to_string()))?;
        let state = Arc::new(JobState {
            last_checked: Mutex::new(Utc::now()),
            job,
            schedule,
            paused: AtomicBool::new(false),
            running: AtomicU32::new(0),
            missed_fires: AtomicU64::new(0),
        });
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(state.job.process_name.clone(), state);
        Ok(())
    }

    pub fn remove_job(&self, name: &str) -> Result<(), SchedulerError> {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::JobNotFound(name.to_string()))
    }

    pub fn pause_job(&self, name: &str) -> Result<(), SchedulerError> {
        let state = self.job_state(name)?;
        state.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn resume_job(&self, name: &str) -> Result<(), SchedulerError> {
        let state = self.job_state(name)?;
        state.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn job_status(&self, name: &str) -> Result<JobStatus, SchedulerError> {
        let state = self.job_state(name)?;
        if state.paused.load(Ordering::SeqCst) {
            return Ok(JobStatus::Paused);
        }
        if state.running.load(Ordering::SeqCst) > 0 {
            return Ok(JobStatus::Running);
        }
        Ok(JobStatus::Idle)
    }

    pub fn job_history(&self, name: &str) -> Vec<OneshotExecution> {
        self.history.for_process(name)
    }

    /// Triggers a manual, fire-and-forget execution. Rejects paused jobs per the
    /// decision that a manual trigger must not bypass an operator-requested pause,
    /// and rejects (counting a missed fire) when the job is already running at its
    /// `max_concurrent` limit.
    pub fn trigger_async(&self, name: &str) -> Result<(), SchedulerError> {
        let state = self.job_state(name)?;
        if state.paused.load(Ordering::SeqCst) {
            return Err(SchedulerError::JobPaused(name.to_string()));
        }
        if state.running.load(Ordering::SeqCst) >= state.job.max_concurrent.max(1) {
            state.missed_fires.fetch_add(1, Ordering::SeqCst);
            return Err(SchedulerError::MaxConcurrentReached(
                name.to_string(),
                state.job.max_concurrent,
            ));
        }
        self.spawn_execution(state, TriggerType::Manual);
        Ok(())
    }

    /// Triggers a manual execution and blocks until it completes, returning the
    /// recorded execution. Subject to the same paused and `max_concurrent` checks
    /// as `trigger_async`.
    pub fn trigger_sync(&self, name: &str) -> Result<OneshotExecution, SchedulerError> {
        let state = self.job_state(name)?;
        if state.paused.load(Ordering::SeqCst) {
            return Err(SchedulerError::JobPaused(name.to_string()));
        }
        if state.running.load(Ordering::SeqCst) >= state.job.max_concurrent.max(1) {
            return Err(SchedulerError::MaxConcurrentReached(
                name.to_string(),
                state.job.max_concurrent,
            ));
        }
        let id = execute_job(&state, &self.history, self.log_sink.clone(), TriggerType::Manual);
        Ok(self
            .history
            .for_process(name)
            .into_iter()
            .find(|e| e.id == id)
            .expect("execution was just recorded"))
    }

    fn job_state(&self, name: &str) -> Result<Arc<JobState>, SchedulerError> {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound(name.to_string()))
    }

    fn spawn_execution(&self, state: Arc<JobState>, trigger: TriggerType) {
        let history = self.history.clone();
        let log_sink = self.log_sink.clone();
        thread::spawn(move || {
            execute_job(&state, &history, log_sink, trigger);
        });
    }

    /// Starts the ticker thread: every second, walks each non-paused job's
    /// schedule for fire times since it was last checked and spawns an execution
    /// for each, counting a missed fire when `max_concurrent` is already reached.
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        let handle = thread::spawn(move || loop {
            if wait_cancellable(&scheduler.cancel, Duration::from_secs(1)) {
                return;
            }
            scheduler.tick();
        });
        *self.ticker.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    pub fn stop(&self) {
        let _ = self.cancel.cancel_all(true);
        if let Some(handle) = self.ticker.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = handle.join();
        }
    }

    fn tick(self: &Arc<Self>) {
        let states: Vec<Arc<JobState>> =
            self.jobs.lock().unwrap_or_else(|p| p.into_inner()).values().cloned().collect();

        for state in states {
            if state.paused.load(Ordering::SeqCst) {
                continue;
            }
            let now = Utc::now().with_timezone(&state.job.timezone);
            let mut last_checked = state.last_checked.lock().unwrap_or_else(|p| p.into_inner());
            let due: Vec<_> = state
                .schedule
                .after(&last_checked.with_timezone(&state.job.timezone))
                .take_while(|fire_time| *fire_time <= now)
                .collect();
            *last_checked = now.with_timezone(&Utc);
            drop(last_checked);

            for _ in due {
                if state.running.load(Ordering::SeqCst) >= state.job.max_concurrent.max(1) {
                    state.missed_fires.fetch_add(1, Ordering::SeqCst);
                    warn!(job = %state.job.process_name, "missed scheduled fire: max_concurrent reached");
                    continue;
                }
                self.spawn_execution(state.clone(), TriggerType::Scheduled);
            }
        }
    }
}

fn execute_job(
    state: &JobState,
    history: &OneshotHistory,
    log_sink: Sender<Event>,
    trigger: TriggerType,
) -> u64 {
    state.running.fetch_add(1, Ordering::SeqCst);
    let job = &state.job;
    let instance_id = format!("{}-scheduled", job.process_name);
    let started_at = std::time::SystemTime::now();

    let result = (|| -> Result<(std::process::ExitStatus, u32), String> {
        let runner = ProcessRunner::new(&job.command[0], &job.command[1..])
            .with_env(&job.env)
            .with_working_dir(job.working_dir.as_ref())
            .with_metadata(Metadata::new(job.process_name.clone(), instance_id.clone()));

        let started = runner.start().map_err(|e| e.to_string())?;
        let streaming = started.stream(log_sink).map_err(|e| e.to_string())?;
        let pid = streaming.get_pid();

        let exited = Context::<bool>::new();
        let killer_exited = exited.clone();
        let timeout = job.timeout;
        let killer = thread::spawn(move || {
            if !wait_cancellable(&killer_exited, timeout) {
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        });

        let status = streaming.wait().map_err(|e| e.to_string());
        let _ = exited.cancel_all(true);
        let _ = killer.join();

        status.map(|s| (s, pid))
    })();

    state.running.fetch_sub(1, Ordering::SeqCst);
    let finished_at = std::time::SystemTime::now();
    let duration = finished_at.duration_since(started_at).unwrap_or_default();

    let (exit_code, success, error_text) = match result {
        Ok((status, _pid)) => (status.code(), status.success(), None),
        Err(err) => {
            error!(job = %job.process_name, error = %err, "scheduled execution failed");
            (None, false, Some(err))
        }
    };

    history.record(OneshotExecution {
        id: 0,
        process_name: job.process_name.clone(),
        instance_id,
        started_at,
        finished_at,
        exit_code,
        success,
        error_text,
        duration,
        trigger_type: trigger,
    })
}

fn wait_cancellable(ctx: &Context<bool>, duration: Duration) -> bool {
    let (lock, cvar) = ctx.get_lock_cvar();
    let guard = lock.lock().unwrap_or_else(|p| p.into_inner());
    if *guard {
        return true;
    }
    let (guard, _timeout) = cvar.wait_timeout(guard, duration).unwrap_or_else(|p| p.into_inner());
    *guard
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, cron_expr: &str) -> CronJob {
        CronJob {
            process_name: name.to_string(),
            command: vec!["true".to_string()],
            env: HashMap::new(),
            working_dir: None,
            cron_expression: cron_expr.to_string(),
            timezone: chrono_tz::UTC,
            timeout: Duration::from_secs(5),
            max_concurrent: 1,
        }
    }

    #[test]
    fn add_job_accepts_standard_five_field_expression() {
        let scheduler = Scheduler::new(
            Arc::new(OneshotHistory::new(10, Duration::from_secs(3600))),
            crossbeam::channel::unbounded().0,
        );
        assert!(scheduler.add_job(job("nightly", "*/1 * * * *")).is_ok());
    }

    #[test]
    fn add_job_rejects_invalid_cron_expression() {
        let scheduler = Scheduler::new(
            Arc::new(OneshotHistory::new(10, Duration::from_secs(3600))),
            crossbeam::channel::unbounded().0,
        );
        assert!(matches!(
            scheduler.add_job(job("bad", "not a cron expression")),
            Err(SchedulerError::InvalidSchedule(_, _))
        ));
    }

    #[test]
    fn pause_then_trigger_sync_is_rejected() {
        let scheduler = Scheduler::new(
            Arc::new(OneshotHistory::new(10, Duration::from_secs(3600))),
            crossbeam::channel::unbounded().0,
        );
        scheduler.add_job(job("nightly", "0 0 3 * * * *")).unwrap();
        scheduler.pause_job("nightly").unwrap();
        assert!(matches!(
            scheduler.trigger_sync("nightly"),
            Err(SchedulerError::JobPaused(_))
        ));
    }

    #[test]
    fn trigger_sync_runs_and_records_history() {
        let history = Arc::new(OneshotHistory::new(10, Duration::from_secs(3600)));
        let scheduler = Scheduler::new(history.clone(), crossbeam::channel::unbounded().0);
        scheduler.add_job(job("job", "0 0 3 * * * *")).unwrap();

        let execution = scheduler.trigger_sync("job").unwrap();
        assert!(execution.success);
        assert_eq!(history.for_process("job").len(), 1);
    }

    #[test]
    fn trigger_async_rejects_when_max_concurrent_already_running() {
        let scheduler = Scheduler::new(
            Arc::new(OneshotHistory::new(10, Duration::from_secs(3600))),
            crossbeam::channel::unbounded().0,
        );
        let mut cron_job = job("nightly", "0 0 3 * * * *");
        cron_job.command = vec!["sleep".to_string(), "5".to_string()];
        cron_job.max_concurrent = 1;
        scheduler.add_job(cron_job).unwrap();

        scheduler.trigger_async("nightly").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while scheduler.job_status("nightly").unwrap() != JobStatus::Running
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(matches!(
            scheduler.trigger_async("nightly"),
            Err(SchedulerError::MaxConcurrentReached(_, 1))
        ));
    }

    #[test]
    fn unknown_job_operations_return_not_found() {
        let scheduler = Scheduler::new(
            Arc::new(OneshotHistory::new(10, Duration::from_secs(3600))),
            crossbeam::channel::unbounded().0,
        );
        assert!(matches!(
            scheduler.pause_job("ghost"),
            Err(SchedulerError::JobNotFound(_))
        ));
    }
}
