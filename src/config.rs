//! Typed configuration surface handed to the engine by an external config provider.
//!
//! This module does not parse any file format. It defines the shapes an external
//! parser (YAML/TOML/JSON, anything `serde` can drive) produces, plus the
//! validation that must run once, at construction, so the runtime paths never
//! have to second-guess a malformed process definition.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("process `{0}`: command must not be empty")]
    EmptyCommand(String),

    #[error("process `{0}`: scale must be >= 1 when enabled, got {1}")]
    InvalidScale(String, u32),

    #[error("process `{0}`: max_scale {1} is lower than scale {2}")]
    MaxScaleBelowScale(String, u32, u32),

    #[error("process `{0}`: unknown shutdown signal `{1}`")]
    UnknownSignal(String, String),

    #[error("process `{0}`: depends_on references unknown process `{1}`")]
    UnknownDependency(String, String),

    #[error("process `{0}`: scheduled processes require a schedule expression")]
    MissingSchedule(String),

    #[error("process `{0}`: schedule_timeout must be greater than zero")]
    InvalidScheduleTimeout(String),

    #[error("process `{0}`: {1}")]
    InvalidCron(String, String),
}

/// Top-level immutable snapshot an external config provider hands to the Manager.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub processes: HashMap<String, ProcessConfig>,
}

impl Config {
    /// Validates every process definition and the cross-process dependency references.
    /// Must be called once before the `Config` is handed to a Manager.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for process in self.processes.values() {
            process.validate()?;
            for dep in &process.depends_on {
                if !self.processes.contains_key(dep) {
                    return Err(ConfigError::UnknownDependency(
                        process.name.clone(),
                        dep.clone(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub shutdown_timeout: u64,
    pub log_level: String,
    pub max_restart_attempts: u32,
    pub restart_backoff: u64,
    pub dependency_timeout: u64,
    pub process_stop_timeout: u64,
    pub max_process_scale: u32,
    pub resource_metrics_enabled: bool,
    pub resource_metrics_interval: u64,
    pub resource_metrics_max_samples: usize,
    pub oneshot_history_max_entries: usize,
    pub oneshot_history_max_age_secs: u64,
    pub schedule_history_size: usize,
    pub readiness: ReadinessConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: 60,
            log_level: "info".to_string(),
            max_restart_attempts: 0,
            restart_backoff: 1,
            dependency_timeout: 300,
            process_stop_timeout: 30,
            max_process_scale: 0,
            resource_metrics_enabled: false,
            resource_metrics_interval: 5,
            resource_metrics_max_samples: 60,
            oneshot_history_max_entries: 5_000,
            oneshot_history_max_age_secs: 24 * 3600,
            schedule_history_size: 200,
            readiness: ReadinessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub enabled: bool,
    pub path: Option<String>,
    pub mode: ReadinessMode,
    pub processes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMode {
    #[default]
    AllRunning,
    AllHealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialState {
    #[default]
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    #[default]
    Longrun,
    Oneshot,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    Never,
    #[default]
    OnFailure,
    Always,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessConfig {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub initial_state: InitialState,
    #[serde(default)]
    pub process_type: ProcessType,
    #[serde(default = "default_scale")]
    pub scale: u32,
    #[serde(default)]
    pub max_scale: u32,
    #[serde(default)]
    pub scale_locked: bool,
    #[serde(default)]
    pub port_base: u16,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub restart: RestartMode,
    #[serde(default)]
    pub restart_max_attempts: u32,
    #[serde(default)]
    pub restart_initial_backoff_secs: u64,
    #[serde(default)]
    pub restart_max_backoff_secs: u64,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    pub health_check: Option<HealthCheckConfig>,
    pub schedule: Option<ScheduleConfig>,
    #[serde(default)]
    pub max_memory_mb: u64,
}

fn default_true() -> bool {
    true
}

fn default_scale() -> u32 {
    1
}

impl ProcessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(ConfigError::EmptyCommand(self.name.clone()));
        }
        if self.enabled && self.process_type == ProcessType::Longrun && self.scale == 0 {
            return Err(ConfigError::InvalidScale(self.name.clone(), self.scale));
        }
        if self.max_scale != 0 && self.max_scale < self.scale {
            return Err(ConfigError::MaxScaleBelowScale(
                self.name.clone(),
                self.max_scale,
                self.scale,
            ));
        }
        self.shutdown.validate(&self.name)?;
        if self.process_type == ProcessType::Scheduled {
            let schedule = self
                .schedule
                .as_ref()
                .ok_or_else(|| ConfigError::MissingSchedule(self.name.clone()))?;
            schedule.validate(&self.name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub signal: String,
    pub grace_timeout_secs: u64,
    pub pre_stop_hook: Option<String>,
    pub post_stop_hook: Option<String>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            signal: "SIGTERM".to_string(),
            grace_timeout_secs: 30,
            pre_stop_hook: None,
            post_stop_hook: None,
        }
    }
}

impl ShutdownConfig {
    pub fn validate(&self, process_name: &str) -> Result<(), ConfigError> {
        signal_from_name(&self.signal)
            .map(|_| ())
            .ok_or_else(|| ConfigError::UnknownSignal(process_name.to_string(), self.signal.clone()))
    }

    pub fn grace_timeout(&self) -> Duration {
        Duration::from_secs(self.grace_timeout_secs)
    }
}

/// Maps a configured signal name to the OS signal, rejected at validation time rather
/// than at stop time per the design notes.
pub fn signal_from_name(name: &str) -> Option<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal;
    match name.to_ascii_uppercase().as_str() {
        "SIGTERM" | "TERM" => Some(Signal::SIGTERM),
        "SIGINT" | "INT" => Some(Signal::SIGINT),
        "SIGHUP" | "HUP" => Some(Signal::SIGHUP),
        "SIGQUIT" | "QUIT" => Some(Signal::SIGQUIT),
        "SIGUSR1" | "USR1" => Some(Signal::SIGUSR1),
        "SIGUSR2" | "USR2" => Some(Signal::SIGUSR2),
        "SIGKILL" | "KILL" => Some(Signal::SIGKILL),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckMode {
    Liveness,
    Readiness,
    Both,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheckKind {
    Tcp { address: String },
    Http { url: String, expected_status: u16 },
    Exec { command: Vec<String> },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    pub kind: HealthCheckKind,
    #[serde(default)]
    pub mode: HealthCheckModeOrDefault,
    #[serde(default)]
    pub initial_delay_secs: u64,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_threshold")]
    pub success_threshold: u32,
}

fn default_period_secs() -> u64 {
    10
}
fn default_timeout_secs() -> u64 {
    5
}
fn default_threshold() -> u32 {
    3
}

/// Thin newtype so `mode` can default to `Both` without requiring callers to spell it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct HealthCheckModeOrDefault(pub HealthCheckMode);

impl Default for HealthCheckModeOrDefault {
    fn default() -> Self {
        Self(HealthCheckMode::Both)
    }
}

impl HealthCheckConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
    pub fn mode(&self) -> HealthCheckMode {
        self.mode.0
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_schedule_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_schedule_timeout() -> u64 {
    60
}
fn default_max_concurrent() -> u32 {
    1
}

impl ScheduleConfig {
    pub fn validate(&self, process_name: &str) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidScheduleTimeout(process_name.to_string()));
        }
        normalize_cron_expression(&self.cron_expression)
            .parse::<cron::Schedule>()
            .map_err(|e| ConfigError::InvalidCron(process_name.to_string(), e.to_string()))?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// The `cron` crate parses the 6-7 field (seconds-first) format; the standard
/// 5-field expression this engine's spec is written against has no seconds
/// column. Prepend a `0` seconds field when exactly 5 fields are given so
/// ordinary 5-field expressions (`*/1 * * * *`) parse as "at second 0".
/// 6- and 7-field expressions are passed through unchanged.
pub fn normalize_cron_expression(expr: &str) -> String {
    let field_count = expr.split_whitespace().count();
    if field_count == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn base_process(name: &str) -> ProcessConfig {
        ProcessConfig {
            name: name.to_string(),
            command: vec!["sleep".to_string(), "60".to_string()],
            env: HashMap::new(),
            working_dir: None,
            enabled: true,
            initial_state: InitialState::Running,
            process_type: ProcessType::Longrun,
            scale: 1,
            max_scale: 0,
            scale_locked: false,
            port_base: 0,
            depends_on: vec![],
            restart: RestartMode::OnFailure,
            restart_max_attempts: 0,
            restart_initial_backoff_secs: 1,
            restart_max_backoff_secs: 300,
            shutdown: ShutdownConfig::default(),
            health_check: None,
            schedule: None,
            max_memory_mb: 0,
        }
    }

    #[test]
    fn rejects_empty_command() {
        let mut p = base_process("worker");
        p.command = vec![];
        assert_eq!(p.validate(), Err(ConfigError::EmptyCommand("worker".into())));
    }

    #[test]
    fn rejects_unknown_signal() {
        let mut p = base_process("worker");
        p.shutdown.signal = "SIGBOGUS".to_string();
        assert!(matches!(p.validate(), Err(ConfigError::UnknownSignal(_, _))));
    }

    #[test]
    fn rejects_max_scale_below_scale() {
        let mut p = base_process("worker");
        p.scale = 4;
        p.max_scale = 2;
        assert!(matches!(
            p.validate(),
            Err(ConfigError::MaxScaleBelowScale(_, 2, 4))
        ));
    }

    #[test]
    fn scheduled_requires_schedule() {
        let mut p = base_process("nightly");
        p.process_type = ProcessType::Scheduled;
        assert!(matches!(p.validate(), Err(ConfigError::MissingSchedule(_))));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let mut cfg = Config::default();
        let mut app = base_process("app");
        app.depends_on = vec!["db".to_string()];
        cfg.processes.insert("app".to_string(), app);
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownDependency(_, _))));
    }

    #[test]
    fn signal_lookup_accepts_common_aliases() {
        assert!(signal_from_name("SIGTERM").is_some());
        assert!(signal_from_name("term").is_some());
        assert!(signal_from_name("SIGBOGUS").is_none());
    }
}
