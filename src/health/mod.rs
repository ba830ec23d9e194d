pub mod checker;
pub mod monitor;

pub use checker::{
    checker_for, ExecHealthChecker, HealthCheckError, HealthChecker, HttpClient,
    HttpHealthChecker, NoopHealthChecker, ReqwestHttpClient, TcpHealthChecker,
};
pub use monitor::{drives_liveness, drives_readiness, spawn_health_monitor, HealthStatus};
