use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("job `{0}` not found")]
    JobNotFound(String),

    #[error("job `{0}` is paused and cannot be triggered")]
    JobPaused(String),

    #[error("job `{0}` is already running at its max_concurrent limit ({1})")]
    MaxConcurrentReached(String, u32),

    #[error("job `{0}` schedule is invalid: {1}")]
    InvalidSchedule(String, String),
}
