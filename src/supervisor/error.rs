use thiserror::Error;

use crate::command::CommandError;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("process `{0}`: failed to spawn instance {1}: {2}")]
    Spawn(String, usize, #[source] CommandError),

    #[error("process `{0}`: stop timed out waiting for {1} instance(s)")]
    StopTimeout(String, usize),

    #[error("process `{0}`: readiness wait timed out after {1:?}")]
    ReadinessTimeout(String, std::time::Duration),

    #[error("process `{0}`: target scale {1} exceeds max_scale {2}")]
    ScaleExceedsMax(String, u32, u32),

    #[error("process `{0}` is scale-locked and only supports 0..1 transitions")]
    ScaleLocked(String),

    #[error("process `{0}` is a oneshot process and cannot be scaled")]
    OneshotCannotScale(String),

    #[error("process `{0}`: pre-stop hook failed: {1}")]
    HookFailure(String, String),

    #[error("internal invariant violated in process `{0}`: {1}")]
    Internal(String, String),
}
