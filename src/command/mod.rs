mod error;

pub mod logger;
pub mod processrunner;
pub mod shutdown;
pub mod stream;

pub use crate::command::{
    error::CommandError, logger::EventReceiver, processrunner::ProcessRunner,
    shutdown::ProcessTerminator,
};

use std::process::ExitStatus;

use crossbeam::channel::Sender;

use self::stream::Event;

/// Spawns a child process in the background, handing back a handle to it.
pub trait CommandExecutor {
    type Error: std::error::Error + Send + Sync;
    type Process: CommandHandle;

    fn start(self) -> Result<Self::Process, Self::Error>;
}

/// A handle to an already-spawned child process.
pub trait CommandHandle {
    type Error: std::error::Error + Send + Sync;

    fn get_pid(&self) -> u32;

    /// Blocks until the child exits, returning its exit status.
    fn wait(self) -> Result<ExitStatus, Self::Error>;
}

/// Runs a command to completion, blocking the calling thread. Used for oneshot
/// executions (scheduled jobs, manual triggers) where there is no long-lived
/// instance to track.
pub trait CommandRunner {
    type Error: std::error::Error + Send + Sync;

    fn run(self) -> Result<ExitStatus, Self::Error>;
}

/// Capability of a started command to stream its stdout/stderr to a channel from a
/// background thread, returning a handle once the stream is wired up.
pub trait EventStreamer {
    type Error: std::error::Error + Send + Sync;
    type Handle: CommandHandle;

    fn stream(self, snd: Sender<Event>) -> Result<Self::Handle, Self::Error>;
}

/// Capability of a receiver of streamed output to turn it into log lines. Consumes
/// itself because logging drains the channel on a dedicated thread.
pub trait EventLogger {
    fn log(self);
}
