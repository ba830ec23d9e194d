use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("process already started")]
    ProcessAlreadyStarted,

    #[error("process not started")]
    ProcessNotStarted,

    #[error("command spawn failed: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("io error")]
    Io(#[source] std::io::Error),

    #[cfg(target_family = "unix")]
    #[error("signal delivery failed")]
    Signal(#[source] nix::Error),

    #[error("process did not exit before the grace timeout")]
    Timeout,
}

impl From<std::io::Error> for CommandError {
    fn from(value: std::io::Error) -> CommandError {
        CommandError::Io(value)
    }
}

#[cfg(target_family = "unix")]
impl From<nix::Error> for CommandError {
    fn from(value: nix::Error) -> CommandError {
        CommandError::Signal(value)
    }
}
