use std::{
    collections::HashMap,
    ffi::OsStr,
    io::{BufRead, BufReader},
    marker::PhantomData,
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
};

use crossbeam::channel::Sender;

use super::{
    stream::{Event, Metadata, OutputEvent},
    CommandError, CommandExecutor, CommandHandle, CommandRunner, EventStreamer,
};

pub struct Unstarted;
pub struct Started;

/// Typestate wrapper around [`std::process::Command`]. An `Unstarted` runner holds
/// the not-yet-spawned command; `start()` consumes it and returns a `Started` runner
/// wrapping the live [`Child`].
pub struct ProcessRunner<State = Unstarted> {
    cmd: Option<Command>,
    process: Option<Child>,
    metadata: Metadata,
    stream_handle: Option<JoinHandle<()>>,

    state: PhantomData<State>,
}

impl ProcessRunner {
    pub fn new<I, S>(binary_path: S, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(binary_path);
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        Self {
            cmd: Some(command),
            process: None,
            metadata: Metadata::default(),
            stream_handle: None,
            state: PhantomData,
        }
    }

    pub fn with_env(mut self, env: &HashMap<String, String>) -> Self {
        if let Some(cmd) = self.cmd.as_mut() {
            cmd.envs(env);
        }
        self
    }

    pub fn with_working_dir(mut self, dir: Option<&PathBuf>) -> Self {
        if let (Some(cmd), Some(dir)) = (self.cmd.as_mut(), dir) {
            cmd.current_dir(dir);
        }
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

impl CommandExecutor for ProcessRunner {
    type Error = CommandError;
    type Process = ProcessRunner<Started>;

    fn start(self) -> Result<Self::Process, Self::Error> {
        let metadata = self.metadata;
        let process = self
            .cmd
            .ok_or(CommandError::ProcessNotStarted)?
            .spawn()
            .map_err(CommandError::Spawn)?;

        Ok(ProcessRunner {
            cmd: None,
            process: Some(process),
            metadata,
            stream_handle: None,
            state: PhantomData,
        })
    }
}

impl CommandRunner for ProcessRunner {
    type Error = CommandError;

    fn run(self) -> Result<ExitStatus, Self::Error> {
        Ok(self
            .cmd
            .ok_or(CommandError::ProcessNotStarted)?
            .spawn()
            .map_err(CommandError::Spawn)?
            .wait()?)
    }
}

impl CommandHandle for ProcessRunner<Started> {
    type Error = CommandError;

    fn get_pid(&self) -> u32 {
        self.process.as_ref().map(Child::id).unwrap_or_default()
    }

    fn wait(mut self) -> Result<ExitStatus, Self::Error> {
        let status = self
            .process
            .as_mut()
            .ok_or(CommandError::ProcessNotStarted)?
            .wait()?;

        // Join the streaming thread so every captured line has been handed to the
        // log sink before the caller observes the exit status (see instance monitor
        // step 2: flush before any state change).
        if let Some(handle) = self.stream_handle.take() {
            let _ = handle.join();
        }

        Ok(status)
    }
}

impl EventStreamer for ProcessRunner<Started> {
    type Error = CommandError;
    type Handle = ProcessRunner<Started>;

    fn stream(mut self, snd: Sender<Event>) -> Result<Self::Handle, Self::Error> {
        let process = self.process.as_mut().ok_or(CommandError::ProcessNotStarted)?;

        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| CommandError::Io(std::io::Error::other("stdout not piped")))?;
        let stderr = process
            .stderr
            .take()
            .ok_or_else(|| CommandError::Io(std::io::Error::other("stderr not piped")))?;

        let stdout = BufReader::new(stdout);
        let stderr = BufReader::new(stderr);
        let metadata = self.metadata.clone();
        let err_snd = snd.clone();

        let stdout_thread = thread::spawn(move || {
            for line in stdout.lines().map_while(Result::ok) {
                if snd.send(Event::new(metadata.clone(), OutputEvent::Stdout(line))).is_err() {
                    break;
                }
            }
        });

        let metadata = self.metadata.clone();
        let stderr_thread = thread::spawn(move || {
            for line in stderr.lines().map_while(Result::ok) {
                if err_snd
                    .send(Event::new(metadata.clone(), OutputEvent::Stderr(line)))
                    .is_err()
                {
                    break;
                }
            }
        });

        self.stream_handle = Some(thread::spawn(move || {
            let _ = stdout_thread.join();
            let _ = stderr_thread.join();
        }));

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::stream::Metadata;

    #[test]
    fn start_stream_wait_captures_stdout() {
        let runner = ProcessRunner::new("echo", ["hello"])
            .with_metadata(Metadata::new("worker", "worker-0"));

        let (tx, rx) = crossbeam::channel::unbounded();
        let started = runner.start().unwrap().stream(tx).unwrap();
        let pid = started.get_pid();
        assert!(pid > 0);

        let status = started.wait().unwrap();
        assert!(status.success());

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let OutputEvent::Stdout(line) = event.output {
                lines.push(line);
            }
        }
        assert_eq!(lines, vec!["hello".to_string()]);
    }

    #[test]
    fn failing_spawn_surfaces_spawn_error() {
        let runner = ProcessRunner::new("this-binary-does-not-exist-xyz", Vec::<&str>::new());
        assert!(matches!(runner.start(), Err(CommandError::Spawn(_))));
    }

    #[test]
    fn env_and_working_dir_are_applied() {
        let mut env = HashMap::new();
        env.insert("PM_TEST_VAR".to_string(), "present".to_string());

        let runner = ProcessRunner::new("sh", ["-c", "echo $PM_TEST_VAR"]).with_env(&env);
        let (tx, rx) = crossbeam::channel::unbounded();
        let started = runner.start().unwrap().stream(tx).unwrap();
        started.wait().unwrap();

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let OutputEvent::Stdout(line) = event.output {
                lines.push(line);
            }
        }
        assert_eq!(lines, vec!["present".to_string()]);
    }
}
