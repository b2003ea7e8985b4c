use std::{
    io::{BufRead, BufReader},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use anyhow::{self, Context};
use tracing::{debug, warn};

use super::state::SharedState;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a watched process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(ExitStatus),
    /// The worker was stopped and the process killed.
    Cancelled,
}

/// A child process whose stdout is read line by line on a helper thread.
///
/// The process is killed when dropped, so a cancelled batch never leaves it orphaned.
#[derive(Debug)]
pub struct ManagedProcess {
    child: Child,
    lines: Receiver<String>,
    reader: Option<JoinHandle<()>>,
    cleaned_up: bool,
}

fn create_process(command: &str, args: &[String], cwd: &Path, allow_stderr: bool) -> anyhow::Result<Child> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped());
    if !allow_stderr {
        cmd.stderr(Stdio::null());
    }
    cmd.spawn()
        .with_context(|| format!("command '{command}' not found"))
}

impl ManagedProcess {
    pub fn launch(command: &str, args: &[String], cwd: &Path, allow_stderr: bool) -> anyhow::Result<ManagedProcess> {
        let mut child = create_process(command, args, cwd, allow_stderr)?;
        let stdout = child.stdout.take().context("child stdout was not captured")?;
        let (sender, lines) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name("process-stdout".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if sender.send(line).is_err() {
                        break;
                    }
                }
            });
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e).context("could not spawn stdout reader");
            }
        };
        debug!(pid = child.id(), command, "Process launched");
        Ok(ManagedProcess {
            child,
            lines,
            reader: Some(reader),
            cleaned_up: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Feeds every stdout line to `on_line` until the process exits or the worker stops.
    pub fn watch(&mut self, state: &SharedState, mut on_line: impl FnMut(&str)) -> anyhow::Result<ProcessOutcome> {
        let mut stdout_open = true;
        loop {
            if !state.is_alive() {
                self.try_kill(Duration::from_secs(1))?;
                return Ok(ProcessOutcome::Cancelled);
            }
            if stdout_open {
                match self.lines.recv_timeout(POLL_INTERVAL) {
                    Ok(line) => {
                        on_line(&line);
                        continue;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => stdout_open = false,
                }
            } else {
                std::thread::sleep(POLL_INTERVAL);
            }
            if let Some(status) = self.child.try_wait().context("could not poll process")? {
                // lines written just before exit may still be in the pipe
                let deadline = Instant::now() + Duration::from_secs(1);
                while stdout_open && Instant::now() < deadline {
                    match self.lines.recv_timeout(POLL_INTERVAL) {
                        Ok(line) => on_line(&line),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => stdout_open = false,
                    }
                }
                self.join_reader();
                self.cleaned_up = true;
                return Ok(ProcessOutcome::Exited(status));
            }
        }
    }

    pub fn try_kill(&mut self, max_duration: Duration) -> anyhow::Result<()> {
        if self.child.try_wait().context("could not poll process")?.is_none() {
            self.child.kill().context("could not kill process")?;
        }
        let deadline = Instant::now() + max_duration;
        loop {
            if self.child.try_wait().context("could not poll process")?.is_some() {
                break;
            }
            if Instant::now() >= deadline {
                anyhow::bail!("process {} still running after kill", self.child.id());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.cleaned_up = true;
        self.join_reader();
        Ok(())
    }

    fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            // the reader ends at EOF; a grandchild holding the pipe must not block us
            if reader.is_finished() {
                let _ = reader.join();
            }
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        static CLEANUP_DURATION: Duration = Duration::from_millis(100);
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                warn!("could not kill process on drop: {e:#}");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod process_tests {
    use super::*;

    #[test]
    fn test_collects_output() {
        let state = SharedState::new();
        let dir = std::env::temp_dir();
        let mut process = ManagedProcess::launch(
            "sh",
            &["-c".into(), "echo one; echo two; exit 3".into()],
            &dir,
            false,
        )
        .unwrap();
        let mut lines = Vec::new();
        let outcome = process.watch(&state, |l| lines.push(l.to_string())).unwrap();
        match outcome {
            ProcessOutcome::Exited(status) => assert_eq!(status.code(), Some(3)),
            ProcessOutcome::Cancelled => panic!("not cancelled"),
        }
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn test_stop_kills_the_process() {
        let state = std::sync::Arc::new(SharedState::new());
        let stopper = {
            let state = std::sync::Arc::clone(&state);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(200));
                state.stop();
            })
        };
        let mut process =
            ManagedProcess::launch("sleep", &["30".into()], &std::env::temp_dir(), false).unwrap();
        let start = Instant::now();
        let outcome = process.watch(&state, |_| {}).unwrap();
        stopper.join().unwrap();
        assert_eq!(outcome, ProcessOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
