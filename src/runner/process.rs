//! Dispatcher subprocess capability.
//!
//! The scheduler only sees [`ProcessSpawner`] and [`ChildProcess`]; the
//! production [`ShellSpawner`] runs commands through `sh -c` on
//! `tokio::process`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;

use crate::error::ProcessError;

/// Size of one non-blocking read.
const READ_CHUNK: usize = 65535;

/// Bound on reaping a process being closed.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Observed state of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exited with the given code; `None` if killed by a signal.
    Exited(Option<i32>),
}

/// A spawned dispatcher.
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id, if the process has not been reaped.
    fn id(&self) -> Option<u32>;

    /// Checks the status without blocking.
    fn try_status(&mut self) -> Result<ProcessStatus, ProcessError>;

    /// Appends whatever output is available right now, without waiting.
    fn drain_output(&mut self, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>);

    /// Reads the rest of the output of an exited process, for at most
    /// `timeout`.
    async fn collect_output(&mut self, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>, timeout: Duration);

    /// Sends SIGTERM, or SIGKILL if `force`.
    fn terminate(&mut self, force: bool) -> Result<(), ProcessError>;

    /// Closes the pipes and reaps the process.
    async fn close(&mut self);
}

/// Something that starts dispatcher commands.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &str) -> Result<Box<dyn ChildProcess>, ProcessError>;
}

/// Runs commands with `sh -c`, stdin closed, stdout and stderr piped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellSpawner;

impl ProcessSpawner for ShellSpawner {
    fn spawn(&self, command: &str) -> Result<Box<dyn ChildProcess>, ProcessError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        Ok(Box::new(ShellChild {
            child,
            stdout,
            stderr,
        }))
    }
}

/// A `sh -c` child with its output pipes.
pub struct ShellChild {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

/// Reads everything ready on `pipe` into `buf`. Drops the pipe at EOF.
fn drain_pipe<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut Vec<u8>) {
    let Some(reader) = pipe.as_mut() else {
        return;
    };
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut closed = false;
    loop {
        match reader.read(&mut chunk).now_or_never() {
            Some(Ok(0)) => {
                closed = true;
                break;
            }
            Some(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Some(Err(e)) => {
                debug!(error = %e, "Pipe read failed");
                closed = true;
                break;
            }
            None => break,
        }
    }
    if closed {
        *pipe = None;
    }
}

#[async_trait]
impl ChildProcess for ShellChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_status(&mut self) -> Result<ProcessStatus, ProcessError> {
        match self.child.try_wait()? {
            None => Ok(ProcessStatus::Running),
            Some(status) => Ok(ProcessStatus::Exited(status.code())),
        }
    }

    fn drain_output(&mut self, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>) {
        drain_pipe(&mut self.stdout, stdout);
        drain_pipe(&mut self.stderr, stderr);
    }

    async fn collect_output(&mut self, stdout: &mut Vec<u8>, stderr: &mut Vec<u8>, timeout: Duration) {
        // Whatever the process wrote before exiting is already buffered.
        self.drain_output(stdout, stderr);
        if self.stdout.is_none() && self.stderr.is_none() {
            return;
        }

        // A leftover background process may still hold the pipes open.
        let (out_pipe, err_pipe) = (&mut self.stdout, &mut self.stderr);
        let read = async {
            let out = async {
                if let Some(pipe) = out_pipe.as_mut() {
                    let _ = pipe.read_to_end(stdout).await;
                }
            };
            let err = async {
                if let Some(pipe) = err_pipe.as_mut() {
                    let _ = pipe.read_to_end(stderr).await;
                }
            };
            tokio::join!(out, err);
        };
        if tokio::time::timeout(timeout, read).await.is_err() {
            debug!("Timed out reading dispatcher output");
        }
    }

    fn terminate(&mut self, force: bool) -> Result<(), ProcessError> {
        if force {
            return Ok(self.child.start_kill()?);
        }
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let raw = i32::try_from(pid).map_err(|e| ProcessError::Signal {
            pid,
            reason: e.to_string(),
        })?;
        kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(|e| ProcessError::Signal {
            pid,
            reason: e.to_string(),
        })
    }

    async fn close(&mut self) {
        self.stdout = None;
        self.stderr = None;
        match tokio::time::timeout(CLOSE_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!(status = %status, "Reaped dispatcher"),
            Ok(Err(e)) => debug!(error = %e, "Could not reap dispatcher"),
            Err(_) => debug!("Dispatcher still running after close"),
        }
    }
}
