//! Backend process handle
//!
//! Wraps one spawned backend executable. Both output pipes are read line by
//! line on background tasks; every line goes to the readiness channel and to
//! the [`EventBus`]. The readiness channel closes once both pipes hit EOF,
//! which is how an early exit becomes visible to the watcher.

use crate::error::ControlError;
use crate::event::{ControlEvent, EventBus, LogLine, OutputStream};
use crate::readiness::{Readiness, ReadinessWatcher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Hide the console window of spawned backends
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// A running backend executable
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    program: PathBuf,
    child: Child,
    lines: Option<mpsc::UnboundedReceiver<String>>,
}

impl ProcessHandle {
    /// Spawn `program` with a single pre-built argument string
    ///
    /// The child is killed when the handle is dropped.
    pub fn spawn(
        name: &str,
        program: &Path,
        args: &str,
        events: &EventBus,
    ) -> Result<Self, ControlError> {
        let mut command = Command::from(build_command(program, args));
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ControlError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

        info!(
            "Started {} ({}) pid {:?}: {}",
            name,
            program.display(),
            child.id(),
            args
        );

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, name, OutputStream::Stdout, tx.clone(), events.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, name, OutputStream::Stderr, tx, events.clone());
        }

        Ok(Self {
            name: name.to_string(),
            program: program.to_path_buf(),
            child,
            lines: Some(rx),
        })
    }

    /// Spawn and wait for readiness
    ///
    /// Anything but [`Readiness::Ready`] kills and reaps the process before
    /// the error is returned.
    pub async fn launch(
        name: &str,
        program: &Path,
        args: &str,
        events: &EventBus,
        watcher: &ReadinessWatcher,
    ) -> Result<Self, ControlError> {
        let mut handle = Self::spawn(name, program, args, events)?;
        let mut lines = handle
            .take_lines()
            .ok_or_else(|| ControlError::backend_failed(name, "output unavailable"))?;

        let error = match watcher.watch(&mut lines).await {
            Readiness::Ready => {
                info!("{} is ready", name);
                return Ok(handle);
            }
            Readiness::Failed(line) => ControlError::backend_failed(name, line),
            Readiness::Exited => ControlError::backend_failed(name, "exited before becoming ready"),
            Readiness::TimedOut => ControlError::ReadinessTimeout {
                name: name.to_string(),
            },
        };

        warn!("{} did not start: {}", name, error);
        handle.stop().await;
        Err(error)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// OS process id, `None` once reaped
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take the output line stream
    ///
    /// Lines keep flowing to the event bus after the receiver is dropped.
    pub fn take_lines(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.lines.take()
    }

    /// Check if the process already terminated
    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the process and wait until it is reaped
    pub async fn stop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // Already exited; reaping below is all that is left.
            debug!("Kill of {} skipped: {}", self.name, e);
        }

        match self.child.wait().await {
            Ok(status) => info!("{} stopped ({})", self.name, status),
            Err(e) => warn!("Failed to reap {}: {}", self.name, e),
        }
    }
}

fn build_command(program: &Path, args: &str) -> std::process::Command {
    let mut command = std::process::Command::new(program);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        command.raw_arg(args).creation_flags(CREATE_NO_WINDOW);
    }

    #[cfg(not(windows))]
    command.args(split_args(args));

    command
}

/// Split a command line into arguments, honouring double quotes
#[cfg_attr(windows, allow(dead_code))]
pub(crate) fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;

    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        args.push(current);
    }

    args
}

fn forward_lines<R>(
    reader: R,
    source: &str,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<String>,
    events: EventBus,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let source = source.to_string();

    tokio::spawn(async move {
        let mut segments = BufReader::new(reader).split(b'\n');

        loop {
            match segments.next_segment().await {
                Ok(Some(bytes)) => {
                    let line = String::from_utf8_lossy(&bytes)
                        .trim_end_matches('\r')
                        .to_string();
                    debug!("[{}] {}", source, line);

                    events.publish(ControlEvent::Log(LogLine {
                        source: source.clone(),
                        stream,
                        line: line.clone(),
                    }));
                    // The watcher may be gone; keep draining so the pipe never fills.
                    let _ = tx.send(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Output of {} closed: {}", source, e);
                    break;
                }
            }
        }
    });
}

/// Kill every process named `executable` except ourselves
///
/// Returns how many were killed.
pub fn kill_stale_instances(executable: &str) -> usize {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing(),
    );

    let own = Pid::from_u32(std::process::id());
    let mut killed = 0;

    for (pid, process) in system.processes() {
        if *pid == own || !process.name().to_string_lossy().eq_ignore_ascii_case(executable) {
            continue;
        }
        if process.kill() {
            info!("Killed stale {} (pid {})", executable, pid);
            killed += 1;
        } else {
            warn!("Failed to kill stale {} (pid {})", executable, pid);
        }
    }

    killed
}
