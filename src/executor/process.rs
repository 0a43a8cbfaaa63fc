/*
 * pacsmith - Package resolution and build orchestration for Arch Linux.
 * Copyright (C) 2025  pacsmith contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Managed subprocesses with line streaming and cooperative cancellation.

use std::collections::VecDeque;
use std::fmt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::Stdio;
use std::process::ExitStatus;
use std::time::Duration;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::{ErrorContext, PacsmithResult};

/// A fully specified external command
#[derive(Debug, Clone, PartialEq)]
pub struct StepCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl StepCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Run `inner` through a prefix such as `sudo` or `sudo -u alice`
    pub fn prefixed(prefix: &[String], inner: StepCommand) -> Self {
        match prefix.split_first() {
            Some((program, rest)) => {
                let mut args = rest.to_vec();
                args.push(inner.program);
                args.extend(inner.args);
                Self {
                    program: program.clone(),
                    args,
                    cwd: inner.cwd,
                    env: inner.env,
                }
            }
            None => inner,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for StepCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How a managed process ended
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub cancelled: bool,
    /// Last captured output lines, oldest first
    pub tail: Vec<String>,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

/// Output still buffered when the process exits is read for at most this long
const DRAIN_WINDOW: Duration = Duration::from_millis(250);

/// Cancellation counter shared with an execution ticket; every bump
/// cancels the subprocess active at that moment
pub type CancelSignal = watch::Receiver<u64>;

/// Spawns one command and streams its output
pub struct ManagedProcess {
    grace: Duration,
    capture: usize,
}

impl ManagedProcess {
    pub fn new(grace: Duration, capture: usize) -> Self {
        Self { grace, capture }
    }

    /// Run to completion, handing every stdout/stderr line to `on_line` as
    /// soon as it is read. With a `cancel` signal, a bump terminates the
    /// process group: SIGTERM, then SIGKILL after the grace period.
    pub async fn run<F>(
        &self,
        step: &StepCommand,
        cancel: Option<&mut CancelSignal>,
        mut on_line: F,
    ) -> PacsmithResult<ProcessOutcome>
    where
        F: FnMut(&str),
    {
        let mut std_command = std::process::Command::new(&step.program);
        std_command
            .args(&step.args)
            .envs(step.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // own group, so cancelling reaches the tool's children too
            .process_group(0);
        if let Some(dir) = &step.cwd {
            std_command.current_dir(dir);
        }
        let mut command = Command::from(std_command);
        command.kill_on_drop(true);

        tracing::debug!(command = %step, "spawning");
        let mut child = command
            .spawn()
            .context(format!("cannot start '{}'", step.program))?;

        let (tx, mut lines) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone());
        }
        drop(tx);

        let mut cancel = cancel;
        let mut cancelled = false;
        let mut tail: VecDeque<String> = VecDeque::with_capacity(self.capture.min(1024));
        let capture = self.capture;
        let mut record = |line: String| {
            on_line(&line);
            if capture > 0 {
                if tail.len() == capture {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        };

        // the leader's exit ends the run; descendants may keep the pipes open
        let mut pipes_open = true;
        let status = loop {
            tokio::select! {
                line = lines.recv(), if pipes_open => match line {
                    Some(line) => record(line),
                    None => pipes_open = false,
                },
                status = child.wait() => {
                    break status.context(format!("failed waiting for '{}'", step.program))?;
                }
                _ = cancel_requested(&mut cancel), if !cancelled => {
                    cancelled = true;
                    tracing::info!(command = %step, "cancelling subprocess");
                    break terminate(&mut child, self.grace)
                        .await
                        .context(format!("failed waiting for '{}'", step.program))?;
                }
            }
        };

        let deadline = Instant::now() + DRAIN_WINDOW;
        while pipes_open {
            match tokio::time::timeout_at(deadline, lines.recv()).await {
                Ok(Some(line)) => record(line),
                Ok(None) => pipes_open = false,
                Err(_) => {
                    tracing::debug!(command = %step, "output still open after exit, detaching");
                    break;
                }
            }
        }

        Ok(ProcessOutcome {
            exit_code: status.code(),
            signal: status.signal(),
            cancelled,
            tail: tail.into(),
        })
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Resolves on the next unseen bump; never resolves without a signal
async fn cancel_requested(cancel: &mut Option<&mut CancelSignal>) {
    match cancel {
        Some(rx) => {
            if rx.changed().await.is_err() {
                // ticket dropped, nobody can cancel any more
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

fn signal_group(pgid: Option<Pid>, signal: Signal) {
    if let Some(pgid) = pgid {
        if let Err(e) = killpg(pgid, signal) {
            tracing::debug!(pgid = pgid.as_raw(), %signal, "signal not delivered: {}", e);
        }
    }
}

/// SIGTERM to the process group, SIGKILL to whatever is left after the
/// grace period, then reap the leader
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    // the leader was spawned with process_group(0), so its pid is the pgid
    let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
    signal_group(pgid, Signal::SIGTERM);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            signal_group(pgid, Signal::SIGKILL);
            status
        }
        Err(_) => {
            tracing::warn!("subprocess group ignored SIGTERM, killing");
            signal_group(pgid, Signal::SIGKILL);
            child.wait().await
        }
    }
}
