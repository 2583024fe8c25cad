// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Worker process management.
//!
//! Spawns each worker as the leader of its own process group with both
//! output streams piped into scrapers, and stops it with a
//! terminate-then-kill sequence on shutdown. Anything a worker starts (its
//! relay engine) shares the group and is signalled with it.
//!
//! Signals only ever go through the task that owns the unreaped [`Child`],
//! so a recycled pid is never hit. Other tasks ask for a signal through a
//! [`WorkerHandle`].

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregate;
use crate::error::{ConduitResult, SupervisorError};
use crate::scraper::OutputScraper;
use crate::supervisor::{WorkerExit, WorkerRunner, WorkerSpec, SHUTDOWN_GRACE};
use crate::types::InstanceId;

/// Signals other tasks may request for a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// SIGINT to the worker alone; it shuts its engine down itself.
    Interrupt,
    /// SIGKILL to the worker's whole process group.
    Kill,
}

impl WorkerSignal {
    fn delivery(self) -> (Signal, Scope) {
        match self {
            Self::Interrupt => (Signal::SIGINT, Scope::Process),
            Self::Kill => (Signal::SIGKILL, Scope::Group),
        }
    }
}

/// Which processes a signal reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Process,
    /// The child and everything in its process group. The child must have
    /// been spawned as a group leader.
    Group,
}

/// Route to a running worker's supervising task.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pid: u32,
    requests: mpsc::UnboundedSender<WorkerSignal>,
}

impl WorkerHandle {
    pub fn new(pid: u32) -> (Self, mpsc::UnboundedReceiver<WorkerSignal>) {
        let (requests, rx) = mpsc::unbounded_channel();
        (Self { pid, requests }, rx)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Queue `signal` for delivery. Returns false once the worker is gone.
    pub fn send(&self, signal: WorkerSignal) -> bool {
        self.requests.send(signal).is_ok()
    }
}

/// Signal a child that has not been reaped yet. A reaped child is a no-op.
pub fn signal_child(child: &Child, signal: Signal, scope: Scope) -> nix::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = Pid::from_raw(i32::try_from(pid).map_err(|_| Errno::ESRCH)?);
    match scope {
        Scope::Process => signal::kill(pid, signal),
        Scope::Group => signal::killpg(pid, signal),
    }
}

/// Have the kernel kill the spawned process if its parent dies first.
#[cfg(target_os = "linux")]
pub(crate) fn die_with_parent(command: &mut Command) {
    // SAFETY: prctl is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(|| {
            nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn die_with_parent(_command: &mut Command) {}

/// Wait for `child`, stopping it once `cancel` fires.
///
/// On cancellation the child gets SIGTERM and `grace` to exit before it is
/// killed. Returns the exit status in every case.
pub async fn wait_with_grace(
    child: &mut Child,
    cancel: &CancellationToken,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => return status,
        _ = cancel.cancelled() => {}
    }
    stop_child(child, grace, Scope::Process).await
}

/// Like [`wait_with_grace`] for a group-leading worker, also serving
/// signal requests from its [`WorkerHandle`].
async fn wait_worker(
    child: &mut Child,
    cancel: &CancellationToken,
    grace: Duration,
    requests: &mut mpsc::UnboundedReceiver<WorkerSignal>,
) -> std::io::Result<ExitStatus> {
    loop {
        tokio::select! {
            status = child.wait() => return status,
            _ = cancel.cancelled() => return stop_child(child, grace, Scope::Group).await,
            Some(request) = requests.recv() => {
                let (signal, scope) = request.delivery();
                if let Err(e) = signal_child(child, signal, scope) {
                    tracing::debug!(pid = child.id(), signal = ?signal, error = %e, "Signal failed");
                }
            }
        }
    }
}

async fn stop_child(child: &mut Child, grace: Duration, scope: Scope) -> std::io::Result<ExitStatus> {
    if let Err(e) = signal_child(child, Signal::SIGTERM, scope) {
        tracing::debug!(pid = child.id(), error = %e, "Termination request failed");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(pid = child.id(), "Worker ignored termination, killing");
            if let Err(e) = signal_child(child, Signal::SIGKILL, scope) {
                tracing::debug!(pid = child.id(), error = %e, "Kill failed");
                child.start_kill()?;
            }
            child.wait().await
        }
    }
}

/// Runs workers as child processes of `executable`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    executable: PathBuf,
    aggregate: Arc<Aggregate>,
    verbosity: u8,
    grace: Duration,
    env: Vec<(OsString, OsString)>,
}

impl ProcessRunner {
    pub fn new(executable: impl Into<PathBuf>, aggregate: Arc<Aggregate>, verbosity: u8) -> Self {
        Self {
            executable: executable.into(),
            aggregate,
            verbosity,
            grace: SHUTDOWN_GRACE,
            env: Vec::new(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Extra environment on top of the inherited one.
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self, spec: &WorkerSpec) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .args(spec.args())
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        die_with_parent(&mut command);
        command
    }
}

impl WorkerRunner for ProcessRunner {
    fn spawn(&self, spec: &WorkerSpec, cancel: CancellationToken) -> ConduitResult<WorkerExit> {
        let instance = spec.instance;
        let mut child = self
            .command(spec)
            .spawn()
            .map_err(|e| SupervisorError::SpawnFailed {
                instance,
                reason: format!("{}: {}", self.executable.display(), e),
            })?;

        let pid = child.id();
        tracing::debug!(
            instance = %instance,
            pid = pid,
            executable = %self.executable.display(),
            "Spawned worker process"
        );

        let scraper = OutputScraper::new(instance, self.aggregate.clone(), self.verbosity, cancel.clone());
        let readers = [
            child.stdout.take().map(|out| tokio::spawn(scraper.clone().consume(out))),
            child.stderr.take().map(|err| tokio::spawn(scraper.consume(err))),
        ];

        let aggregate = self.aggregate.clone();
        let grace = self.grace;

        Ok(Box::pin(async move {
            let (handle, mut requests) = WorkerHandle::new(pid.unwrap_or_default());
            aggregate.register_process(instance, pid.map(|_| handle)).await;
            let status = wait_worker(&mut child, &cancel, grace, &mut requests).await;
            aggregate.clear_process(instance).await;

            // Drain whatever the worker wrote before exiting.
            for reader in readers.into_iter().flatten() {
                let _ = reader.await;
            }

            classify_exit(instance, status)
        }))
    }
}

fn classify_exit(instance: InstanceId, status: std::io::Result<ExitStatus>) -> ConduitResult<()> {
    let status = status.map_err(|source| SupervisorError::WaitFailed { instance, source })?;
    tracing::debug!(instance = %instance, status = %status, "Worker exited");
    if status.success() {
        Ok(())
    } else {
        Err(SupervisorError::WorkerExited {
            instance,
            status: status.to_string(),
        }
        .into())
    }
}
