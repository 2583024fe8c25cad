// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-instance worker supervision.
//!
//! An [`InstanceSupervisor`] drives one worker slot through the
//! [`SupervisorState`] machine: spawn, wait, classify the exit, back off and
//! retry until cancelled or out of restarts. Process handling sits behind
//! [`WorkerRunner`] so the restart policy can be exercised without real
//! child processes.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregate;
use crate::error::{ConduitResult, SupervisorError};
use crate::state::{SupervisorState, SupervisorStateMachine};
use crate::types::{Bandwidth, InstanceId};
use crate::units::format_duration;

/// Crashes tolerated per instance before it is given up on.
pub const MAX_RESTARTS: u32 = 5;

/// Fixed delay between a crash and the next attempt.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Time a worker gets to exit after a termination request.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Restart and shutdown timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_restarts: u32,
    pub backoff: Duration,
    pub shutdown_grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_restarts: MAX_RESTARTS,
            backoff: RESTART_BACKOFF,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// Everything needed to launch one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub instance: InstanceId,
    /// Exclusive to this worker; created before the first spawn.
    pub data_dir: PathBuf,
    pub max_clients: u32,
    /// Per-worker share, or [`crate::types::UNLIMITED_MBPS`].
    pub bandwidth_mbps: f64,
    pub psiphon_config: Option<PathBuf>,
    pub verbosity: u8,
}

impl WorkerSpec {
    /// Arguments for re-invoking this executable as a single-instance worker.
    ///
    /// No stats file is passed; the parent owns the combined document.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "start".into(),
            "--data-dir".into(),
            self.data_dir.clone().into(),
            "-m".into(),
            self.max_clients.to_string().into(),
            "-b".into(),
            Bandwidth::format_worker_arg(self.bandwidth_mbps).into(),
        ];
        if let Some(config) = &self.psiphon_config {
            args.push("-c".into());
            args.push(config.clone().into());
        }
        for _ in 0..self.verbosity {
            args.push("-v".into());
        }
        args.push("--instances".into());
        args.push("1".into());
        args
    }
}

/// Resolves when the worker has exited: `Ok` for a successful exit status.
pub type WorkerExit = BoxFuture<'static, ConduitResult<()>>;

/// Launches workers. The returned future owns the process until it exits and
/// must honor `cancel` by stopping the worker within the grace period.
pub trait WorkerRunner: Send + Sync + 'static {
    fn spawn(&self, spec: &WorkerSpec, cancel: CancellationToken) -> ConduitResult<WorkerExit>;
}

/// Restart loop for one instance.
pub struct InstanceSupervisor {
    spec: WorkerSpec,
    runner: Arc<dyn WorkerRunner>,
    aggregate: Arc<Aggregate>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl InstanceSupervisor {
    pub fn new(
        spec: WorkerSpec,
        runner: Arc<dyn WorkerRunner>,
        aggregate: Arc<Aggregate>,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            spec,
            runner,
            aggregate,
            policy,
            cancel,
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.spec.instance
    }

    /// Supervise until shutdown or until the restart ceiling is reached.
    ///
    /// Returns the terminal state. Giving up after a failing worker is an
    /// error carrying that worker's last failure.
    pub async fn run(self) -> ConduitResult<SupervisorState> {
        let instance = self.spec.instance;
        let max_restarts = self.policy.max_restarts;
        let mut machine = SupervisorStateMachine::new(instance);

        loop {
            if self.cancel.is_cancelled() {
                machine.transition_to(SupervisorState::ExitedClean)?;
                return Ok(machine.state());
            }

            let result = match self.runner.spawn(&self.spec, self.cancel.clone()) {
                Ok(exit) => {
                    machine.transition_to(SupervisorState::Running)?;
                    exit.await
                }
                Err(e) => Err(e),
            };

            if self.cancel.is_cancelled() {
                machine.transition_to(SupervisorState::ExitedClean)?;
                tracing::debug!(instance = %instance, "Worker stopped for shutdown");
                return Ok(machine.state());
            }

            let ran_for = machine.time_in_current_state();
            machine.transition_to(SupervisorState::ExitedCrashed)?;
            if let Err(e) = &result {
                tracing::warn!(instance = %instance, ran_for = ?ran_for, error = %e, "Worker failed");
            }

            let restarts = machine.record_restart();
            self.aggregate.record_restart(instance, restarts).await;

            if machine.retries_exhausted(max_restarts) {
                machine.transition_to(SupervisorState::GivenUp)?;
                println!("[{}] Reached max restarts ({}), giving up", instance, max_restarts);
                return match result {
                    Ok(()) => Ok(machine.state()),
                    Err(e) => Err(SupervisorError::RetriesExhausted {
                        instance,
                        max_restarts,
                        source: Box::new(e),
                    }
                    .into()),
                };
            }

            machine.transition_to(SupervisorState::Backoff)?;
            println!(
                "[{}] Crashed (restart {}/{}), restarting in {}...",
                instance,
                restarts,
                max_restarts,
                format_duration(self.policy.backoff)
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    machine.transition_to(SupervisorState::ExitedClean)?;
                    return Ok(machine.state());
                }
                _ = tokio::time::sleep(self.policy.backoff) => {
                    machine.transition_to(SupervisorState::Starting)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConduitError;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Instances listed in `crashing` exit with an error at once; the rest
    /// run until cancelled.
    struct FakeRunner {
        spawns: Vec<AtomicU32>,
        crashing: Vec<usize>,
        spawn_fails: bool,
    }

    impl FakeRunner {
        fn new(instances: usize, crashing: Vec<usize>) -> Self {
            Self {
                spawns: (0..instances).map(|_| AtomicU32::new(0)).collect(),
                crashing,
                spawn_fails: false,
            }
        }

        fn spawns(&self, index: usize) -> u32 {
            self.spawns[index].load(Ordering::SeqCst)
        }
    }

    impl WorkerRunner for FakeRunner {
        fn spawn(&self, spec: &WorkerSpec, cancel: CancellationToken) -> ConduitResult<WorkerExit> {
            let index = spec.instance.index();
            self.spawns[index].fetch_add(1, Ordering::SeqCst);
            let instance = spec.instance;

            if self.spawn_fails {
                return Err(SupervisorError::SpawnFailed {
                    instance,
                    reason: "No such file or directory".to_string(),
                }
                .into());
            }

            let crash = self.crashing.contains(&index);
            Ok(Box::pin(async move {
                if crash {
                    Err(SupervisorError::WorkerExited {
                        instance,
                        status: "exit status: 1".to_string(),
                    }
                    .into())
                } else {
                    cancel.cancelled().await;
                    Ok(())
                }
            }))
        }
    }

    fn spec(index: usize) -> WorkerSpec {
        WorkerSpec {
            instance: InstanceId::new(index),
            data_dir: PathBuf::from(format!("/tmp/data/{}", index)),
            max_clients: 50,
            bandwidth_mbps: 10.0,
            psiphon_config: None,
            verbosity: 0,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_restarts: 5,
            backoff: Duration::from_millis(5),
            shutdown_grace: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_worker_args() {
        let mut spec = spec(2);
        spec.bandwidth_mbps = 13.25;
        spec.psiphon_config = Some(PathBuf::from("/etc/psiphon.json"));
        spec.verbosity = 2;

        let args: Vec<String> = spec
            .args()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "start",
                "--data-dir",
                "/tmp/data/2",
                "-m",
                "50",
                "-b",
                "13.25",
                "-c",
                "/etc/psiphon.json",
                "-v",
                "-v",
                "--instances",
                "1",
            ]
        );
    }

    #[test]
    fn test_worker_args_unlimited() {
        let mut spec = spec(0);
        spec.bandwidth_mbps = crate::types::UNLIMITED_MBPS;
        let args = spec.args();
        let b = args.iter().position(|a| a == "-b").unwrap();
        assert_eq!(args[b + 1], "-1");
        assert!(!args.iter().any(|a| a == "-c" || a == "-v"));
    }

    #[tokio::test]
    async fn test_crashing_instance_gives_up_others_unaffected() {
        let runner = Arc::new(FakeRunner::new(3, vec![1]));
        let (aggregate, _rx) = Aggregate::new(3, false);
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for i in 0..3 {
            let supervisor = InstanceSupervisor::new(
                spec(i),
                runner.clone(),
                aggregate.clone(),
                fast_policy(),
                cancel.clone(),
            );
            handles.push(tokio::spawn(supervisor.run()));
        }
        let mut handles = handles.into_iter();
        let first = handles.next().unwrap();
        let crashing = handles.next().unwrap();
        let third = handles.next().unwrap();

        let err = crashing.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ConduitError::Supervisor(SupervisorError::RetriesExhausted { max_restarts: 5, .. })
        ));
        assert_eq!(runner.spawns(1), 5);

        // Healthy instances are still running their first worker.
        assert!(!first.is_finished());
        assert!(!third.is_finished());

        cancel.cancel();
        assert_eq!(first.await.unwrap().unwrap(), SupervisorState::ExitedClean);
        assert_eq!(third.await.unwrap().unwrap(), SupervisorState::ExitedClean);
        assert_eq!(runner.spawns(0), 1);
        assert_eq!(runner.spawns(2), 1);

        let stats = aggregate.instance(InstanceId::new(1)).await.unwrap();
        assert_eq!(stats.restart_count, 5);
        assert_eq!(aggregate.instance(InstanceId::new(0)).await.unwrap().restart_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_stops_for_good() {
        let runner = Arc::new(FakeRunner::new(2, vec![0, 1]));
        let (aggregate, _rx) = Aggregate::new(2, false);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            backoff: Duration::from_secs(3600),
            ..fast_policy()
        };

        let handles: Vec<_> = (0..2)
            .map(|i| {
                tokio::spawn(
                    InstanceSupervisor::new(
                        spec(i),
                        runner.clone(),
                        aggregate.clone(),
                        policy,
                        cancel.clone(),
                    )
                    .run(),
                )
            })
            .collect();

        // Both crash once and park in backoff.
        while runner.spawns(0) < 1 || runner.spawns(1) < 1 {
            tokio::task::yield_now().await;
        }
        while aggregate.instance(InstanceId::new(0)).await.unwrap().restart_count < 1
            || aggregate.instance(InstanceId::new(1)).await.unwrap().restart_count < 1
        {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        for handle in handles {
            let state = tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(state, SupervisorState::ExitedClean);
        }
        assert_eq!(runner.spawns(0), 1);
        assert_eq!(runner.spawns(1), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_follows_restart_policy() {
        let mut runner = FakeRunner::new(1, vec![]);
        runner.spawn_fails = true;
        let runner = Arc::new(runner);
        let (aggregate, _rx) = Aggregate::new(1, false);
        let policy = RetryPolicy {
            max_restarts: 2,
            ..fast_policy()
        };

        let err = InstanceSupervisor::new(
            spec(0),
            runner.clone(),
            aggregate,
            policy,
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap_err();

        assert_eq!(runner.spawns(0), 2);
        match err {
            ConduitError::Supervisor(SupervisorError::RetriesExhausted { source, .. }) => {
                assert!(matches!(
                    *source,
                    ConduitError::Supervisor(SupervisorError::SpawnFailed { .. })
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_spawns() {
        let runner = Arc::new(FakeRunner::new(1, vec![]));
        let (aggregate, _rx) = Aggregate::new(1, false);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let state = InstanceSupervisor::new(spec(0), runner.clone(), aggregate, fast_policy(), cancel)
            .run()
            .await
            .unwrap();

        assert_eq!(state, SupervisorState::ExitedClean);
        assert_eq!(runner.spawns(0), 0);
    }
}
