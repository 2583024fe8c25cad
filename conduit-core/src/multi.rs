// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Multi-instance orchestration.
//!
//! Starts one supervisor per worker slot plus the aggregator, waits for the
//! supervisors, then flushes the aggregate and reports the first failure.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{Aggregate, Aggregator, AggregatorSettings};
use crate::config::{create_private_dir, Config};
use crate::error::{ConduitError, ConduitResult};
use crate::process::{ProcessRunner, WorkerSignal};
use crate::sizing::InstancePlan;
use crate::stats::AggregateSnapshot;
use crate::supervisor::{InstanceSupervisor, RetryPolicy, WorkerRunner, WorkerSpec};
use crate::types::InstanceId;

/// Stops a running [`MultiService`] from another task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    cancel: CancellationToken,
    aggregate: Arc<Aggregate>,
}

impl StopHandle {
    /// Interrupt registered workers and cancel everything. Safe to repeat.
    pub async fn stop(&self) {
        let interrupted = self.aggregate.signal_workers(WorkerSignal::Interrupt).await;
        tracing::debug!(workers = interrupted, "Interrupt requested");
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Supervises `instances` workers of the same executable.
pub struct MultiService {
    config: Config,
    plan: InstancePlan,
    policy: RetryPolicy,
    settings: AggregatorSettings,
    aggregate: Arc<Aggregate>,
    changes: tokio::sync::mpsc::Receiver<()>,
    cancel: CancellationToken,
}

impl MultiService {
    pub fn new(config: Config) -> Self {
        let plan = InstancePlan::new(config.instances, config.max_clients, config.bandwidth);
        let (aggregate, changes) = Aggregate::new(plan.instances, config.per_instance_stats);
        let settings = AggregatorSettings {
            stats_file: config.stats_file.clone(),
            ..Default::default()
        };
        Self {
            config,
            plan,
            policy: RetryPolicy::default(),
            settings,
            aggregate,
            changes,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override idle and sweep timing. The stats file stays as configured.
    pub fn with_aggregator_settings(mut self, settings: AggregatorSettings) -> Self {
        self.settings = AggregatorSettings {
            stats_file: self.settings.stats_file.take(),
            ..settings
        };
        self
    }

    /// Stop when `cancel` fires, in addition to the returned stop handles.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn plan(&self) -> &InstancePlan {
        &self.plan
    }

    pub fn aggregate(&self) -> Arc<Aggregate> {
        self.aggregate.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            cancel: self.cancel.clone(),
            aggregate: self.aggregate.clone(),
        }
    }

    fn instance_dir(&self, index: usize) -> PathBuf {
        self.config.data_dir.join(index.to_string())
    }

    /// Re-invoke `executable` for every worker.
    pub fn process_runner(&self, executable: impl Into<PathBuf>) -> ProcessRunner {
        ProcessRunner::new(executable, self.aggregate.clone(), self.config.verbosity)
            .with_grace(self.policy.shutdown_grace)
    }

    /// Run all instances until they stop. Returns the first terminal
    /// failure, if any.
    pub async fn run(self, runner: Arc<dyn WorkerRunner>) -> ConduitResult<AggregateSnapshot> {
        println!(
            "Starting {} Psiphon Conduit instances (Max Clients/instance: {}, Bandwidth: {})",
            self.plan.instances,
            self.plan.clients_per_instance,
            self.plan.bandwidth_label()
        );

        for index in 0..self.plan.instances {
            create_private_dir(&self.instance_dir(index))?;
        }

        let aggregator = Aggregator::new(self.aggregate.clone(), self.changes, self.settings);
        let aggregator = tokio::spawn(aggregator.run(self.cancel.clone()));

        let mut supervisors = JoinSet::new();
        for index in 0..self.plan.instances {
            let spec = WorkerSpec {
                instance: InstanceId::new(index),
                data_dir: self.config.data_dir.join(index.to_string()),
                max_clients: self.plan.clients_per_instance,
                bandwidth_mbps: self.plan.bandwidth_per_instance_mbps,
                psiphon_config: self.config.psiphon_config.clone(),
                verbosity: self.config.verbosity,
            };
            println!("[{}] Starting with data dir: {}", spec.instance, spec.data_dir.display());
            let supervisor = InstanceSupervisor::new(
                spec,
                runner.clone(),
                self.aggregate.clone(),
                self.policy,
                self.cancel.clone(),
            );
            supervisors.spawn(supervisor.run());
        }

        let mut first_error: Option<ConduitError> = None;
        while let Some(joined) = supervisors.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "Supervisor task failed");
                    continue;
                }
            };
            match outcome {
                Ok(state) => tracing::debug!(state = %state, "Supervisor finished"),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        self.cancel.cancel();
        let last = match aggregator.await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::error!(error = %e, "Aggregator task failed");
                None
            }
        };
        println!("All instances stopped.");

        match (first_error, last) {
            (Some(e), _) => Err(e),
            (None, Some(snapshot)) => Ok(snapshot),
            (None, None) => Ok(self.aggregate.snapshot().await),
        }
    }

    /// Run every instance as a child process of `executable`.
    pub async fn run_processes(self, executable: impl Into<PathBuf>) -> ConduitResult<AggregateSnapshot> {
        let mut runner = self.process_runner(executable);
        if let Some(engine) = &self.config.engine {
            runner = runner.with_env(crate::engine::ENGINE_ENV, engine.clone());
        }
        self.run(Arc::new(runner)).await
    }
}
