// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Cross-instance stats aggregation.
//!
//! [`Aggregate`] is the single owner of every [`InstanceStats`] record and of
//! the worker process table. It is shared by reference (`Arc`) with the
//! scrapers, supervisors and the [`Aggregator`] task. Its lock is only held
//! to mutate fields or copy them out; printing, file writes and signals
//! happen after it is released.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::persist::StatsWriter;
use crate::process::{WorkerHandle, WorkerSignal};
use crate::stats::{AggregateSnapshot, InstanceStats};
use crate::types::InstanceId;
use crate::units::format_duration;

/// A live instance with no connected clients for this long is restarted.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How often idle instances are checked when nothing else triggers a publish.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Pending change signals beyond this are dropped; one pending signal is
/// enough to trigger the next publish.
const CHANGE_QUEUE_DEPTH: usize = 100;

/// Aggregator configuration.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Destination of the JSON stats document, if any.
    pub stats_file: Option<PathBuf>,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            stats_file: None,
            idle_timeout: IDLE_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

/// An instance selected for a forced restart.
#[derive(Debug, Clone)]
pub struct IdleEviction {
    pub instance: InstanceId,
    /// The worker that was running when the instance was found idle.
    pub worker: Option<WorkerHandle>,
    pub idle_for: Duration,
}

impl IdleEviction {
    pub fn pid(&self) -> Option<u32> {
        self.worker.as_ref().map(WorkerHandle::pid)
    }
}

#[derive(Debug)]
struct AggregateState {
    instances: Vec<InstanceStats>,
    processes: Vec<Option<WorkerHandle>>,
}

impl AggregateState {
    fn sweep_idle(&mut self, now: Instant, idle_timeout: Duration) -> Vec<IdleEviction> {
        let mut evictions = Vec::new();
        for (stats, worker) in self.instances.iter_mut().zip(&self.processes) {
            if let Some(idle_for) = stats.check_idle(now, idle_timeout) {
                evictions.push(IdleEviction {
                    instance: stats.id,
                    worker: worker.clone(),
                    idle_for,
                });
            }
        }
        evictions
    }
}

/// Shared per-instance records plus the process table, behind one lock.
#[derive(Debug)]
pub struct Aggregate {
    state: Mutex<AggregateState>,
    changes: mpsc::Sender<()>,
    total: usize,
    started: Instant,
    include_instances: bool,
}

impl Aggregate {
    /// Create records for `instances` workers.
    ///
    /// Returns the receiving end of the change signal, to be handed to the
    /// [`Aggregator`].
    pub fn new(instances: usize, include_instances: bool) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (changes, rx) = mpsc::channel(CHANGE_QUEUE_DEPTH);
        let state = AggregateState {
            instances: (0..instances)
                .map(|i| InstanceStats::new(InstanceId::new(i)))
                .collect(),
            processes: vec![None; instances],
        };
        let aggregate = Self {
            state: Mutex::new(state),
            changes,
            total: instances,
            started: Instant::now(),
            include_instances,
        };
        (Arc::new(aggregate), rx)
    }

    /// Number of instance records. Fixed for the life of the aggregate.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Mutate one instance record under the lock.
    ///
    /// Returns `None` for an id outside this aggregate.
    pub async fn update<R>(
        &self,
        instance: InstanceId,
        f: impl FnOnce(&mut InstanceStats) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock().await;
        state.instances.get_mut(instance.index()).map(f)
    }

    /// Copy of one instance record.
    pub async fn instance(&self, instance: InstanceId) -> Option<InstanceStats> {
        let state = self.state.lock().await;
        state.instances.get(instance.index()).cloned()
    }

    /// Ask the aggregator to publish. Never blocks; a full queue already
    /// guarantees a publish.
    pub fn notify_changed(&self) {
        let _ = self.changes.try_send(());
    }

    pub async fn record_restart(&self, instance: InstanceId, restart_count: u32) {
        self.update(instance, |stats| stats.record_restart(restart_count))
            .await;
        self.notify_changed();
    }

    /// Remember the running worker for `instance`. Only its supervisor calls this.
    pub async fn register_process(&self, instance: InstanceId, worker: Option<WorkerHandle>) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.processes.get_mut(instance.index()) {
            *slot = worker;
        }
    }

    pub async fn clear_process(&self, instance: InstanceId) {
        self.register_process(instance, None).await;
    }

    /// Workers currently registered, for the stop path.
    pub async fn running_processes(&self) -> Vec<(InstanceId, u32)> {
        let state = self.state.lock().await;
        state
            .processes
            .iter()
            .enumerate()
            .filter_map(|(i, worker)| worker.as_ref().map(|w| (InstanceId::new(i), w.pid())))
            .collect()
    }

    /// Ask every registered worker's supervisor to deliver `signal`.
    /// Returns how many accepted the request.
    pub async fn signal_workers(&self, signal: WorkerSignal) -> usize {
        let state = self.state.lock().await;
        state
            .processes
            .iter()
            .flatten()
            .filter(|worker| worker.send(signal))
            .count()
    }

    /// Totals without touching idle bookkeeping.
    pub async fn snapshot(&self) -> AggregateSnapshot {
        let state = self.state.lock().await;
        AggregateSnapshot::from_instances(
            &state.instances,
            self.uptime(),
            Local::now(),
            self.include_instances,
        )
    }

    /// Idle bookkeeping without producing totals.
    pub async fn sweep_idle(&self, now: Instant, idle_timeout: Duration) -> Vec<IdleEviction> {
        let mut state = self.state.lock().await;
        state.sweep_idle(now, idle_timeout)
    }

    /// One publish: idle bookkeeping plus totals, under a single lock.
    pub async fn publish_cycle(
        &self,
        now: Instant,
        captured_at: DateTime<Local>,
        idle_timeout: Duration,
    ) -> (AggregateSnapshot, Vec<IdleEviction>) {
        let mut state = self.state.lock().await;
        let evictions = state.sweep_idle(now, idle_timeout);
        let snapshot = AggregateSnapshot::from_instances(
            &state.instances,
            now.saturating_duration_since(self.started),
            captured_at,
            self.include_instances,
        );
        (snapshot, evictions)
    }
}

/// Publishes totals on change and flushes once more on cancellation.
pub struct Aggregator {
    aggregate: Arc<Aggregate>,
    changes: mpsc::Receiver<()>,
    settings: AggregatorSettings,
}

impl Aggregator {
    pub fn new(
        aggregate: Arc<Aggregate>,
        changes: mpsc::Receiver<()>,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            aggregate,
            changes,
            settings,
        }
    }

    /// Run until `cancel` fires, then publish a final snapshot and wait for
    /// it to reach the stats file. Returns that final snapshot.
    pub async fn run(mut self, cancel: CancellationToken) -> AggregateSnapshot {
        let writer = self.settings.stats_file.clone().map(StatsWriter::spawn);

        let period = self.settings.sweep_interval;
        let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(()) = self.changes.recv() => {
                    // Coalesce a burst of changes into one publish.
                    while self.changes.try_recv().is_ok() {}
                    self.publish(writer.as_ref()).await;
                }
                _ = sweep.tick() => {
                    let evictions = self
                        .aggregate
                        .sweep_idle(Instant::now(), self.settings.idle_timeout)
                        .await;
                    evict(&evictions);
                }
            }
        }

        let last = self.publish(writer.as_ref()).await;
        if let Some(writer) = writer {
            writer.finish().await;
        }
        tracing::debug!(
            live = last.live_instances,
            total = last.total_instances,
            "Final stats flushed"
        );
        last
    }

    async fn publish(&self, writer: Option<&StatsWriter>) -> AggregateSnapshot {
        let (snapshot, evictions) = self
            .aggregate
            .publish_cycle(Instant::now(), Local::now(), self.settings.idle_timeout)
            .await;

        evict(&evictions);
        println!("{}", snapshot.console_line());
        if let Some(writer) = writer {
            writer.submit(&snapshot);
        }
        snapshot
    }
}

/// Kill idle workers and their engines. Their supervisors see a crash and
/// restart them.
fn evict(evictions: &[IdleEviction]) {
    for eviction in evictions {
        println!(
            "[{}] Idle for {} with no connections, restarting...",
            eviction.instance,
            format_duration(eviction.idle_for)
        );
        if let Some(worker) = &eviction.worker {
            if !worker.send(WorkerSignal::Kill) {
                tracing::debug!(instance = %eviction.instance, pid = worker.pid(), "Idle worker already exited");
            }
        }
    }
}
