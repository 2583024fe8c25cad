// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-instance counters and the aggregate view derived from them.

use std::time::{Duration, Instant};

use chrono::{DateTime, Local, SecondsFormat};
use serde::Serialize;

use crate::scraper::StatsUpdate;
use crate::types::InstanceId;
use crate::units::{format_bytes, format_duration};

/// Last reported state of one worker slot.
///
/// Byte counters mirror the worker's own cumulative totals; they are
/// overwritten with each report, never summed here.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStats {
    pub id: InstanceId,
    pub is_live: bool,
    pub connecting: u64,
    pub connected: u64,
    pub bytes_up: i64,
    pub bytes_down: i64,
    pub restart_count: u32,
    /// When a live instance was first seen with zero connected clients.
    pub last_zero: Option<Instant>,
}

impl InstanceStats {
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            is_live: false,
            connecting: 0,
            connected: 0,
            bytes_up: 0,
            bytes_down: 0,
            restart_count: 0,
            last_zero: None,
        }
    }

    /// Apply the fields present in `update`. Returns true if any value changed.
    pub fn apply(&mut self, update: &StatsUpdate) -> bool {
        let mut changed = false;
        changed |= replace(&mut self.connecting, update.connecting);
        changed |= replace(&mut self.connected, update.connected);
        changed |= replace(&mut self.bytes_up, update.bytes_up);
        changed |= replace(&mut self.bytes_down, update.bytes_down);
        changed
    }

    /// Mark the instance live. Returns true only on the first transition.
    pub fn mark_live(&mut self) -> bool {
        if self.is_live {
            return false;
        }
        self.is_live = true;
        true
    }

    /// Record a restart. The count never goes backwards; the instance is no
    /// longer live until its next worker announces itself.
    pub fn record_restart(&mut self, restart_count: u32) {
        self.restart_count = self.restart_count.max(restart_count);
        self.is_live = false;
        self.last_zero = None;
    }

    /// Idle bookkeeping for one sweep at `now`.
    ///
    /// Returns how long the instance has been idle when that exceeds
    /// `idle_timeout`; the idle timer is reset in that case.
    pub fn check_idle(&mut self, now: Instant, idle_timeout: Duration) -> Option<Duration> {
        if self.connected > 0 {
            self.last_zero = None;
            return None;
        }
        if !self.is_live {
            return None;
        }
        match self.last_zero {
            None => {
                self.last_zero = Some(now);
                None
            }
            Some(since) => {
                let idle_for = now.saturating_duration_since(since);
                if idle_for > idle_timeout {
                    self.last_zero = None;
                    Some(idle_for)
                } else {
                    None
                }
            }
        }
    }
}

fn replace<T: PartialEq + Copy>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(v) if *slot != v => {
            *slot = v;
            true
        }
        _ => false,
    }
}

/// Per-instance entry of the persisted stats file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub id: String,
    pub is_live: bool,
    pub connecting: u64,
    pub connected: u64,
    pub bytes_up: i64,
    pub bytes_down: i64,
    pub restart_count: u32,
}

impl From<&InstanceStats> for InstanceSummary {
    fn from(stats: &InstanceStats) -> Self {
        Self {
            id: stats.id.to_string(),
            is_live: stats.is_live,
            connecting: stats.connecting,
            connected: stats.connected,
            bytes_up: stats.bytes_up,
            bytes_down: stats.bytes_down,
            restart_count: stats.restart_count,
        }
    }
}

/// Totals across all instances at one moment. Serializes to the stats file format.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub live_instances: usize,
    pub total_instances: usize,
    pub connecting_clients: u64,
    pub connected_clients: u64,
    pub total_bytes_up: i64,
    pub total_bytes_down: i64,
    pub total_restarts: u64,
    pub uptime_seconds: u64,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<InstanceSummary>>,
    #[serde(skip)]
    pub captured_at: DateTime<Local>,
}

impl AggregateSnapshot {
    /// Sum `instances`. A pure function of the records passed in.
    pub fn from_instances(
        instances: &[InstanceStats],
        uptime: Duration,
        captured_at: DateTime<Local>,
        include_instances: bool,
    ) -> Self {
        let mut snapshot = Self {
            live_instances: 0,
            total_instances: instances.len(),
            connecting_clients: 0,
            connected_clients: 0,
            total_bytes_up: 0,
            total_bytes_down: 0,
            total_restarts: 0,
            uptime_seconds: uptime.as_secs(),
            timestamp: captured_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            instances: None,
            captured_at,
        };

        for stats in instances {
            if stats.is_live {
                snapshot.live_instances += 1;
            }
            snapshot.connecting_clients = snapshot.connecting_clients.saturating_add(stats.connecting);
            snapshot.connected_clients = snapshot.connected_clients.saturating_add(stats.connected);
            snapshot.total_bytes_up = snapshot.total_bytes_up.saturating_add(stats.bytes_up);
            snapshot.total_bytes_down = snapshot.total_bytes_down.saturating_add(stats.bytes_down);
            snapshot.total_restarts = snapshot.total_restarts.saturating_add(u64::from(stats.restart_count));
        }

        if include_instances {
            snapshot.instances = Some(instances.iter().map(InstanceSummary::from).collect());
        }

        snapshot
    }

    /// The `[AGGREGATE]` console line.
    pub fn console_line(&self) -> String {
        let restarts = if self.total_restarts > 0 {
            format!(" | Restarts: {}", self.total_restarts)
        } else {
            String::new()
        };
        format!(
            "[AGGREGATE] {} Live: {}/{} | Connecting: {} | Connected: {} | Up: {} | Down: {} | Uptime: {}{}",
            self.captured_at.format("%Y-%m-%d %H:%M:%S"),
            self.live_instances,
            self.total_instances,
            self.connecting_clients,
            self.connected_clients,
            format_bytes(self.total_bytes_up),
            format_bytes(self.total_bytes_down),
            format_duration(Duration::from_secs(self.uptime_seconds)),
            restarts,
        )
    }
}
