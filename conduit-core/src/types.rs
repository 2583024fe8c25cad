// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! Following the "Newtype" pattern in Rust to ensure valid state by construction.
//! Client quotas and bandwidth limits validate at creation time, so the
//! supervisor only ever divides values that are already known to be sane.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Upper bound on clients a single Conduit host may accept.
pub const MAX_CLIENTS_LIMIT: u32 = 1000;

/// Decimal megabit: 1 Mbps = 125,000 bytes per second.
pub const BYTES_PER_SECOND_PER_MBPS: f64 = 125_000.0;

/// Wire value for "no bandwidth limit" in worker arguments.
pub const UNLIMITED_MBPS: f64 = -1.0;

/// Stable identity of one supervised worker slot.
///
/// The index never changes for the life of the parent process; restarts
/// reuse the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(usize);

impl InstanceId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Position of this instance in the aggregate tables.
    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// Validated client quota.
/// Must be in range 1..=MAX_CLIENTS_LIMIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u32")]
pub struct MaxClients(u32);

impl MaxClients {
    /// Create a new MaxClients with bounds validation.
    pub fn new(value: i64) -> Result<Self, HardValidationError> {
        if value < 1 || value > i64::from(MAX_CLIENTS_LIMIT) {
            return Err(HardValidationError::MaxClientsOutOfRange {
                value,
                max: MAX_CLIENTS_LIMIT,
            });
        }
        Ok(Self(value as u32))
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Share of this quota given to each of `instances` workers (floor, minimum 1).
    pub fn per_instance(&self, instances: usize) -> u32 {
        let instances = u32::try_from(instances.max(1)).unwrap_or(u32::MAX);
        (self.0 / instances).max(1)
    }
}

impl fmt::Display for MaxClients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for MaxClients {
    type Error = HardValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MaxClients> for u32 {
    fn from(clients: MaxClients) -> Self {
        clients.0
    }
}

/// Relay bandwidth limit, applied to both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bandwidth {
    Unlimited,
    /// Limit in bytes per second. Never zero.
    Limited(u64),
}

impl Bandwidth {
    /// Parse a megabit value as given on the command line.
    ///
    /// `-1` means unlimited. Any other value must be positive; worker shares
    /// of a small total are allowed to fall below 1 Mbps.
    pub fn from_mbps(mbps: f64) -> Result<Self, HardValidationError> {
        if mbps == UNLIMITED_MBPS {
            return Ok(Self::Unlimited);
        }
        if !mbps.is_finite() || mbps <= 0.0 {
            return Err(HardValidationError::InvalidBandwidth {
                value: mbps.to_string(),
            });
        }
        // A positive share never rounds down to "no limit".
        let bytes = ((mbps * BYTES_PER_SECOND_PER_MBPS) as u64).max(1);
        Ok(Self::Limited(bytes))
    }

    /// Zero bytes per second is the engine's way of saying "no limit".
    pub fn from_bytes_per_second(bytes: u64) -> Self {
        if bytes == 0 {
            Self::Unlimited
        } else {
            Self::Limited(bytes)
        }
    }

    pub fn bytes_per_second(&self) -> Option<u64> {
        match self {
            Self::Unlimited => None,
            Self::Limited(bytes) => Some(*bytes),
        }
    }

    pub fn mbps(&self) -> Option<f64> {
        self.bytes_per_second()
            .map(|bytes| bytes as f64 / BYTES_PER_SECOND_PER_MBPS)
    }

    /// Per-worker share in Mbps, or [`UNLIMITED_MBPS`].
    pub fn per_instance_mbps(&self, instances: usize) -> f64 {
        match self.bytes_per_second() {
            Some(bytes) => bytes as f64 / instances.max(1) as f64 / BYTES_PER_SECOND_PER_MBPS,
            None => UNLIMITED_MBPS,
        }
    }

    /// Render a per-worker share for the `-b` worker flag.
    ///
    /// Uses the shortest exact representation so the worker parses back
    /// the same share.
    pub fn format_worker_arg(mbps: f64) -> String {
        if mbps > 0.0 {
            format!("{}", mbps)
        } else {
            "-1".to_string()
        }
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mbps() {
            Some(mbps) => write!(f, "{:.0} Mbps", mbps),
            None => write!(f, "unlimited"),
        }
    }
}
