// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Instance sizing.
//!
//! One worker serves up to `clients_per_instance` clients:
//! instances = clamp(floor(max_clients / clients_per_instance), min, max)

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;
use crate::types::{Bandwidth, MaxClients};

/// Clients one worker is sized for.
pub const CLIENTS_PER_INSTANCE: u32 = 50;

/// Upper bound on concurrently supervised workers.
pub const MAX_INSTANCES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancePolicy {
    pub min_instances: usize,
    pub max_instances: usize,
    pub clients_per_instance: u32,
}

impl Default for InstancePolicy {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: MAX_INSTANCES,
            clients_per_instance: CLIENTS_PER_INSTANCE,
        }
    }
}

impl InstancePolicy {
    /// Instance count implied by a client quota.
    pub fn calculate_instances(&self, max_clients: MaxClients) -> usize {
        let desired = (max_clients.value() / self.clients_per_instance.max(1)) as usize;
        desired.clamp(self.min_instances, self.max_instances)
    }

    /// Use `requested` when given, after bounds checking, else the computed count.
    pub fn resolve(
        &self,
        max_clients: MaxClients,
        requested: Option<usize>,
    ) -> Result<usize, HardValidationError> {
        match requested {
            Some(n) if n < self.min_instances || n > self.max_instances => {
                Err(HardValidationError::InstanceCountOutOfRange {
                    value: n,
                    max: self.max_instances,
                })
            }
            Some(n) => Ok(n),
            None => Ok(self.calculate_instances(max_clients)),
        }
    }
}

/// Instance count for `max_clients` under the default policy.
pub fn calculate_instances(max_clients: MaxClients) -> usize {
    InstancePolicy::default().calculate_instances(max_clients)
}

/// How the totals are split across workers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstancePlan {
    pub instances: usize,
    pub clients_per_instance: u32,
    /// Per-worker share in Mbps, or [`crate::types::UNLIMITED_MBPS`].
    pub bandwidth_per_instance_mbps: f64,
}

impl InstancePlan {
    pub fn new(instances: usize, max_clients: MaxClients, bandwidth: Bandwidth) -> Self {
        let instances = instances.max(1);
        Self {
            instances,
            clients_per_instance: max_clients.per_instance(instances),
            bandwidth_per_instance_mbps: bandwidth.per_instance_mbps(instances),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bandwidth_per_instance_mbps <= 0.0
    }

    /// `"10 Mbps/instance"` or `"unlimited"`.
    pub fn bandwidth_label(&self) -> String {
        if self.is_unlimited() {
            "unlimited".to_string()
        } else {
            format!("{:.0} Mbps/instance", self.bandwidth_per_instance_mbps)
        }
    }
}
