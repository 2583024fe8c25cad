// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for Conduit.
//!
//! Explicit enum error types only. No `Box<dyn Error>` and no `anyhow::Result`
//! inside the library; every failure a caller can observe has a variant.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::InstanceId;

/// Top-level error type for the Conduit supervisor.
#[derive(Debug, Error)]
pub enum ConduitError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Flags or Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Psiphon config file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Supervisor Errors
    // =========================================================================
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    // =========================================================================
    // Relay Engine Errors
    // =========================================================================
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Hard validation errors stop startup before any worker is spawned.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("max-clients must be between 1 and {max}, got {value}")]
    MaxClientsOutOfRange { value: i64, max: u32 },

    #[error("bandwidth must be positive (or -1 for unlimited), got {value}")]
    InvalidBandwidth { value: String },

    #[error("instance count must be between 1 and {max}, got {value}")]
    InstanceCountOutOfRange { value: usize, max: usize },
}

/// State transition errors for the per-instance supervisor state machine.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition from {from} to {to} for {instance}")]
    InvalidTransition {
        instance: InstanceId,
        from: &'static str,
        to: &'static str,
    },

    #[error("{instance} is in terminal state: {state}")]
    TerminalState {
        instance: InstanceId,
        state: &'static str,
    },
}

/// Worker lifecycle failures.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to start {instance}: {reason}")]
    SpawnFailed { instance: InstanceId, reason: String },

    #[error("{instance} exited with {status}")]
    WorkerExited { instance: InstanceId, status: String },

    #[error("failed waiting for {instance}: {source}")]
    WaitFailed {
        instance: InstanceId,
        #[source]
        source: std::io::Error,
    },

    #[error("{instance} exceeded max restarts ({max_restarts}): {source}")]
    RetriesExhausted {
        instance: InstanceId,
        max_restarts: u32,
        #[source]
        source: Box<ConduitError>,
    },
}

/// Relay engine failures on the worker side.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no relay engine configured (use --engine or CONDUIT_ENGINE)")]
    NotConfigured,

    #[error("failed to build engine config: {reason}")]
    BundleInvalid { reason: String },

    #[error("failed to spawn relay engine {program}: {reason}")]
    SpawnFailed { program: PathBuf, reason: String },

    #[error("relay engine exited with {status}")]
    Exited { status: String },
}

/// Result type alias using ConduitError.
pub type ConduitResult<T> = Result<T, ConduitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_validation_error_display() {
        let err = HardValidationError::MaxClientsOutOfRange {
            value: 0,
            max: 1000,
        };
        assert!(err.to_string().contains("between 1 and 1000"));
    }

    #[test]
    fn test_error_chain() {
        let spawn_err = SupervisorError::SpawnFailed {
            instance: InstanceId::new(3),
            reason: "No such file or directory".to_string(),
        };
        let err: ConduitError = spawn_err.into();
        assert!(matches!(err, ConduitError::Supervisor(_)));
        assert!(err.to_string().contains("instance-3"));
    }

    #[test]
    fn test_retries_exhausted_keeps_cause() {
        let cause = ConduitError::from(SupervisorError::WorkerExited {
            instance: InstanceId::new(1),
            status: "exit status: 2".to_string(),
        });
        let err = SupervisorError::RetriesExhausted {
            instance: InstanceId::new(1),
            max_restarts: 5,
            source: Box::new(cause),
        };
        let message = err.to_string();
        assert!(message.starts_with("instance-1 exceeded max restarts (5)"));
        assert!(message.contains("exit status: 2"));
    }
}
