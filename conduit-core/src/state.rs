// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Worker supervisor state machine with typed state transitions.
//!
//! Implements the per-instance lifecycle:
//! Starting → Running → ExitedCrashed → Backoff → Starting, ending in
//! ExitedClean (shutdown requested) or GivenUp (restart ceiling reached).
//! Invalid transitions result in StateTransitionError.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::InstanceId;

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
    /// About to spawn a worker.
    Starting,

    /// Worker process is alive with its output scrapers attached.
    Running,

    /// Worker ended because shutdown was requested. Terminal.
    ExitedClean,

    /// Worker ended (or failed to start) with no shutdown pending.
    ExitedCrashed,

    /// Waiting out the fixed delay before the next attempt.
    Backoff,

    /// Restart ceiling reached. Terminal.
    GivenUp,
}

impl SupervisorState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::ExitedClean => "ExitedClean",
            Self::ExitedCrashed => "ExitedCrashed",
            Self::Backoff => "Backoff",
            Self::GivenUp => "GivenUp",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::ExitedClean | Self::GivenUp)
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: SupervisorState) -> bool {
        matches!(
            (self, target),
            // From Starting
            (Self::Starting, Self::Running) |
            (Self::Starting, Self::ExitedCrashed) |
            (Self::Starting, Self::ExitedClean) |
            // From Running
            (Self::Running, Self::ExitedClean) |
            (Self::Running, Self::ExitedCrashed) |
            // From ExitedCrashed
            (Self::ExitedCrashed, Self::Backoff) |
            (Self::ExitedCrashed, Self::GivenUp) |
            // From Backoff
            (Self::Backoff, Self::Starting) |
            (Self::Backoff, Self::ExitedClean)
        )
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for one worker slot.
/// Enforces valid state transitions and owns the restart counter.
#[derive(Debug)]
pub struct SupervisorStateMachine {
    instance: InstanceId,
    current_state: SupervisorState,
    last_transition: Instant,
    restart_count: u32,
}

impl SupervisorStateMachine {
    pub fn new(instance: InstanceId) -> Self {
        Self {
            instance,
            current_state: SupervisorState::Starting,
            last_transition: Instant::now(),
            restart_count: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.current_state
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Get time since last transition.
    pub fn time_in_current_state(&self) -> std::time::Duration {
        self.last_transition.elapsed()
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Count one more crash. Never reset.
    pub fn record_restart(&mut self) -> u32 {
        self.restart_count += 1;
        self.restart_count
    }

    pub fn retries_exhausted(&self, max_restarts: u32) -> bool {
        self.restart_count >= max_restarts
    }

    /// Attempt to transition to a new state.
    /// Returns Ok(()) if successful, or StateTransitionError if invalid.
    pub fn transition_to(&mut self, target: SupervisorState) -> Result<(), StateTransitionError> {
        if self.current_state.is_terminal() {
            return Err(StateTransitionError::TerminalState {
                instance: self.instance,
                state: self.current_state.name(),
            });
        }
        if !self.current_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                instance: self.instance,
                from: self.current_state.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            instance = %self.instance,
            from = self.current_state.name(),
            to = target.name(),
            "State transition"
        );

        self.current_state = target;
        self.last_transition = Instant::now();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> SupervisorStateMachine {
        SupervisorStateMachine::new(InstanceId::new(0))
    }

    #[test]
    fn test_initial_state() {
        let sm = machine();
        assert_eq!(sm.state(), SupervisorState::Starting);
        assert_eq!(sm.restart_count(), 0);
    }

    #[test]
    fn test_crash_restart_cycle() {
        let mut sm = machine();

        assert!(sm.transition_to(SupervisorState::Running).is_ok());
        assert!(sm.transition_to(SupervisorState::ExitedCrashed).is_ok());
        assert_eq!(sm.record_restart(), 1);
        assert!(sm.transition_to(SupervisorState::Backoff).is_ok());
        assert!(sm.transition_to(SupervisorState::Starting).is_ok());
        assert_eq!(sm.state(), SupervisorState::Starting);
    }

    #[test]
    fn test_spawn_failure_is_a_crash() {
        let mut sm = machine();
        assert!(sm.transition_to(SupervisorState::ExitedCrashed).is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = machine();

        // Starting → Backoff (invalid)
        assert!(sm.transition_to(SupervisorState::Backoff).is_err());
        assert_eq!(sm.state(), SupervisorState::Starting);

        sm.transition_to(SupervisorState::Running).unwrap();
        // Running → GivenUp skips crash classification
        assert!(sm.transition_to(SupervisorState::GivenUp).is_err());
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let mut sm = machine();
        sm.transition_to(SupervisorState::Running).unwrap();
        sm.transition_to(SupervisorState::ExitedClean).unwrap();

        let err = sm.transition_to(SupervisorState::Starting).unwrap_err();
        assert!(matches!(err, StateTransitionError::TerminalState { .. }));

        let mut sm = machine();
        sm.transition_to(SupervisorState::ExitedCrashed).unwrap();
        sm.transition_to(SupervisorState::GivenUp).unwrap();
        assert!(sm.state().is_terminal());
        assert!(sm.transition_to(SupervisorState::Backoff).is_err());
    }

    #[test]
    fn test_transition_resets_state_clock() {
        let mut sm = SupervisorStateMachine::new(InstanceId::new(0));
        std::thread::sleep(std::time::Duration::from_millis(20));
        let before = sm.time_in_current_state();
        assert!(before >= std::time::Duration::from_millis(20));

        sm.transition_to(SupervisorState::Running).unwrap();
        assert!(sm.time_in_current_state() < before);
    }

    #[test]
    fn test_retries_exhausted() {
        let mut sm = machine();
        for _ in 0..4 {
            sm.record_restart();
        }
        assert!(!sm.retries_exhausted(5));
        sm.record_restart();
        assert!(sm.retries_exhausted(5));
    }
}
