//! Engine lifecycle state machine.
//!
//! State transitions:
//! IDLE → STARTING → RUNNING → STOPPING → STOPPED
//!
//! A failed startup goes STARTING → FAILED after every acquired resource
//! has been rolled back. A stopped engine can be started again.

use crate::error::{RegError, RegResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of the regulation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    /// Constructed, nothing acquired.
    #[default]
    Idle,
    /// Acquiring counters, workers and timers.
    Starting,
    /// Timers armed, regulation active.
    Running,
    /// Shutdown flag set; timers and workers being torn down.
    Stopping,
    /// Every resource released.
    Stopped,
    /// Startup aborted and rolled back.
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl EngineState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: EngineState) -> bool {
        use EngineState::{Failed, Idle, Running, Starting, Stopped, Stopping};

        matches!(
            (self, target),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Stopping, Stopped)
                // Restart
                | (Stopped, Starting)
                | (Failed, Starting)
        )
    }

    /// Returns true while timers may fire.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

}

/// State machine wrapper counting transitions.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: EngineState,
    transition_count: u64,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a new state machine starting in IDLE.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: EngineState::Idle,
            transition_count: 0,
        }
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.current
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a state transition.
    ///
    /// # Errors
    ///
    /// Returns [`RegError::InvalidStateTransition`] if `target` is not reachable.
    pub fn transition(&mut self, target: EngineState) -> RegResult<()> {
        if self.current.can_transition_to(target) {
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            Err(RegError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }
}
