//! Link lifecycle state machine for the router/transport bring-up.
//!
//! State transitions:
//! UNINITIALIZED → INITIALIZING → READY
//!                       ↓
//!                    FAILED → INITIALIZING (retry)
//!
//! READY is terminal for the lifetime of the process; the link is never
//! torn down during normal operation.

use crate::error::{TelemetryError, TelemetryResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of the dispatch link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    /// No bring-up attempted yet.
    #[default]
    Uninitialized,
    /// Endpoints and transport side are being registered.
    Initializing,
    /// Router created, side attached, start time recorded.
    Ready,
    /// Last bring-up attempt failed; a retry is permitted.
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "UNINITIALIZED"),
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Ready => write!(f, "READY"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl LinkState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: LinkState) -> bool {
        use LinkState::{Failed, Initializing, Ready, Uninitialized};

        matches!(
            (self, target),
            (Uninitialized, Initializing)
                | (Initializing, Ready)
                | (Initializing, Failed)
                // Retry after a failed bring-up
                | (Failed, Initializing)
        )
    }

    /// Returns true once the link may carry traffic.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns true if a bring-up attempt may start from this state.
    #[must_use]
    pub fn can_attempt(&self) -> bool {
        matches!(self, Self::Uninitialized | Self::Failed)
    }
}

/// State machine wrapper tracking transitions and failed attempts.
#[derive(Debug, Clone, Default)]
pub struct LinkStateMachine {
    current: LinkState,
    previous: Option<LinkState>,
    transition_count: u64,
    failed_attempts: u32,
}

impl LinkStateMachine {
    /// Create a new state machine starting in UNINITIALIZED.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<LinkState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Number of bring-up attempts that ended in FAILED.
    #[must_use]
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Attempt a state transition.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidStateTransition`] if `target` is not
    /// reachable from the current state.
    pub fn transition(&mut self, target: LinkState) -> TelemetryResult<()> {
        if !self.current.can_transition_to(target) {
            return Err(TelemetryError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            });
        }

        if target == LinkState::Failed {
            self.failed_attempts = self.failed_attempts.saturating_add(1);
        }
        self.previous = Some(self.current);
        self.current = target;
        self.transition_count += 1;
        tracing::trace!(from = ?self.previous, to = %self.current, "link state transition");
        Ok(())
    }
}
