//! Fleet lifecycle state machine.
//!
//! The fleet is always in exactly one [`FleetState`]. Collective operations
//! are only legal from specific states; the legal moves are listed in a single
//! transition table and every other combination is rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle state of the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetState {
    /// Links closed, registries empty.
    #[default]
    Uninitialized,
    /// Set up and on the ground.
    Grounded,
    /// Set up and in the air.
    Airborne,
}

impl fmt::Display for FleetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Grounded => write!(f, "grounded"),
            Self::Airborne => write!(f, "airborne"),
        }
    }
}

/// Operations gated by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetOperation {
    /// Open links and build registries.
    Setup,
    /// Take every unit off the ground.
    Takeoff,
    /// Bring every unit down.
    Land,
    /// Close links and drop registries.
    Cleanup,
    /// Move every unit to a common height.
    SetHeight,
    /// Move a single unit.
    SetPosition,
}

impl fmt::Display for FleetOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Takeoff => write!(f, "takeoff"),
            Self::Land => write!(f, "land"),
            Self::Cleanup => write!(f, "cleanup"),
            Self::SetHeight => write!(f, "set_height"),
            Self::SetPosition => write!(f, "set_position"),
        }
    }
}

impl FleetState {
    /// Look up the state reached by applying `operation` from `self`.
    ///
    /// Returns `None` when the pair is not in the transition table.
    #[must_use]
    pub fn next(self, operation: FleetOperation) -> Option<FleetState> {
        use FleetOperation as Op;
        use FleetState as S;

        match (self, operation) {
            (S::Uninitialized, Op::Setup) => Some(S::Grounded),
            (S::Grounded, Op::Takeoff) => Some(S::Airborne),
            (S::Airborne, Op::Land) => Some(S::Grounded),
            (S::Grounded, Op::Cleanup) => Some(S::Uninitialized),
            (S::Airborne, Op::SetHeight | Op::SetPosition) => Some(S::Airborne),
            _ => None,
        }
    }

    /// Check whether `operation` is legal from this state.
    #[must_use]
    pub fn permits(self, operation: FleetOperation) -> bool {
        self.next(operation).is_some()
    }
}

/// Owner of the current [`FleetState`].
///
/// The only way to change the state is [`FleetStateMachine::advance`], which
/// consults the transition table.
#[derive(Debug, Default)]
pub struct FleetStateMachine {
    state: FleetState,
}

impl FleetStateMachine {
    /// Create a machine in the `Uninitialized` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> FleetState {
        self.state
    }

    /// Check that `operation` is legal without changing anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadySetup`] for a setup outside `Uninitialized`,
    /// and [`Error::InvalidTransition`] for any other illegal operation.
    pub fn check(&self, operation: FleetOperation) -> Result<FleetState> {
        match self.state.next(operation) {
            Some(next) => Ok(next),
            None if operation == FleetOperation::Setup => Err(Error::AlreadySetup {
                state: self.state,
            }),
            None => Err(Error::InvalidTransition {
                operation,
                state: self.state,
            }),
        }
    }

    /// Apply `operation`, moving to the next state.
    ///
    /// # Errors
    ///
    /// Same as [`FleetStateMachine::check`]; on error the state is unchanged.
    pub fn advance(&mut self, operation: FleetOperation) -> Result<FleetState> {
        let next = self.check(operation)?;
        self.state = next;
        Ok(next)
    }
}
