//! Collaborator contracts consumed by the fleet controller.
//!
//! The controller never talks to radios, estimators or flight controllers
//! directly. It goes through the narrow traits defined here, which a hardware
//! stack, the loopback backend or the dry-run adapter implement.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;
use crate::unit::{Position, UnitAddress};

/// Errors reported by a single unit while executing a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    /// The unit refused or failed the command.
    #[error("command rejected: {0}")]
    Rejected(String),

    /// The link to the unit dropped while the command was in flight.
    #[error("link lost: {0}")]
    LinkLost(String),

    /// The unit is not ready to accept commands.
    #[error("unit not ready: {0}")]
    NotReady(String),
}

impl UnitError {
    /// Create a rejected-command error.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    /// Create a lost-link error.
    #[must_use]
    pub fn link_lost(message: impl Into<String>) -> Self {
        Self::LinkLost(message.into())
    }

    /// Create a not-ready error.
    #[must_use]
    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::NotReady(message.into())
    }

    /// Whether retrying the same command may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LinkLost(_) | Self::NotReady(_))
    }
}

/// Result type for per-unit collaborator calls.
pub type UnitResult<T> = std::result::Result<T, UnitError>;

/// Low-level position controller running on each unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    /// Cascaded PID position controller.
    #[default]
    Pid,
    /// Mellinger geometric controller.
    Mellinger,
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pid => write!(f, "pid"),
            Self::Mellinger => write!(f, "mellinger"),
        }
    }
}

/// Fixed profile handed to the controller factory for every unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerProfile {
    /// Which on-board controller to select.
    pub kind: ControllerKind,
    /// Velocity used for moves, in m/s.
    pub default_velocity: f64,
    /// Height used when a command does not specify one, in meters.
    pub default_height: f64,
}

impl Default for ControllerProfile {
    fn default() -> Self {
        Self {
            kind: ControllerKind::Pid,
            default_velocity: 0.3,
            default_height: 0.5,
        }
    }
}

/// An open link to one unit.
pub trait UnitLink: Send + Sync + fmt::Debug {
    /// The address of the unit at the other end of this link.
    fn address(&self) -> &UnitAddress;
}

/// Owner of the set of unit links.
#[async_trait::async_trait]
pub trait ConnectionPool: Send + Sync + fmt::Debug {
    /// Open a link to every unit in `units`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Link`] if any link cannot be opened.
    async fn open_links(&self, units: &[UnitAddress]) -> Result<()>;

    /// Close every open link.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Link`] if a link cannot be closed cleanly.
    async fn close_links(&self) -> Result<()>;

    /// Get the open link for `unit`, if any.
    fn link(&self, unit: &UnitAddress) -> Option<Arc<dyn UnitLink>>;

    /// Current best position estimate for every unit with an open link.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Link`] if the estimates cannot be read.
    async fn estimated_positions(&self) -> Result<BTreeMap<UnitAddress, Position>>;
}

/// Readiness probe for a unit's on-board position estimator.
#[async_trait::async_trait]
pub trait PositionEstimator: Send + Sync + fmt::Debug {
    /// Wait until the estimator on `link`'s unit has converged.
    ///
    /// # Errors
    ///
    /// Returns an error if the unit cannot report convergence.
    async fn wait_until_ready(&self, link: Arc<dyn UnitLink>) -> UnitResult<()>;
}

/// Per-unit motion commands.
#[async_trait::async_trait]
pub trait UnitController: Send + Sync + fmt::Debug {
    /// Fly to an absolute position.
    async fn move_to(&self, target: Position) -> UnitResult<()>;

    /// Take off to `height` meters above the current position.
    async fn take_off(&self, height: f64) -> UnitResult<()>;

    /// Land at the current horizontal position.
    async fn land(&self) -> UnitResult<()>;
}

/// Builds a [`UnitController`] for one unit.
#[async_trait::async_trait]
pub trait UnitControllerFactory: Send + Sync + fmt::Debug {
    /// Create a controller seeded with the unit's `initial` position.
    async fn create(
        &self,
        link: Arc<dyn UnitLink>,
        initial: Position,
        profile: &ControllerProfile,
    ) -> UnitResult<Arc<dyn UnitController>>;
}

/// The three collaborators a fleet controller needs, bundled together.
#[derive(Debug, Clone)]
pub struct FleetBackend {
    /// Link management and position estimates.
    pub pool: Arc<dyn ConnectionPool>,
    /// Estimator readiness probe.
    pub estimator: Arc<dyn PositionEstimator>,
    /// Controller construction.
    pub factory: Arc<dyn UnitControllerFactory>,
}

impl FleetBackend {
    /// Bundle a backend from its parts.
    #[must_use]
    pub fn new(
        pool: Arc<dyn ConnectionPool>,
        estimator: Arc<dyn PositionEstimator>,
        factory: Arc<dyn UnitControllerFactory>,
    ) -> Self {
        Self {
            pool,
            estimator,
            factory,
        }
    }

    /// Use a single value that implements all three contracts.
    #[must_use]
    pub fn from_shared<B>(backend: Arc<B>) -> Self
    where
        B: ConnectionPool + PositionEstimator + UnitControllerFactory + 'static,
    {
        Self {
            pool: Arc::clone(&backend) as Arc<dyn ConnectionPool>,
            estimator: Arc::clone(&backend) as Arc<dyn PositionEstimator>,
            factory: backend,
        }
    }
}
