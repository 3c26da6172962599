//! Error types for fleetctl.
//!
//! This module defines the error type returned by every fleet operation,
//! providing enough context for the operator to tell a rejected command apart
//! from a failure in the field.

use thiserror::Error;

use crate::dispatch::DispatchFailure;
use crate::state::{FleetOperation, FleetState};
use crate::unit::UnitAddress;

/// The main error type for fleetctl operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Lifecycle Errors ===
    /// The operation is not legal in the current fleet state.
    #[error("cannot {operation} while fleet is {state}")]
    InvalidTransition {
        /// The rejected operation.
        operation: FleetOperation,
        /// The state the fleet was in.
        state: FleetState,
    },

    /// Setup was requested on a fleet that is already set up.
    #[error("fleet is already set up (state: {state})")]
    AlreadySetup {
        /// The state the fleet was in.
        state: FleetState,
    },

    // === Link Errors ===
    /// Opening or closing a unit link failed.
    #[error("link error{}: {message}", unit_suffix(.unit.as_ref()))]
    Link {
        /// The unit whose link failed, when known.
        unit: Option<UnitAddress>,
        /// Description of what went wrong.
        message: String,
    },

    // === Dispatch Errors ===
    /// One or more units failed during a broadcast.
    #[error(transparent)]
    Dispatch(#[from] DispatchFailure),

    // === Registry Errors ===
    /// The address is not part of this fleet.
    #[error("unknown unit: {0}")]
    UnknownUnit(UnitAddress),

    /// The position estimates did not include a unit.
    #[error("no position estimate for unit {0}")]
    MissingEstimate(UnitAddress),

    /// A unit has no controller.
    #[error("no controller for unit {0}")]
    MissingController(UnitAddress),

    /// An argument was out of range.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn unit_suffix(unit: Option<&UnitAddress>) -> String {
    unit.map(|u| format!(" on {u}")).unwrap_or_default()
}

/// A specialized Result type for fleetctl operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a link error for a specific unit.
    #[must_use]
    pub fn link(unit: UnitAddress, message: impl Into<String>) -> Self {
        Self::Link {
            unit: Some(unit),
            message: message.into(),
        }
    }

    /// Create a link error not tied to a single unit.
    #[must_use]
    pub fn link_general(message: impl Into<String>) -> Self {
        Self::Link {
            unit: None,
            message: message.into(),
        }
    }

    /// Create an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Check if this error is a rejected lifecycle operation.
    #[must_use]
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. } | Self::AlreadySetup { .. })
    }

    /// Check if this error is a link failure.
    #[must_use]
    pub fn is_link_error(&self) -> bool {
        matches!(self, Self::Link { .. })
    }

    /// Check if this error came from a failed broadcast.
    #[must_use]
    pub fn is_dispatch_failure(&self) -> bool {
        matches!(self, Self::Dispatch(_))
    }

    /// The dispatch failure carried by this error, if any.
    #[must_use]
    pub fn dispatch_failure(&self) -> Option<&DispatchFailure> {
        match self {
            Self::Dispatch(failure) => Some(failure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let err = Error::InvalidTransition {
            operation: FleetOperation::Cleanup,
            state: FleetState::Airborne,
        };
        assert_eq!(err.to_string(), "cannot cleanup while fleet is airborne");
        assert!(err.is_invalid_transition());
    }

    #[test]
    fn test_already_setup_display() {
        let err = Error::AlreadySetup {
            state: FleetState::Grounded,
        };
        assert!(err.to_string().contains("already set up"));
        assert!(err.is_invalid_transition());
    }

    #[test]
    fn test_link_error_display() {
        let err = Error::link(UnitAddress::from("radio://0/80/2M/E7"), "no ack");
        assert_eq!(err.to_string(), "link error on radio://0/80/2M/E7: no ack");
        assert!(err.is_link_error());

        let err = Error::link_general("driver init failed");
        assert_eq!(err.to_string(), "link error: driver init failed");
    }

    #[test]
    fn test_dispatch_predicates() {
        let err = Error::invalid_argument("boom");
        assert!(!err.is_dispatch_failure());
        assert!(err.dispatch_failure().is_none());
    }

    #[test]
    fn test_registry_error_display() {
        let unit = UnitAddress::from("radio://0/80/2M/E7E7E7E701");
        assert!(Error::UnknownUnit(unit.clone())
            .to_string()
            .contains("unknown unit"));
        assert!(Error::MissingEstimate(unit.clone())
            .to_string()
            .contains("no position estimate"));
        assert!(Error::MissingController(unit)
            .to_string()
            .contains("no controller"));
    }

    #[test]
    fn test_invalid_argument_display() {
        let err = Error::invalid_argument("height must be positive");
        assert_eq!(err.to_string(), "invalid argument: height must be positive");
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }

    #[test]
    fn test_config_validation_error_display() {
        let err = Error::ConfigValidation {
            message: "takeoff_height must be positive".to_string(),
        };
        assert!(err.to_string().contains("takeoff_height"));
    }
}
