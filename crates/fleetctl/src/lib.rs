//! `fleetctl` - Fleet controller for small swarms of flying robots
//!
//! This library gives an operator a single control surface over a fleet of
//! independently addressed units: it brings the fleet up, commands collective
//! and per-unit motion, and brings it down again. Radio links, position
//! estimation and the on-board flight controllers stay behind the narrow
//! traits in [`backend`].

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod backend;
pub mod cli;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod mission;
pub mod registry;
pub mod state;
pub mod unit;

pub use backend::{ControllerKind, ControllerProfile, FleetBackend, UnitError};
pub use config::Config;
pub use controller::{FleetController, FleetOptions, FleetStatus};
pub use dispatch::{DispatchFailure, DispatchPolicy};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use mission::{run_mission, MissionReport, MissionStep};
pub use state::{FleetOperation, FleetState};
pub use unit::{Position, UnitAddress};
