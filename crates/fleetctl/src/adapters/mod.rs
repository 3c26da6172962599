//! Backend adapters.
//!
//! - **Dry run**: every collaborator is a no-op. Selected once, when a
//!   [`crate::FleetController`] is built with `dry_run` set, so the controller
//!   itself never branches on the flag.
//!
//! - **Loopback**: an in-process fleet of virtual units that accept the same
//!   commands a radio-linked fleet would. Units jump to their targets after a
//!   fixed latency; there is no flight model.
//!
//! # Example
//!
//! ```
//! use fleetctl::adapters::loopback::LoopbackFleet;
//! use fleetctl::{FleetBackend, Position, UnitAddress};
//!
//! let fleet = LoopbackFleet::builder()
//!     .unit(UnitAddress::from("radio://0/80/2M/E7E7E7E701"), Position::new(0.0, 0.0, 0.0))
//!     .build();
//! let backend: FleetBackend = fleet.backend();
//! assert!(fleet.journal().is_empty());
//! # let _ = backend;
//! ```

pub mod dry_run;
pub mod loopback;

pub use dry_run::{DryRunController, DryRunEstimator, DryRunFactory, DryRunLink, DryRunPool};
pub use loopback::{
    LoopbackCommand, LoopbackController, LoopbackEvent, LoopbackFault, LoopbackFleet,
    LoopbackFleetBuilder, LoopbackLink,
};
