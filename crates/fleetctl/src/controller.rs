//! The fleet controller façade.
//!
//! [`FleetController`] is the only entry point an operator needs. It owns the
//! lifecycle state machine and both registries, and drives the backend through
//! the dispatcher. Every mutating operation takes `&mut self`, so operations
//! on one fleet are strictly sequential while the per-unit work inside each
//! broadcast runs in parallel.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{ControllerProfile, FleetBackend, UnitController, UnitLink};
use crate::config::Config;
use crate::dispatch::{Args, DispatchPolicy, Dispatcher};
use crate::error::{Error, Result};
use crate::registry::{ControllerRegistry, PositionRegistry};
use crate::state::{FleetOperation, FleetState, FleetStateMachine};
use crate::unit::{Position, UnitAddress};

/// Runtime options for a [`FleetController`].
#[derive(Debug, Clone, PartialEq)]
pub struct FleetOptions {
    /// Swap the backend for no-op adapters.
    pub dry_run: bool,
    /// Height used by [`FleetController::takeoff_default`].
    pub takeoff_height: f64,
    /// Pause after take-off before the fleet counts as airborne.
    pub settle_delay: Duration,
    /// Profile handed to the controller factory.
    pub profile: ControllerProfile,
    /// Timeout and retry policy for motion commands.
    pub policy: DispatchPolicy,
    /// Per-unit timeout for the estimator readiness probe.
    pub estimator_timeout: Duration,
    /// Timeout for opening links, closing links and reading estimates.
    pub link_timeout: Duration,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for FleetOptions {
    fn from(config: &Config) -> Self {
        Self {
            dry_run: config.fleet.dry_run,
            takeoff_height: config.flight.takeoff_height,
            settle_delay: config.settle_delay(),
            profile: config.controller_profile(),
            policy: config.dispatch_policy(),
            estimator_timeout: config.estimator_timeout(),
            link_timeout: config.link_timeout(),
        }
    }
}

/// Snapshot of one unit, as reported by [`FleetController::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    /// The unit.
    pub address: UnitAddress,
    /// Last recorded position, if the fleet is set up.
    pub position: Option<Position>,
    /// Whether a controller exists for the unit.
    pub has_controller: bool,
}

/// Serializable snapshot of the whole fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetStatus {
    /// Lifecycle state.
    pub state: FleetState,
    /// Whether the controller runs against no-op adapters.
    pub dry_run: bool,
    /// Per-unit detail, in address order.
    pub units: Vec<UnitStatus>,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

/// Coordinates a fleet of units through its lifecycle.
#[derive(Debug)]
pub struct FleetController {
    units: Vec<UnitAddress>,
    backend: FleetBackend,
    options: FleetOptions,
    dispatcher: Dispatcher,
    machine: FleetStateMachine,
    positions: PositionRegistry,
    controllers: ControllerRegistry,
}

impl FleetController {
    /// Create a controller for `units`.
    ///
    /// Duplicate addresses are collapsed. With `options.dry_run` set, the
    /// supplied backend is discarded in favor of [`FleetBackend::dry_run`]
    /// and the settle delay is dropped.
    #[must_use]
    pub fn new(
        units: impl IntoIterator<Item = UnitAddress>,
        backend: FleetBackend,
        mut options: FleetOptions,
    ) -> Self {
        let mut units: Vec<UnitAddress> = units.into_iter().collect();
        units.sort();
        units.dedup();

        let backend = if options.dry_run {
            options.settle_delay = Duration::ZERO;
            FleetBackend::dry_run(units.iter().cloned())
        } else {
            backend
        };

        Self {
            units,
            backend,
            dispatcher: Dispatcher::new(options.policy),
            options,
            machine: FleetStateMachine::new(),
            positions: PositionRegistry::new(),
            controllers: ControllerRegistry::new(),
        }
    }

    /// Create a controller for the fleet described by `config`.
    #[must_use]
    pub fn from_config(config: &Config, backend: FleetBackend) -> Self {
        Self::new(config.fleet.units.iter().cloned(), backend, FleetOptions::from(config))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> FleetState {
        self.machine.state()
    }

    /// Whether this controller runs against no-op adapters.
    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        self.options.dry_run
    }

    /// The fleet's units, in address order.
    #[must_use]
    pub fn units(&self) -> &[UnitAddress] {
        &self.units
    }

    /// The options this controller was built with.
    #[must_use]
    pub fn options(&self) -> &FleetOptions {
        &self.options
    }

    /// Last recorded position of every unit.
    #[must_use]
    pub fn positions(&self) -> &PositionRegistry {
        &self.positions
    }

    /// Controller of every unit.
    #[must_use]
    pub fn controllers(&self) -> &ControllerRegistry {
        &self.controllers
    }

    /// Last recorded position of one unit.
    #[must_use]
    pub fn position(&self, unit: &UnitAddress) -> Option<Position> {
        self.positions.get(unit)
    }

    /// Take a serializable snapshot of the fleet.
    #[must_use]
    pub fn status(&self) -> FleetStatus {
        FleetStatus {
            state: self.state(),
            dry_run: self.is_dry_run(),
            units: self
                .units
                .iter()
                .map(|unit| UnitStatus {
                    address: unit.clone(),
                    position: self.positions.get(unit),
                    has_controller: self.controllers.contains(unit),
                })
                .collect(),
            timestamp: Utc::now(),
        }
    }

    /// Open links, record initial positions and build a controller per unit.
    ///
    /// On failure the registries are cleared, links are closed best-effort
    /// and the fleet stays `Uninitialized`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadySetup`] unless the fleet is `Uninitialized`,
    /// or the first error hit while bringing the fleet up.
    pub async fn setup(&mut self) -> Result<()> {
        self.check(FleetOperation::Setup)?;
        info!(units = self.units.len(), dry_run = self.is_dry_run(), "Setting up fleet");

        let opened = with_link_timeout(
            self.options.link_timeout,
            "open_links",
            self.backend.pool.open_links(&self.units),
        )
        .await;
        if let Err(err) = opened {
            warn!(error = %err, "Failed to open unit links");
            self.abort_setup().await;
            return Err(err);
        }

        if let Err(err) = self.populate_registries().await {
            warn!(error = %err, "Fleet setup failed");
            self.abort_setup().await;
            return Err(err);
        }

        let state = self.machine.advance(FleetOperation::Setup)?;
        info!(%state, units = self.positions.len(), "Fleet set up");
        Ok(())
    }

    async fn populate_registries(&mut self) -> Result<()> {
        let links = self.unit_links()?;

        let estimator = Arc::clone(&self.backend.estimator);
        self.dispatcher
            .with_timeout(self.options.estimator_timeout)
            .broadcast_uniform("wait_for_estimator", links.clone(), move |link| {
                let estimator = Arc::clone(&estimator);
                async move { estimator.wait_until_ready(link).await }
            })
            .await?;

        let estimates = with_link_timeout(
            self.options.link_timeout,
            "estimated_positions",
            self.backend.pool.estimated_positions(),
        )
        .await?;
        for unit in &self.units {
            let position = estimates
                .get(unit)
                .copied()
                .ok_or_else(|| Error::MissingEstimate(unit.clone()))?;
            debug!(unit = %unit, %position, "Recorded initial position");
            self.positions.record_estimate(unit.clone(), position);
        }

        let seeded: BTreeMap<UnitAddress, (Arc<dyn UnitLink>, Position)> = links
            .into_iter()
            .filter_map(|(unit, link)| {
                let position = self.positions.get(&unit)?;
                Some((unit, (link, position)))
            })
            .collect();

        let factory = Arc::clone(&self.backend.factory);
        let profile = self.options.profile.clone();
        let created = self
            .dispatcher
            .broadcast_uniform("create_controller", seeded, move |(link, initial)| {
                let factory = Arc::clone(&factory);
                let profile = profile.clone();
                async move { factory.create(link, initial, &profile).await }
            })
            .await?;

        for (unit, controller) in created {
            self.controllers.insert(&self.positions, unit, controller)?;
        }
        Ok(())
    }

    fn unit_links(&self) -> Result<BTreeMap<UnitAddress, Arc<dyn UnitLink>>> {
        self.units
            .iter()
            .map(|unit| {
                self.backend
                    .pool
                    .link(unit)
                    .map(|link| (unit.clone(), link))
                    .ok_or_else(|| Error::link(unit.clone(), "no open link after open_links"))
            })
            .collect()
    }

    async fn abort_setup(&mut self) {
        self.positions.clear();
        self.controllers.clear();
        let closed = with_link_timeout(
            self.options.link_timeout,
            "close_links",
            self.backend.pool.close_links(),
        )
        .await;
        if let Err(err) = closed {
            warn!(error = %err, "Failed to close links after aborted setup");
        }
    }

    /// Close links and drop both registries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the fleet is `Grounded`, or
    /// [`Error::Link`] if the links cannot be closed in time. The fleet is
    /// unchanged in both cases.
    pub async fn cleanup(&mut self) -> Result<()> {
        self.check(FleetOperation::Cleanup)?;

        let closed = with_link_timeout(
            self.options.link_timeout,
            "close_links",
            self.backend.pool.close_links(),
        )
        .await;
        if let Err(err) = closed {
            warn!(error = %err, "Cleanup aborted");
            return Err(err);
        }

        self.positions.clear();
        self.controllers.clear();
        let state = self.machine.advance(FleetOperation::Cleanup)?;
        info!(%state, "Fleet cleaned up");
        Ok(())
    }

    /// Take off to the configured default height.
    ///
    /// # Errors
    ///
    /// Same as [`FleetController::takeoff`].
    pub async fn takeoff_default(&mut self) -> Result<()> {
        self.takeoff(self.options.takeoff_height).await
    }

    /// Take every unit off to `height` meters.
    ///
    /// If some units fail, the ones that did lift off are landed again
    /// before the error is returned, so a fleet left `Grounded` has nothing
    /// in the air.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the fleet is `Grounded`,
    /// [`Error::InvalidArgument`] for a non-positive height,
    /// [`Error::MissingController`] if a unit has no controller, or
    /// [`Error::Dispatch`] if any unit fails to take off.
    pub async fn takeoff(&mut self, height: f64) -> Result<()> {
        self.check(FleetOperation::Takeoff)?;
        validate_height(height)?;
        if let Some(unit) = self.controllers.first_uncovered(&self.positions) {
            return Err(Error::MissingController(unit.clone()));
        }

        info!(height, units = self.controllers.len(), "Taking off");
        let outcome = self
            .dispatcher
            .broadcast_keyed(
                "take_off",
                self.controllers.snapshot(),
                Args::Shared(height),
                |controller, height| async move { controller.take_off(height).await },
            )
            .await;
        if let Err(failure) = outcome {
            self.land_lifted(&failure.completed).await;
            return Err(failure.into());
        }

        if !self.options.settle_delay.is_zero() {
            debug!(
                delay_ms = duration_ms(self.options.settle_delay),
                "Waiting for units to settle"
            );
            tokio::time::sleep(self.options.settle_delay).await;
        }

        self.record_height(height)?;
        let state = self.machine.advance(FleetOperation::Takeoff)?;
        info!(%state, "Fleet airborne");
        Ok(())
    }

    /// Best-effort landing of the units that lifted off during a failed
    /// take-off.
    async fn land_lifted(&self, lifted: &[UnitAddress]) {
        if lifted.is_empty() {
            return;
        }

        let targets: BTreeMap<UnitAddress, Arc<dyn UnitController>> = self
            .controllers
            .snapshot()
            .into_iter()
            .filter(|(unit, _)| lifted.contains(unit))
            .collect();
        warn!(units = targets.len(), "Take-off failed, landing units already in the air");
        if let Err(failure) = self
            .dispatcher
            .broadcast_uniform("land", targets, |controller| async move {
                controller.land().await
            })
            .await
        {
            warn!(error = %failure, "Failed to land units after aborted take-off");
        }
    }

    /// Land every unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the fleet is `Airborne`, or
    /// [`Error::Dispatch`] if any unit fails to land.
    pub async fn land(&mut self) -> Result<()> {
        self.check(FleetOperation::Land)?;

        info!(units = self.controllers.len(), "Landing");
        self.dispatcher
            .broadcast_uniform("land", self.controllers.snapshot(), |controller| async move {
                controller.land().await
            })
            .await?;

        self.record_height(0.0)?;
        let state = self.machine.advance(FleetOperation::Land)?;
        info!(%state, "Fleet landed");
        Ok(())
    }

    /// Move a single unit to `position`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the fleet is `Airborne`,
    /// [`Error::UnknownUnit`] if `unit` is not part of the fleet,
    /// [`Error::InvalidArgument`] for a non-finite position, or
    /// [`Error::Dispatch`] if the move fails.
    pub async fn set_position(&mut self, unit: &UnitAddress, position: Position) -> Result<()> {
        self.check(FleetOperation::SetPosition)?;
        if !position.is_finite() {
            return Err(Error::invalid_argument(format!(
                "position {position} is not finite"
            )));
        }
        if !self.positions.contains(unit) {
            warn!(unit = %unit, "Move requested for unknown unit");
            return Err(Error::UnknownUnit(unit.clone()));
        }
        let controller = self
            .controllers
            .get(unit)
            .ok_or_else(|| Error::MissingController(unit.clone()))?;

        debug!(unit = %unit, %position, "Moving unit");
        self.dispatcher
            .broadcast_keyed(
                "move_to",
                BTreeMap::from([(unit.clone(), controller)]),
                Args::Shared(position),
                |controller, target| async move { controller.move_to(target).await },
            )
            .await?;

        self.positions.update_position(unit, position)?;
        self.machine.advance(FleetOperation::SetPosition)?;
        Ok(())
    }

    /// Move every unit to `height` meters, keeping its horizontal position.
    ///
    /// If some units fail, the ones that did move still have their new
    /// position recorded before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the fleet is `Airborne`,
    /// [`Error::InvalidArgument`] for a non-positive height, or
    /// [`Error::Dispatch`] if any unit fails to move.
    pub async fn set_height(&mut self, height: f64) -> Result<()> {
        self.check(FleetOperation::SetHeight)?;
        validate_height(height)?;

        let targets: BTreeMap<UnitAddress, Position> = self
            .positions
            .iter()
            .map(|(unit, position)| (unit.clone(), position.with_z(height)))
            .collect();

        info!(height, units = targets.len(), "Changing fleet height");
        let outcome = self
            .dispatcher
            .broadcast_keyed(
                "set_height",
                self.controllers.snapshot(),
                Args::PerUnit(targets.clone()),
                |controller, target| async move { controller.move_to(target).await },
            )
            .await;

        let moved: Vec<UnitAddress> = match &outcome {
            Ok(results) => results.keys().cloned().collect(),
            Err(failure) => failure.completed.clone(),
        };
        for unit in moved {
            if let Some(target) = targets.get(&unit) {
                self.positions.update_position(&unit, *target)?;
            }
        }

        outcome?;
        self.machine.advance(FleetOperation::SetHeight)?;
        Ok(())
    }

    fn check(&self, operation: FleetOperation) -> Result<FleetState> {
        self.machine.check(operation).map_err(|err| {
            warn!(%operation, state = %self.state(), "Rejected fleet operation");
            err
        })
    }

    fn record_height(&mut self, height: f64) -> Result<()> {
        let updated: Vec<(UnitAddress, Position)> = self
            .positions
            .iter()
            .map(|(unit, position)| (unit.clone(), position.with_z(height)))
            .collect();
        for (unit, position) in updated {
            self.positions.update_position(&unit, position)?;
        }
        Ok(())
    }
}

fn validate_height(height: f64) -> Result<()> {
    if height.is_finite() && height > 0.0 {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "height must be a positive number of meters (got {height})"
        )))
    }
}

async fn with_link_timeout<T>(
    limit: Duration,
    operation: &str,
    link_op: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, link_op).await.unwrap_or_else(|_| {
        Err(Error::link_general(format!(
            "{operation} timed out after {} ms",
            duration_ms(limit)
        )))
    })
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LoopbackCommand, LoopbackEvent, LoopbackFault, LoopbackFleet};
    use crate::backend::ControllerKind;
    use crate::logging::init_test_logging;

    fn addr(n: u8) -> UnitAddress {
        UnitAddress::new(format!("radio://0/80/2M/E7E7E7E7{n:02X}"))
    }

    fn options() -> FleetOptions {
        FleetOptions {
            settle_delay: Duration::ZERO,
            policy: DispatchPolicy {
                timeout: Duration::from_millis(200),
                max_attempts: 1,
                backoff: Duration::from_millis(1),
            },
            estimator_timeout: Duration::from_millis(200),
            link_timeout: Duration::from_millis(200),
            ..FleetOptions::default()
        }
    }

    fn two_unit_fleet() -> LoopbackFleet {
        LoopbackFleet::builder()
            .unit(addr(1), Position::new(0.0, 0.0, 0.0))
            .unit(addr(2), Position::new(0.5, 1.0, 0.0))
            .build()
    }

    fn controller_for(fleet: &LoopbackFleet, opts: FleetOptions) -> FleetController {
        FleetController::new([addr(1), addr(2)], fleet.backend(), opts)
    }

    async fn airborne(fleet: &LoopbackFleet) -> FleetController {
        let mut controller = controller_for(fleet, options());
        controller.setup().await.unwrap();
        controller.takeoff(0.5).await.unwrap();
        controller
    }

    #[tokio::test]
    async fn test_setup_populates_both_registries() {
        init_test_logging();
        let fleet = two_unit_fleet();
        let mut controller = controller_for(&fleet, options());

        controller.setup().await.unwrap();

        assert_eq!(controller.state(), FleetState::Grounded);
        let recorded: Vec<_> = controller.positions().units().cloned().collect();
        let controlled: Vec<_> = controller.controllers().units().cloned().collect();
        assert_eq!(recorded, vec![addr(1), addr(2)]);
        assert_eq!(controlled, recorded);
        assert_eq!(controller.position(&addr(2)), Some(Position::new(0.5, 1.0, 0.0)));
    }

    #[tokio::test]
    async fn test_setup_seeds_controller_with_estimate() {
        let fleet = LoopbackFleet::builder()
            .unit(addr(1), Position::new(1.0, 2.0, 0.0))
            .build();
        let mut opts = options();
        opts.profile.kind = ControllerKind::Mellinger;
        let mut controller = FleetController::new([addr(1)], fleet.backend(), opts);

        controller.setup().await.unwrap();
        assert_eq!(controller.controllers().len(), 1);
        assert!(fleet.journal().contains(&LoopbackEvent::ControllerCreated {
            unit: addr(1),
            initial: Position::new(1.0, 2.0, 0.0),
            kind: ControllerKind::Mellinger,
        }));

        fleet.clear_journal();
        controller.takeoff(0.6).await.unwrap();
        assert_eq!(controller.state(), FleetState::Airborne);
        assert_eq!(
            fleet.journal(),
            vec![LoopbackEvent::TakeOff {
                unit: addr(1),
                height: 0.6,
            }]
        );
    }

    #[tokio::test]
    async fn test_takeoff_requires_grounded() {
        let fleet = two_unit_fleet();
        let mut controller = controller_for(&fleet, options());

        let err = controller.takeoff(0.5).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(controller.state(), FleetState::Uninitialized);

        controller.setup().await.unwrap();
        controller.takeoff(0.5).await.unwrap();

        let err = controller.takeoff(0.5).await.unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(controller.state(), FleetState::Airborne);
    }

    #[tokio::test]
    async fn test_takeoff_rejects_bad_height() {
        let fleet = two_unit_fleet();
        let mut controller = controller_for(&fleet, options());
        controller.setup().await.unwrap();

        for height in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = controller.takeoff(height).await.unwrap_err();
            assert!(matches!(err, Error::InvalidArgument { .. }));
        }
        assert_eq!(controller.state(), FleetState::Grounded);
        assert!(!fleet.is_airborne(&addr(1)));
    }

    #[tokio::test]
    async fn test_takeoff_records_height() {
        let fleet = two_unit_fleet();
        let controller = airborne(&fleet).await;

        assert_eq!(controller.position(&addr(2)), Some(Position::new(0.5, 1.0, 0.5)));
        assert!(fleet.is_airborne(&addr(1)));
        assert!(fleet.is_airborne(&addr(2)));
    }

    #[tokio::test]
    async fn test_takeoff_default_uses_configured_height() {
        let fleet = two_unit_fleet();
        let mut opts = options();
        opts.takeoff_height = 0.8;
        let mut controller = controller_for(&fleet, opts);
        controller.setup().await.unwrap();

        controller.takeoff_default().await.unwrap();
        assert_eq!(controller.position(&addr(1)).unwrap().z, 0.8);
    }

    #[tokio::test]
    async fn test_cleanup_while_airborne_is_rejected() {
        let fleet = two_unit_fleet();
        let mut controller = airborne(&fleet).await;

        let err = controller.cleanup().await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(controller.state(), FleetState::Airborne);
        assert_eq!(controller.controllers().len(), 2);
        assert!(fleet.links_open());
    }

    #[tokio::test]
    async fn test_cleanup_before_setup_is_rejected() {
        let fleet = two_unit_fleet();
        let mut controller = controller_for(&fleet, options());

        let err = controller.cleanup().await.unwrap_err();
        assert!(err.is_invalid_transition());
        assert!(fleet.journal().is_empty());
    }

    #[tokio::test]
    async fn test_land_takeoff_land_keeps_registries() {
        let fleet = two_unit_fleet();
        let mut controller = airborne(&fleet).await;

        controller.land().await.unwrap();
        controller.takeoff(0.7).await.unwrap();
        controller.land().await.unwrap();

        assert_eq!(controller.state(), FleetState::Grounded);
        assert_eq!(controller.positions().len(), 2);
        assert_eq!(controller.controllers().len(), 2);
        assert!(controller.controllers().covers(controller.positions()));
        assert_eq!(controller.position(&addr(2)), Some(Position::new(0.5, 1.0, 0.0)));
    }

    #[tokio::test]
    async fn test_land_requires_airborne() {
        let fleet = two_unit_fleet();
        let mut controller = controller_for(&fleet, options());
        controller.setup().await.unwrap();

        let err = controller.land().await.unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(controller.state(), FleetState::Grounded);
    }

    #[tokio::test]
    async fn test_set_height_changes_only_z() {
        let fleet = two_unit_fleet();
        let mut controller = airborne(&fleet).await;

        controller.set_height(1.25).await.unwrap();

        assert_eq!(controller.state(), FleetState::Airborne);
        assert_eq!(controller.position(&addr(1)), Some(Position::new(0.0, 0.0, 1.25)));
        assert_eq!(controller.position(&addr(2)), Some(Position::new(0.5, 1.0, 1.25)));
        assert_eq!(fleet.position(&addr(2)), Some(Position::new(0.5, 1.0, 1.25)));
    }

    #[tokio::test]
    async fn test_set_height_requires_airborne() {
        let fleet = two_unit_fleet();
        let mut controller = controller_for(&fleet, options());
        controller.setup().await.unwrap();

        let err = controller.set_height(1.0).await.unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(controller.position(&addr(1)).unwrap().z, 0.0);
    }

    #[tokio::test]
    async fn test_set_height_partial_failure_records_completed_units() {
        let fleet = two_unit_fleet();
        let mut controller = airborne(&fleet).await;
        fleet.inject(
            addr(2),
            LoopbackCommand::MoveTo,
            LoopbackFault::Reject("motor fault".to_string()),
        );

        let err = controller.set_height(1.0).await.unwrap_err();
        let failure = err.dispatch_failure().unwrap();
        assert_eq!(failure.completed, vec![addr(1)]);
        assert!(failure.failure_for(&addr(2)).is_some());

        assert_eq!(controller.position(&addr(1)).unwrap().z, 1.0);
        assert_eq!(controller.position(&addr(2)).unwrap().z, 0.5);
        assert_eq!(controller.state(), FleetState::Airborne);
    }

    #[tokio::test]
    async fn test_set_position_moves_one_unit() {
        let fleet = two_unit_fleet();
        let mut controller = airborne(&fleet).await;
        let target = Position::new(1.0, -1.0, 0.75);

        controller.set_position(&addr(1), target).await.unwrap();

        assert_eq!(controller.position(&addr(1)), Some(target));
        assert_eq!(fleet.position(&addr(1)), Some(target));
        assert_eq!(controller.position(&addr(2)), Some(Position::new(0.5, 1.0, 0.5)));
    }

    #[tokio::test]
    async fn test_set_position_unknown_unit() {
        let fleet = two_unit_fleet();
        let mut controller = airborne(&fleet).await;

        let err = controller
            .set_position(&addr(9), Position::new(0.0, 0.0, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownUnit(unit) if unit == addr(9)));
    }

    #[tokio::test]
    async fn test_set_position_requires_airborne() {
        let fleet = two_unit_fleet();
        let mut controller = controller_for(&fleet, options());
        controller.setup().await.unwrap();

        let err = controller
            .set_position(&addr(1), Position::new(0.0, 0.0, 1.0))
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());
    }

    #[tokio::test]
    async fn test_set_position_rejects_non_finite_target() {
        let fleet = two_unit_fleet();
        let mut controller = airborne(&fleet).await;

        let err = controller
            .set_position(&addr(1), Position::new(f64::NAN, 0.0, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_dry_run_never_touches_backend() {
        let fleet = two_unit_fleet();
        let mut opts = options();
        opts.dry_run = true;
        opts.settle_delay = Duration::from_secs(60);
        let mut controller = controller_for(&fleet, opts);
        assert!(controller.is_dry_run());
        assert!(controller.options().settle_delay.is_zero());

        controller.setup().await.unwrap();
        assert_eq!(controller.state(), FleetState::Grounded);
        assert_eq!(controller.controllers().len(), 2);

        controller.takeoff(0.5).await.unwrap();
        assert_eq!(controller.state(), FleetState::Airborne);

        controller.set_height(1.0).await.unwrap();
        assert_eq!(controller.position(&addr(1)).unwrap().z, 1.0);
        assert_eq!(controller.position(&addr(2)).unwrap().z, 1.0);

        controller.land().await.unwrap();
        assert_eq!(controller.state(), FleetState::Grounded);

        controller.cleanup().await.unwrap();
        assert_eq!(controller.state(), FleetState::Uninitialized);

        assert!(fleet.journal().is_empty());
        assert!(!fleet.links_open());
    }

    #[tokio::test]
    async fn test_second_setup_is_rejected() {
        let fleet = two_unit_fleet();
        let mut controller = controller_for(&fleet, options());
        controller.setup().await.unwrap();
        let created_before = fleet
            .journal()
            .iter()
            .filter(|e| matches!(e, LoopbackEvent::ControllerCreated { .. }))
            .count();

        let err = controller.setup().await.unwrap_err();
        assert!(matches!(err, Error::AlreadySetup { .. }));
        assert_eq!(controller.positions().len(), 2);
        assert_eq!(controller.controllers().len(), 2);

        let created_after = fleet
            .journal()
            .iter()
            .filter(|e| matches!(e, LoopbackEvent::ControllerCreated { .. }))
            .count();
        assert_eq!(created_before, created_after);
    }

    #[tokio::test]
    async fn test_setup_after_cleanup_rebuilds_registries() {
        let fleet = two_unit_fleet();
        let mut controller = controller_for(&fleet, options());
        controller.setup().await.unwrap();
        controller.cleanup().await.unwrap();

        assert!(controller.positions().is_empty());
        assert!(controller.controllers().is_empty());
        assert!(!fleet.links_open());

        controller.setup().await.unwrap();
        assert_eq!(controller.controllers().len(), 2);
    }

    #[tokio::test]
    async fn test_stalled_unit_times_out_takeoff() {
        let fleet = two_unit_fleet();
        let mut opts = options();
        opts.policy.timeout = Duration::from_millis(50);
        let mut controller = controller_for(&fleet, opts);
        controller.setup().await.unwrap();
        fleet.inject(addr(2), LoopbackCommand::TakeOff, LoopbackFault::Stall);

        let err = controller.takeoff(0.5).await.unwrap_err();
        let failure = err.dispatch_failure().unwrap();
        assert!(failure.has_timeouts());
        assert_eq!(failure.completed, vec![addr(1)]);
        assert_eq!(controller.state(), FleetState::Grounded);
        assert_eq!(controller.position(&addr(1)).unwrap().z, 0.0);
    }

    #[tokio::test]
    async fn test_failed_takeoff_lands_units_that_lifted() {
        let fleet = two_unit_fleet();
        let mut opts = options();
        opts.policy.timeout = Duration::from_millis(50);
        let mut controller = controller_for(&fleet, opts);
        controller.setup().await.unwrap();
        fleet.inject_times(addr(2), LoopbackCommand::TakeOff, LoopbackFault::Stall, 1);

        let err = controller.takeoff(0.5).await.unwrap_err();
        assert_eq!(err.dispatch_failure().unwrap().completed, vec![addr(1)]);
        assert_eq!(controller.state(), FleetState::Grounded);
        assert!(!fleet.is_airborne(&addr(1)));
        assert!(!fleet.is_airborne(&addr(2)));
        let journal = fleet.journal();
        assert!(journal.contains(&LoopbackEvent::Land { unit: addr(1) }));
        assert!(!journal.contains(&LoopbackEvent::Land { unit: addr(2) }));

        // Nothing is left flying, so the next attempt starts clean
        controller.takeoff(0.5).await.unwrap();
        assert_eq!(controller.state(), FleetState::Airborne);
    }

    #[tokio::test]
    async fn test_transient_takeoff_failure_is_retried() {
        let fleet = two_unit_fleet();
        let mut opts = options();
        opts.policy.max_attempts = 3;
        let mut controller = controller_for(&fleet, opts);
        controller.setup().await.unwrap();
        fleet.inject_times(
            addr(1),
            LoopbackCommand::TakeOff,
            LoopbackFault::LinkLost("no ack".to_string()),
            2,
        );

        controller.takeoff(0.5).await.unwrap();
        assert_eq!(controller.state(), FleetState::Airborne);
    }

    #[tokio::test]
    async fn test_rejected_takeoff_is_not_retried() {
        let fleet = two_unit_fleet();
        let mut opts = options();
        opts.policy.max_attempts = 3;
        let mut controller = controller_for(&fleet, opts);
        controller.setup().await.unwrap();
        fleet.inject_times(
            addr(1),
            LoopbackCommand::TakeOff,
            LoopbackFault::Reject("battery low".to_string()),
            1,
        );

        let err = controller.takeoff(0.5).await.unwrap_err();
        let failure = err.dispatch_failure().unwrap();
        assert_eq!(failure.failure_for(&addr(1)).unwrap().attempts, 1);
        assert_eq!(controller.state(), FleetState::Grounded);
    }

    #[tokio::test]
    async fn test_failed_setup_rolls_back() {
        let fleet = two_unit_fleet();
        let mut controller = controller_for(&fleet, options());
        fleet.inject(
            addr(2),
            LoopbackCommand::CreateController,
            LoopbackFault::Reject("firmware mismatch".to_string()),
        );

        let err = controller.setup().await.unwrap_err();
        assert!(err.is_dispatch_failure());
        assert_eq!(controller.state(), FleetState::Uninitialized);
        assert!(controller.positions().is_empty());
        assert!(controller.controllers().is_empty());
        assert!(!fleet.links_open());
        assert_eq!(fleet.journal().last(), Some(&LoopbackEvent::LinksClosed));
    }

    #[tokio::test]
    async fn test_estimator_timeout_fails_setup() {
        let fleet = two_unit_fleet();
        let mut opts = options();
        opts.estimator_timeout = Duration::from_millis(30);
        let mut controller = controller_for(&fleet, opts);
        fleet.inject(addr(1), LoopbackCommand::EstimatorReady, LoopbackFault::Stall);

        let err = controller.setup().await.unwrap_err();
        assert!(err.dispatch_failure().unwrap().has_timeouts());
        assert_eq!(controller.state(), FleetState::Uninitialized);
        assert!(!fleet.links_open());
    }

    #[tokio::test]
    async fn test_unknown_unit_fails_link_open() {
        let fleet = two_unit_fleet();
        let mut controller = FleetController::new([addr(1), addr(7)], fleet.backend(), options());

        let err = controller.setup().await.unwrap_err();
        assert!(err.is_link_error());
        assert_eq!(controller.state(), FleetState::Uninitialized);
        assert!(!fleet.links_open());
    }

    #[tokio::test]
    async fn test_stalled_link_open_times_out_setup() {
        let fleet = two_unit_fleet();
        let mut opts = options();
        opts.link_timeout = Duration::from_millis(30);
        let mut controller = controller_for(&fleet, opts);
        fleet.inject(addr(2), LoopbackCommand::OpenLink, LoopbackFault::Stall);

        let err = controller.setup().await.unwrap_err();
        assert!(err.is_link_error());
        assert!(err.to_string().contains("open_links timed out"));
        assert_eq!(controller.state(), FleetState::Uninitialized);
        assert!(controller.positions().is_empty());
        assert!(controller.controllers().is_empty());
        assert!(!fleet.links_open());
    }

    #[tokio::test]
    async fn test_stalled_link_close_times_out_cleanup() {
        let fleet = two_unit_fleet();
        let mut opts = options();
        opts.link_timeout = Duration::from_millis(30);
        let mut controller = controller_for(&fleet, opts);
        controller.setup().await.unwrap();
        fleet.inject(addr(1), LoopbackCommand::CloseLink, LoopbackFault::Stall);

        let err = controller.cleanup().await.unwrap_err();
        assert!(err.is_link_error());
        assert!(err.to_string().contains("close_links timed out"));
        assert_eq!(controller.state(), FleetState::Grounded);
        assert_eq!(controller.positions().len(), 2);
        assert_eq!(controller.controllers().len(), 2);

        fleet.clear_faults();
        controller.cleanup().await.unwrap();
        assert_eq!(controller.state(), FleetState::Uninitialized);
        assert!(!fleet.links_open());
    }

    #[tokio::test]
    async fn test_empty_dry_run_fleet_sets_up_and_cleans_up() {
        let mut controller = FleetController::new(
            Vec::<UnitAddress>::new(),
            FleetBackend::dry_run(Vec::new()),
            FleetOptions {
                dry_run: true,
                ..options()
            },
        );

        controller.setup().await.unwrap();
        assert_eq!(controller.state(), FleetState::Grounded);
        assert!(controller.positions().is_empty());
        assert!(controller.controllers().is_empty());

        controller.cleanup().await.unwrap();
        assert_eq!(controller.state(), FleetState::Uninitialized);
    }

    #[tokio::test]
    async fn test_cleanup_link_error_keeps_fleet_set_up() {
        let fleet = two_unit_fleet();
        let mut controller = controller_for(&fleet, options());
        controller.setup().await.unwrap();
        fleet.inject_times(
            addr(1),
            LoopbackCommand::CloseLink,
            LoopbackFault::Reject("radio busy".to_string()),
            1,
        );

        let err = controller.cleanup().await.unwrap_err();
        assert!(err.is_link_error());
        assert_eq!(controller.state(), FleetState::Grounded);
        assert_eq!(controller.positions().len(), 2);
        assert_eq!(controller.controllers().len(), 2);

        controller.cleanup().await.unwrap();
        assert_eq!(controller.state(), FleetState::Uninitialized);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let fleet = two_unit_fleet();
        let mut controller = controller_for(&fleet, options());

        let status = controller.status();
        assert_eq!(status.state, FleetState::Uninitialized);
        assert!(status.units.iter().all(|u| u.position.is_none() && !u.has_controller));

        controller.setup().await.unwrap();
        let status = controller.status();
        assert_eq!(status.state, FleetState::Grounded);
        assert_eq!(status.units.len(), 2);
        assert!(status.units.iter().all(|u| u.has_controller));

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"grounded\""));
    }

    #[test]
    fn test_new_deduplicates_units() {
        let controller = FleetController::new(
            [addr(2), addr(1), addr(2)],
            FleetBackend::dry_run(Vec::new()),
            FleetOptions::default(),
        );
        assert_eq!(controller.units(), &[addr(1), addr(2)]);
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.fleet.dry_run = true;
        config.flight.settle_delay_ms = 500;
        config.dispatch.max_attempts = 4;

        let opts = FleetOptions::from(&config);
        assert!(opts.dry_run);
        assert_eq!(opts.settle_delay, Duration::from_millis(500));
        assert_eq!(opts.policy.max_attempts, 4);
        assert_eq!(opts.estimator_timeout, Duration::from_secs(30));
        assert_eq!(opts.link_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_from_config_uses_configured_units() {
        let mut config = Config::default();
        config.fleet.units = vec![addr(3), addr(1)];
        config.fleet.dry_run = true;

        let controller = FleetController::from_config(&config, FleetBackend::dry_run(Vec::new()));
        assert_eq!(controller.units(), &[addr(1), addr(3)]);
        assert!(controller.is_dry_run());
    }
}
