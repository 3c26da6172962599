//! In-process loopback fleet.
//!
//! [`LoopbackFleet`] implements every collaborator contract against a set of
//! virtual units held in memory. Commands take a fixed latency and then move
//! the unit straight to its target. Faults can be injected per unit and
//! command, and every effect is written to a journal that callers can inspect.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::backend::{
    ConnectionPool, ControllerKind, ControllerProfile, FleetBackend, PositionEstimator,
    UnitController, UnitControllerFactory, UnitError, UnitLink, UnitResult,
};
use crate::error::{Error, Result};
use crate::unit::{Position, UnitAddress};

/// Commands a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoopbackCommand {
    /// Opening the unit's link.
    OpenLink,
    /// Closing the unit's link.
    CloseLink,
    /// Estimator readiness probe.
    EstimatorReady,
    /// Controller construction.
    CreateController,
    /// Take-off.
    TakeOff,
    /// Move to a position.
    MoveTo,
    /// Landing.
    Land,
}

impl fmt::Display for LoopbackCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenLink => write!(f, "open_link"),
            Self::CloseLink => write!(f, "close_link"),
            Self::EstimatorReady => write!(f, "estimator_ready"),
            Self::CreateController => write!(f, "create_controller"),
            Self::TakeOff => write!(f, "take_off"),
            Self::MoveTo => write!(f, "move_to"),
            Self::Land => write!(f, "land"),
        }
    }
}

/// Misbehavior to inject into a virtual unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackFault {
    /// Refuse the command.
    Reject(String),
    /// Fail as if the radio link dropped.
    LinkLost(String),
    /// Never answer.
    Stall,
}

/// An effect recorded by the loopback fleet.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopbackEvent {
    /// Links were opened for these units.
    LinksOpened {
        /// Units whose links were opened.
        units: Vec<UnitAddress>,
    },
    /// All links were closed.
    LinksClosed,
    /// A unit's estimator reported convergence.
    EstimatorReady {
        /// The unit.
        unit: UnitAddress,
    },
    /// A controller was built for a unit.
    ControllerCreated {
        /// The unit.
        unit: UnitAddress,
        /// Position the controller was seeded with.
        initial: Position,
        /// Controller kind from the profile.
        kind: ControllerKind,
    },
    /// A unit took off.
    TakeOff {
        /// The unit.
        unit: UnitAddress,
        /// Requested height.
        height: f64,
    },
    /// A unit moved.
    MoveTo {
        /// The unit.
        unit: UnitAddress,
        /// Target position.
        target: Position,
    },
    /// A unit landed.
    Land {
        /// The unit.
        unit: UnitAddress,
    },
}

#[derive(Debug, Clone, Copy)]
struct VirtualUnit {
    position: Position,
    airborne: bool,
}

#[derive(Debug)]
struct FaultEntry {
    fault: LoopbackFault,
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    latency: Duration,
    units: Mutex<BTreeMap<UnitAddress, VirtualUnit>>,
    open: Mutex<BTreeSet<UnitAddress>>,
    faults: Mutex<BTreeMap<(UnitAddress, LoopbackCommand), FaultEntry>>,
    journal: Mutex<Vec<LoopbackEvent>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn record(&self, event: LoopbackEvent) {
        trace!(?event, "Loopback event");
        lock(&self.journal).push(event);
    }

    /// Take the fault armed for this unit and command, if any.
    fn take_fault(&self, unit: &UnitAddress, command: LoopbackCommand) -> Option<LoopbackFault> {
        let mut faults = lock(&self.faults);
        let key = (unit.clone(), command);
        let entry = faults.get_mut(&key)?;
        let fault = entry.fault.clone();

        let exhausted = match entry.remaining.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if exhausted {
            faults.remove(&key);
        }
        Some(fault)
    }

    fn is_open(&self, unit: &UnitAddress) -> bool {
        lock(&self.open).contains(unit)
    }

    /// Run the shared prologue of every per-unit command: link check,
    /// injected faults and latency.
    async fn prepare(&self, unit: &UnitAddress, command: LoopbackCommand) -> UnitResult<()> {
        if !self.is_open(unit) {
            return Err(UnitError::link_lost(format!("no open link to {unit}")));
        }

        match self.take_fault(unit, command) {
            Some(LoopbackFault::Reject(message)) => return Err(UnitError::Rejected(message)),
            Some(LoopbackFault::LinkLost(message)) => return Err(UnitError::LinkLost(message)),
            Some(LoopbackFault::Stall) => {
                debug!(unit = %unit, %command, "Loopback unit stalling");
                std::future::pending::<()>().await;
            }
            None => {}
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(())
    }

    fn with_unit<T>(
        &self,
        unit: &UnitAddress,
        apply: impl FnOnce(&mut VirtualUnit) -> UnitResult<T>,
    ) -> UnitResult<T> {
        let mut units = lock(&self.units);
        let state = units.get_mut(unit).ok_or_else(|| {
            UnitError::link_lost(format!("unit {unit} is not part of the loopback fleet"))
        })?;
        apply(state)
    }
}

/// Builder for [`LoopbackFleet`].
#[derive(Debug, Default)]
pub struct LoopbackFleetBuilder {
    latency: Duration,
    units: BTreeMap<UnitAddress, Position>,
}

impl LoopbackFleetBuilder {
    /// Add a unit resting at `position`.
    #[must_use]
    pub fn unit(mut self, address: UnitAddress, position: Position) -> Self {
        self.units.insert(address, position);
        self
    }

    /// Add units spaced `spacing` meters apart along the x axis.
    #[must_use]
    pub fn units_in_line(
        mut self,
        addresses: impl IntoIterator<Item = UnitAddress>,
        spacing: f64,
    ) -> Self {
        for (i, address) in addresses.into_iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let x = i as f64 * spacing;
            self.units.insert(address, Position::new(x, 0.0, 0.0));
        }
        self
    }

    /// Delay applied to every command.
    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Build the fleet.
    #[must_use]
    pub fn build(self) -> LoopbackFleet {
        let units = self
            .units
            .into_iter()
            .map(|(address, position)| {
                (
                    address,
                    VirtualUnit {
                        position,
                        airborne: false,
                    },
                )
            })
            .collect();

        LoopbackFleet {
            inner: Arc::new(Inner {
                latency: self.latency,
                units: Mutex::new(units),
                ..Inner::default()
            }),
        }
    }
}

/// An in-memory fleet of virtual units.
///
/// Clones share the same units, faults and journal.
#[derive(Debug, Clone)]
pub struct LoopbackFleet {
    inner: Arc<Inner>,
}

impl LoopbackFleet {
    /// Start building a loopback fleet.
    #[must_use]
    pub fn builder() -> LoopbackFleetBuilder {
        LoopbackFleetBuilder::default()
    }

    /// A [`FleetBackend`] backed by this fleet.
    #[must_use]
    pub fn backend(&self) -> FleetBackend {
        FleetBackend::from_shared(Arc::new(self.clone()))
    }

    /// Arm a fault that fires on every matching command.
    pub fn inject(&self, unit: UnitAddress, command: LoopbackCommand, fault: LoopbackFault) {
        lock(&self.inner.faults).insert(
            (unit, command),
            FaultEntry {
                fault,
                remaining: None,
            },
        );
    }

    /// Arm a fault that fires on the next `times` matching commands.
    pub fn inject_times(
        &self,
        unit: UnitAddress,
        command: LoopbackCommand,
        fault: LoopbackFault,
        times: u32,
    ) {
        if times == 0 {
            return;
        }
        lock(&self.inner.faults).insert(
            (unit, command),
            FaultEntry {
                fault,
                remaining: Some(times),
            },
        );
    }

    /// Disarm every fault.
    pub fn clear_faults(&self) {
        lock(&self.inner.faults).clear();
    }

    /// Everything that happened so far, in order.
    #[must_use]
    pub fn journal(&self) -> Vec<LoopbackEvent> {
        lock(&self.inner.journal).clone()
    }

    /// Forget the recorded history.
    pub fn clear_journal(&self) {
        lock(&self.inner.journal).clear();
    }

    /// Current position of a virtual unit.
    #[must_use]
    pub fn position(&self, unit: &UnitAddress) -> Option<Position> {
        lock(&self.inner.units).get(unit).map(|u| u.position)
    }

    /// Whether a virtual unit is in the air.
    #[must_use]
    pub fn is_airborne(&self, unit: &UnitAddress) -> bool {
        lock(&self.inner.units).get(unit).is_some_and(|u| u.airborne)
    }

    /// Whether any link is open.
    #[must_use]
    pub fn links_open(&self) -> bool {
        !lock(&self.inner.open).is_empty()
    }
}

/// Link to a virtual unit.
#[derive(Debug, Clone)]
pub struct LoopbackLink {
    address: UnitAddress,
}

impl UnitLink for LoopbackLink {
    fn address(&self) -> &UnitAddress {
        &self.address
    }
}

#[async_trait::async_trait]
impl ConnectionPool for LoopbackFleet {
    async fn open_links(&self, units: &[UnitAddress]) -> Result<()> {
        {
            let known = lock(&self.inner.units);
            if let Some(unknown) = units.iter().find(|u| !known.contains_key(*u)) {
                return Err(Error::link(unknown.clone(), "no such unit on the loopback fleet"));
            }
        }

        for unit in units {
            match self.inner.take_fault(unit, LoopbackCommand::OpenLink) {
                Some(LoopbackFault::Stall) => std::future::pending::<()>().await,
                Some(LoopbackFault::Reject(message) | LoopbackFault::LinkLost(message)) => {
                    return Err(Error::link(unit.clone(), message));
                }
                None => {}
            }
        }

        lock(&self.inner.open).extend(units.iter().cloned());
        self.inner.record(LoopbackEvent::LinksOpened {
            units: units.to_vec(),
        });
        Ok(())
    }

    async fn close_links(&self) -> Result<()> {
        let open: Vec<UnitAddress> = lock(&self.inner.open).iter().cloned().collect();
        for unit in &open {
            match self.inner.take_fault(unit, LoopbackCommand::CloseLink) {
                Some(LoopbackFault::Stall) => std::future::pending::<()>().await,
                Some(LoopbackFault::Reject(message) | LoopbackFault::LinkLost(message)) => {
                    return Err(Error::link(unit.clone(), message));
                }
                None => {}
            }
        }

        lock(&self.inner.open).clear();
        self.inner.record(LoopbackEvent::LinksClosed);
        Ok(())
    }

    fn link(&self, unit: &UnitAddress) -> Option<Arc<dyn UnitLink>> {
        self.inner.is_open(unit).then(|| {
            Arc::new(LoopbackLink {
                address: unit.clone(),
            }) as Arc<dyn UnitLink>
        })
    }

    /// Fails when no link is open, so a loopback fleet with no units can
    /// never finish setup. Use the dry-run backend for an empty fleet.
    async fn estimated_positions(&self) -> Result<BTreeMap<UnitAddress, Position>> {
        let open = lock(&self.inner.open).clone();
        if open.is_empty() {
            return Err(Error::link_general("cannot read estimates: no open links"));
        }

        let units = lock(&self.inner.units);
        Ok(open
            .into_iter()
            .filter_map(|unit| units.get(&unit).map(|u| (unit, u.position)))
            .collect())
    }
}

#[async_trait::async_trait]
impl PositionEstimator for LoopbackFleet {
    async fn wait_until_ready(&self, link: Arc<dyn UnitLink>) -> UnitResult<()> {
        let unit = link.address();
        self.inner.prepare(unit, LoopbackCommand::EstimatorReady).await?;
        self.inner.record(LoopbackEvent::EstimatorReady { unit: unit.clone() });
        Ok(())
    }
}

#[async_trait::async_trait]
impl UnitControllerFactory for LoopbackFleet {
    async fn create(
        &self,
        link: Arc<dyn UnitLink>,
        initial: Position,
        profile: &ControllerProfile,
    ) -> UnitResult<Arc<dyn UnitController>> {
        let unit = link.address().clone();
        self.inner.prepare(&unit, LoopbackCommand::CreateController).await?;
        self.inner.record(LoopbackEvent::ControllerCreated {
            unit: unit.clone(),
            initial,
            kind: profile.kind,
        });
        Ok(Arc::new(LoopbackController {
            unit,
            inner: Arc::clone(&self.inner),
        }))
    }
}

/// Controller driving one virtual unit.
#[derive(Debug)]
pub struct LoopbackController {
    unit: UnitAddress,
    inner: Arc<Inner>,
}

#[async_trait::async_trait]
impl UnitController for LoopbackController {
    async fn move_to(&self, target: Position) -> UnitResult<()> {
        self.inner.prepare(&self.unit, LoopbackCommand::MoveTo).await?;
        self.inner.with_unit(&self.unit, |state| {
            if !state.airborne {
                return Err(UnitError::rejected("unit is on the ground"));
            }
            state.position = target;
            Ok(())
        })?;
        self.inner.record(LoopbackEvent::MoveTo {
            unit: self.unit.clone(),
            target,
        });
        Ok(())
    }

    async fn take_off(&self, height: f64) -> UnitResult<()> {
        self.inner.prepare(&self.unit, LoopbackCommand::TakeOff).await?;
        self.inner.with_unit(&self.unit, |state| {
            if state.airborne {
                return Err(UnitError::rejected("unit is already flying"));
            }
            state.airborne = true;
            state.position = state.position.with_z(height);
            Ok(())
        })?;
        self.inner.record(LoopbackEvent::TakeOff {
            unit: self.unit.clone(),
            height,
        });
        Ok(())
    }

    async fn land(&self) -> UnitResult<()> {
        self.inner.prepare(&self.unit, LoopbackCommand::Land).await?;
        self.inner.with_unit(&self.unit, |state| {
            state.airborne = false;
            state.position = state.position.with_z(0.0);
            Ok(())
        })?;
        self.inner.record(LoopbackEvent::Land {
            unit: self.unit.clone(),
        });
        Ok(())
    }
}
