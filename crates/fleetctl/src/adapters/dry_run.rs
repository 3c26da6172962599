//! No-op collaborators for dry runs.
//!
//! Every unit gets a placeholder link, reports a converged estimator at the
//! origin, and accepts every command without doing anything.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::backend::{
    ConnectionPool, ControllerProfile, FleetBackend, PositionEstimator, UnitController,
    UnitControllerFactory, UnitLink, UnitResult,
};
use crate::error::Result;
use crate::unit::{Position, UnitAddress};

/// Placeholder link for a dry-run unit.
#[derive(Debug, Clone)]
pub struct DryRunLink {
    address: UnitAddress,
}

impl DryRunLink {
    /// Create a placeholder link.
    #[must_use]
    pub fn new(address: UnitAddress) -> Self {
        Self { address }
    }
}

impl UnitLink for DryRunLink {
    fn address(&self) -> &UnitAddress {
        &self.address
    }
}

/// Connection pool that never opens anything.
#[derive(Debug, Clone, Default)]
pub struct DryRunPool {
    units: Vec<UnitAddress>,
}

impl DryRunPool {
    /// Create a pool that knows about `units`.
    #[must_use]
    pub fn new(units: impl IntoIterator<Item = UnitAddress>) -> Self {
        Self {
            units: units.into_iter().collect(),
        }
    }
}

#[async_trait::async_trait]
impl ConnectionPool for DryRunPool {
    async fn open_links(&self, units: &[UnitAddress]) -> Result<()> {
        trace!(units = units.len(), "Dry run: not opening links");
        Ok(())
    }

    async fn close_links(&self) -> Result<()> {
        trace!("Dry run: not closing links");
        Ok(())
    }

    fn link(&self, unit: &UnitAddress) -> Option<Arc<dyn UnitLink>> {
        self.units
            .contains(unit)
            .then(|| Arc::new(DryRunLink::new(unit.clone())) as Arc<dyn UnitLink>)
    }

    async fn estimated_positions(&self) -> Result<BTreeMap<UnitAddress, Position>> {
        Ok(self
            .units
            .iter()
            .map(|unit| (unit.clone(), Position::ORIGIN))
            .collect())
    }
}

/// Estimator that is always ready.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunEstimator;

#[async_trait::async_trait]
impl PositionEstimator for DryRunEstimator {
    async fn wait_until_ready(&self, _link: Arc<dyn UnitLink>) -> UnitResult<()> {
        Ok(())
    }
}

/// Controller that accepts every command and does nothing.
#[derive(Debug, Clone)]
pub struct DryRunController {
    unit: UnitAddress,
}

impl DryRunController {
    /// Create a no-op controller for `unit`.
    #[must_use]
    pub fn new(unit: UnitAddress) -> Self {
        Self { unit }
    }
}

#[async_trait::async_trait]
impl UnitController for DryRunController {
    async fn move_to(&self, target: Position) -> UnitResult<()> {
        trace!(unit = %self.unit, %target, "Dry run: move skipped");
        Ok(())
    }

    async fn take_off(&self, height: f64) -> UnitResult<()> {
        trace!(unit = %self.unit, height, "Dry run: take-off skipped");
        Ok(())
    }

    async fn land(&self) -> UnitResult<()> {
        trace!(unit = %self.unit, "Dry run: landing skipped");
        Ok(())
    }
}

/// Factory producing [`DryRunController`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunFactory;

#[async_trait::async_trait]
impl UnitControllerFactory for DryRunFactory {
    async fn create(
        &self,
        link: Arc<dyn UnitLink>,
        _initial: Position,
        _profile: &ControllerProfile,
    ) -> UnitResult<Arc<dyn UnitController>> {
        Ok(Arc::new(DryRunController::new(link.address().clone())))
    }
}

impl FleetBackend {
    /// Backend whose collaborators are all no-ops.
    #[must_use]
    pub fn dry_run(units: impl IntoIterator<Item = UnitAddress>) -> Self {
        Self::new(
            Arc::new(DryRunPool::new(units)),
            Arc::new(DryRunEstimator),
            Arc::new(DryRunFactory),
        )
    }
}
