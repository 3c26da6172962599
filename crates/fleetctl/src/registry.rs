//! Position and controller registries.
//!
//! These two maps are the single source of truth for where each unit is and
//! how to command it. They are only written by the task that owns the
//! [`crate::FleetController`], after a broadcast has joined.

use std::collections::btree_map::{self, BTreeMap};
use std::sync::Arc;

use crate::backend::UnitController;
use crate::error::{Error, Result};
use crate::unit::{Position, UnitAddress};

/// Last-known position of every unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionRegistry {
    positions: BTreeMap<UnitAddress, Position>,
}

impl PositionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the initial estimate for a unit.
    ///
    /// Any previous entry for the unit is replaced.
    pub fn record_estimate(&mut self, unit: UnitAddress, position: Position) {
        self.positions.insert(unit, position);
    }

    /// Overwrite the stored position of a known unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownUnit`] if no estimate was recorded for `unit`.
    pub fn update_position(&mut self, unit: &UnitAddress, position: Position) -> Result<()> {
        match self.positions.get_mut(unit) {
            Some(slot) => {
                *slot = position;
                Ok(())
            }
            None => Err(Error::UnknownUnit(unit.clone())),
        }
    }

    /// Get the stored position of a unit.
    #[must_use]
    pub fn get(&self, unit: &UnitAddress) -> Option<Position> {
        self.positions.get(unit).copied()
    }

    /// Check whether a unit has a recorded position.
    #[must_use]
    pub fn contains(&self, unit: &UnitAddress) -> bool {
        self.positions.contains_key(unit)
    }

    /// Number of recorded units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Iterate over recorded units in address order.
    pub fn units(&self) -> impl Iterator<Item = &UnitAddress> {
        self.positions.keys()
    }

    /// Iterate over `(unit, position)` pairs in address order.
    pub fn iter(&self) -> btree_map::Iter<'_, UnitAddress, Position> {
        self.positions.iter()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.positions.clear();
    }
}

impl<'a> IntoIterator for &'a PositionRegistry {
    type Item = (&'a UnitAddress, &'a Position);
    type IntoIter = btree_map::Iter<'a, UnitAddress, Position>;

    fn into_iter(self) -> Self::IntoIter {
        self.positions.iter()
    }
}

/// Controller instance for every unit.
#[derive(Debug, Clone, Default)]
pub struct ControllerRegistry {
    controllers: BTreeMap<UnitAddress, Arc<dyn UnitController>>,
}

impl ControllerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the controller created for `unit`.
    ///
    /// A controller may only exist for a unit that has a recorded position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownUnit`] if `positions` has no entry for `unit`.
    pub fn insert(
        &mut self,
        positions: &PositionRegistry,
        unit: UnitAddress,
        controller: Arc<dyn UnitController>,
    ) -> Result<()> {
        if !positions.contains(&unit) {
            return Err(Error::UnknownUnit(unit));
        }
        self.controllers.insert(unit, controller);
        Ok(())
    }

    /// Get the controller for a unit.
    #[must_use]
    pub fn get(&self, unit: &UnitAddress) -> Option<Arc<dyn UnitController>> {
        self.controllers.get(unit).cloned()
    }

    /// Check whether a unit has a controller.
    #[must_use]
    pub fn contains(&self, unit: &UnitAddress) -> bool {
        self.controllers.contains_key(unit)
    }

    /// Number of controllers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Iterate over units that have a controller, in address order.
    pub fn units(&self) -> impl Iterator<Item = &UnitAddress> {
        self.controllers.keys()
    }

    /// Find the first recorded unit without a controller.
    #[must_use]
    pub fn first_uncovered<'a>(&self, positions: &'a PositionRegistry) -> Option<&'a UnitAddress> {
        positions.units().find(|unit| !self.contains(unit))
    }

    /// Check that every recorded unit has a controller.
    #[must_use]
    pub fn covers(&self, positions: &PositionRegistry) -> bool {
        self.first_uncovered(positions).is_none()
    }

    /// Owned copy of the controller handles, ready to hand to a broadcast.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<UnitAddress, Arc<dyn UnitController>> {
        self.controllers.clone()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.controllers.clear();
    }
}
