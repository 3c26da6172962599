//! Scripted missions.
//!
//! A mission is an ordered list of [`MissionStep`]s run against a
//! [`FleetController`]. Whatever happens, the runner tries to bring the fleet
//! back down and clean up before returning its [`MissionReport`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::controller::{FleetController, FleetStatus};
use crate::error::{Error, Result};
use crate::state::FleetState;
use crate::unit::{Position, UnitAddress};

/// One step of a mission.
///
/// Steps parse from the forms accepted on the command line:
/// `takeoff`, `takeoff=H`, `height=H`, `move=ADDR@X,Y,Z`, `hold=SECS`, `land`.
#[derive(Debug, Clone, PartialEq)]
pub enum MissionStep {
    /// Take off, to the default height when none is given.
    Takeoff(Option<f64>),
    /// Move every unit to a common height.
    Height(f64),
    /// Move one unit.
    Move {
        /// The unit to move.
        unit: UnitAddress,
        /// Where to.
        target: Position,
    },
    /// Wait without commanding anything.
    Hold(Duration),
    /// Land every unit.
    Land,
}

impl fmt::Display for MissionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Takeoff(None) => write!(f, "takeoff"),
            Self::Takeoff(Some(height)) => write!(f, "takeoff={height}"),
            Self::Height(height) => write!(f, "height={height}"),
            Self::Move { unit, target } => {
                write!(f, "move={unit}@{},{},{}", target.x, target.y, target.z)
            }
            Self::Hold(duration) => write!(f, "hold={}", duration.as_secs_f64()),
            Self::Land => write!(f, "land"),
        }
    }
}

impl FromStr for MissionStep {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (name, value) = match s.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim())),
            None => (s, None),
        };

        match (name, value) {
            ("takeoff", None) => Ok(Self::Takeoff(None)),
            ("takeoff", Some(height)) => Ok(Self::Takeoff(Some(parse_number("takeoff", height)?))),
            ("height", Some(height)) => Ok(Self::Height(parse_number("height", height)?)),
            ("move", Some(value)) => parse_move(value),
            ("hold", Some(secs)) => {
                let secs = parse_number("hold", secs)?;
                Duration::try_from_secs_f64(secs)
                    .map(Self::Hold)
                    .map_err(|_| Error::invalid_argument(format!("hold: invalid duration {secs}")))
            }
            ("land", None) => Ok(Self::Land),
            ("height" | "move" | "hold", None) => Err(Error::invalid_argument(format!(
                "step '{name}' needs a value"
            ))),
            ("land", Some(_)) => Err(Error::invalid_argument("step 'land' takes no value")),
            _ => Err(Error::invalid_argument(format!("unknown mission step: '{s}'"))),
        }
    }
}

fn parse_number(step: &str, value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|_| Error::invalid_argument(format!("{step}: '{value}' is not a number")))
}

fn parse_move(value: &str) -> Result<MissionStep> {
    // Coordinates follow the last '@'
    let (unit, coords) = value
        .rsplit_once('@')
        .ok_or_else(|| Error::invalid_argument("move: expected ADDR@X,Y,Z"))?;
    if unit.is_empty() {
        return Err(Error::invalid_argument("move: missing unit address"));
    }

    let values = coords
        .split(',')
        .map(|v| parse_number("move", v.trim()))
        .collect::<Result<Vec<f64>>>()?;
    let [x, y, z] = values.as_slice() else {
        return Err(Error::invalid_argument(format!(
            "move: expected three coordinates, got {}",
            values.len()
        )));
    };

    Ok(MissionStep::Move {
        unit: UnitAddress::from(unit),
        target: Position::new(*x, *y, *z),
    })
}

/// Steps run when none are given.
#[must_use]
pub fn default_steps() -> Vec<MissionStep> {
    vec![MissionStep::Takeoff(None), MissionStep::Land]
}

/// Outcome of [`run_mission`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionReport {
    /// Steps that finished, in order.
    pub completed: Vec<String>,
    /// Number of steps in the mission.
    pub total_steps: usize,
    /// First error hit, if any.
    pub error: Option<String>,
    /// Fleet snapshot after teardown.
    pub status: FleetStatus,
}

impl MissionReport {
    /// Whether every step ran and the fleet came down cleanly.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Render the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

async fn run_step(controller: &mut FleetController, step: &MissionStep) -> Result<()> {
    match step {
        MissionStep::Takeoff(None) => controller.takeoff_default().await,
        MissionStep::Takeoff(Some(height)) => controller.takeoff(*height).await,
        MissionStep::Height(height) => controller.set_height(*height).await,
        MissionStep::Move { unit, target } => controller.set_position(unit, *target).await,
        MissionStep::Hold(duration) => {
            tokio::time::sleep(*duration).await;
            Ok(())
        }
        MissionStep::Land => controller.land().await,
    }
}

/// Set up the fleet, run `steps` in order and tear down.
///
/// Execution stops at the first failing step. Teardown lands an airborne
/// fleet and cleans up a grounded one; teardown errors are reported only when
/// no step failed first.
pub async fn run_mission(controller: &mut FleetController, steps: &[MissionStep]) -> MissionReport {
    let mut completed = Vec::new();
    let mut error = None;

    match controller.setup().await {
        Ok(()) => {
            for (index, step) in steps.iter().enumerate() {
                info!(step = index + 1, of = steps.len(), %step, "Running mission step");
                if let Err(err) = run_step(controller, step).await {
                    warn!(%step, error = %err, "Mission step failed");
                    error = Some(format!("step '{step}' failed: {err}"));
                    break;
                }
                completed.push(step.to_string());
            }

            if let Err(err) = teardown(controller).await {
                warn!(error = %err, "Mission teardown failed");
                error.get_or_insert_with(|| format!("teardown failed: {err}"));
            }
        }
        Err(err) => {
            warn!(error = %err, "Mission aborted during setup");
            error = Some(format!("setup failed: {err}"));
        }
    }

    MissionReport {
        completed,
        total_steps: steps.len(),
        error,
        status: controller.status(),
    }
}

async fn teardown(controller: &mut FleetController) -> Result<()> {
    if controller.state() == FleetState::Airborne {
        controller.land().await?;
    }
    if controller.state() == FleetState::Grounded {
        controller.cleanup().await?;
    }
    Ok(())
}
