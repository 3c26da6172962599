//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::config::Config;
use crate::mission::{default_steps, MissionStep};
use crate::unit::UnitAddress;

/// Fly command arguments.
#[derive(Debug, Args)]
pub struct FlyCommand {
    /// Unit to fly (repeatable; replaces the configured units)
    #[arg(short, long = "unit", value_name = "ADDR")]
    pub units: Vec<UnitAddress>,

    /// Exercise the controller without commanding any unit
    #[arg(long)]
    pub dry_run: bool,

    /// Mission step: takeoff[=H], height=H, move=ADDR@X,Y,Z, hold=SECS, land
    #[arg(short, long = "step", value_name = "STEP")]
    pub steps: Vec<MissionStep>,

    /// Print the mission report as JSON
    #[arg(short, long)]
    pub json: bool,
}

impl FlyCommand {
    /// Fold the command-line overrides into `config`.
    pub fn apply_to(&self, config: &mut Config) {
        if !self.units.is_empty() {
            config.fleet.units.clone_from(&self.units);
        }
        if self.dry_run {
            config.fleet.dry_run = true;
        }
    }

    /// The steps to run, falling back to a plain take-off and landing.
    #[must_use]
    pub fn mission(&self) -> Vec<MissionStep> {
        if self.steps.is_empty() {
            default_steps()
        } else {
            self.steps.clone()
        }
    }
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
