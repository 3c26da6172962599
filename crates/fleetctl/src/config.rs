//! Configuration management for fleetctl.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::backend::{ControllerKind, ControllerProfile};
use crate::dispatch::DispatchPolicy;
use crate::error::{Error, Result};
use crate::unit::UnitAddress;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default config directory name.
const CONFIG_DIR_NAME: &str = "fleetctl";

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "FLEETCTL_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `FLEETCTL_`, sections separated by `__`)
/// 2. TOML config file at `~/.config/fleetctl/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fleet membership and mode.
    pub fleet: FleetConfig,
    /// Flight parameters.
    pub flight: FlightConfig,
    /// Controller profile handed to every unit.
    pub controller: ControllerConfig,
    /// Broadcast timeouts and retries.
    pub dispatch: DispatchConfig,
    /// Loopback backend settings.
    pub loopback: LoopbackConfig,
}

/// Fleet membership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Addresses of the units in the fleet.
    pub units: Vec<UnitAddress>,
    /// Exercise the controller without touching any unit.
    pub dry_run: bool,
}

/// Flight parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    /// Height used by a take-off that does not specify one, in meters.
    pub takeoff_height: f64,
    /// Time to let units stabilize after take-off, in milliseconds.
    pub settle_delay_ms: u64,
}

/// Controller profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// On-board controller to select.
    pub kind: ControllerKind,
    /// Move velocity in m/s.
    pub default_velocity: f64,
    /// Default height in meters.
    pub default_height: f64,
}

/// Broadcast timeouts and retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Per-unit timeout for motion commands, in milliseconds.
    pub command_timeout_ms: u64,
    /// Per-unit timeout for the estimator readiness probe, in milliseconds.
    pub estimator_timeout_ms: u64,
    /// Timeout for opening links, closing links and reading estimates, in
    /// milliseconds.
    pub link_timeout_ms: u64,
    /// Attempts per unit, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub retry_backoff_ms: u64,
}

/// Loopback backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Latency applied to every loopback command, in milliseconds.
    pub latency_ms: u64,
    /// Distance between consecutive units along the x axis, in meters.
    pub spacing: f64,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            takeoff_height: 0.5,
            settle_delay_ms: 2_000,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let profile = ControllerProfile::default();
        Self {
            kind: profile.kind,
            default_velocity: profile.default_velocity,
            default_height: profile.default_height,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            estimator_timeout_ms: 30_000,
            link_timeout_ms: 10_000,
            max_attempts: 1, // No retries unless asked for
            retry_backoff_ms: 100,
        }
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            latency_ms: 50,
            spacing: 0.5,
        }
    }
}

impl Config {
    /// Load configuration with an optional custom config path.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `FLEETCTL_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for unit in &self.fleet.units {
            if unit.as_str().trim().is_empty() {
                return Err(validation("unit addresses cannot be empty"));
            }
            if !seen.insert(unit) {
                return Err(validation(format!("duplicate unit address: {unit}")));
            }
        }

        if !is_positive(self.flight.takeoff_height) {
            return Err(validation(format!(
                "takeoff_height must be a positive number (got {})",
                self.flight.takeoff_height
            )));
        }

        if !is_positive(self.controller.default_velocity) {
            return Err(validation("default_velocity must be a positive number"));
        }

        if !is_positive(self.controller.default_height) {
            return Err(validation("default_height must be a positive number"));
        }

        if self.dispatch.command_timeout_ms == 0 {
            return Err(validation("command_timeout_ms must be greater than 0"));
        }

        if self.dispatch.estimator_timeout_ms == 0 {
            return Err(validation("estimator_timeout_ms must be greater than 0"));
        }

        if self.dispatch.link_timeout_ms == 0 {
            return Err(validation("link_timeout_ms must be greater than 0"));
        }

        if self.dispatch.max_attempts == 0 {
            return Err(validation("max_attempts must be at least 1"));
        }

        if !self.loopback.spacing.is_finite() || self.loopback.spacing < 0.0 {
            return Err(validation("loopback spacing must be a non-negative number"));
        }

        Ok(())
    }

    /// Get the controller profile.
    #[must_use]
    pub fn controller_profile(&self) -> ControllerProfile {
        ControllerProfile {
            kind: self.controller.kind,
            default_velocity: self.controller.default_velocity,
            default_height: self.controller.default_height,
        }
    }

    /// Get the dispatch policy for motion commands.
    #[must_use]
    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            timeout: self.command_timeout(),
            max_attempts: self.dispatch.max_attempts,
            backoff: Duration::from_millis(self.dispatch.retry_backoff_ms),
        }
    }

    /// Get the motion command timeout as a Duration.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.command_timeout_ms)
    }

    /// Get the estimator readiness timeout as a Duration.
    #[must_use]
    pub fn estimator_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.estimator_timeout_ms)
    }

    /// Get the link operation timeout as a Duration.
    #[must_use]
    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.link_timeout_ms)
    }

    /// Get the post-take-off settle delay as a Duration.
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.flight.settle_delay_ms)
    }

    /// Get the loopback command latency as a Duration.
    #[must_use]
    pub fn loopback_latency(&self) -> Duration {
        Duration::from_millis(self.loopback.latency_ms)
    }
}

fn validation(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}
