//! `fleetctl` - CLI for the fleet controller
//!
//! This binary flies missions against the loopback fleet (or in dry-run mode)
//! and inspects the configuration.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use anyhow::{bail, Context};
use clap::Parser;

use fleetctl::adapters::LoopbackFleet;
use fleetctl::cli::{Cli, Command, ConfigCommand, FlyCommand};
use fleetctl::mission::run_mission;
use fleetctl::{init_logging, Config, FleetController};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Path and validate must work even when the active config is broken
    if let Command::Config(ConfigCommand::Path) = cli.command {
        println!("{}", config_path(&cli).display());
        return Ok(());
    }
    if let Command::Config(ConfigCommand::Validate { file }) = &cli.command {
        return handle_validate(file.clone().unwrap_or_else(|| config_path(&cli)));
    }

    let config = Config::load_from(cli.config.clone()).context("failed to load configuration")?;

    match cli.command {
        Command::Fly(fly_cmd) => handle_fly(config, &fly_cmd).await,
        Command::Status(status_cmd) => handle_status(&config, status_cmd.json),
        Command::Config(ConfigCommand::Show { json }) => handle_config_show(&config, json),
        Command::Config(_) => Ok(()),
    }
}

fn config_path(cli: &Cli) -> std::path::PathBuf {
    cli.config.clone().unwrap_or_else(Config::default_config_path)
}

async fn handle_fly(mut config: Config, cmd: &FlyCommand) -> anyhow::Result<()> {
    cmd.apply_to(&mut config);
    config.validate().context("invalid fleet settings")?;
    if config.fleet.units.is_empty() {
        bail!("no units to fly: pass --unit or set fleet.units in the configuration");
    }

    let fleet = LoopbackFleet::builder()
        .units_in_line(config.fleet.units.iter().cloned(), config.loopback.spacing)
        .latency(config.loopback_latency())
        .build();
    let mut controller = FleetController::from_config(&config, fleet.backend());

    let steps = cmd.mission();
    let report = run_mission(&mut controller, &steps).await;

    if cmd.json {
        println!("{}", report.to_json()?);
    } else {
        println!(
            "Mission: {}/{} steps{}",
            report.completed.len(),
            report.total_steps,
            if controller.is_dry_run() { " (dry run)" } else { "" }
        );
        for step in &report.completed {
            println!("  ok    {step}");
        }
        println!("Final state: {}", report.status.state);
    }

    if let Some(error) = report.error {
        bail!("mission failed: {error}");
    }
    Ok(())
}

fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    if json {
        let status = serde_json::json!({
            "units": config.fleet.units,
            "dry_run": config.fleet.dry_run,
            "takeoff_height": config.flight.takeoff_height,
            "controller": config.controller.kind,
            "command_timeout_ms": config.dispatch.command_timeout_ms,
            "estimator_timeout_ms": config.dispatch.estimator_timeout_ms,
            "max_attempts": config.dispatch.max_attempts,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("fleetctl status");
        println!("---------------");
        println!(
            "Mode:          {}",
            if config.fleet.dry_run { "dry run" } else { "loopback" }
        );
        println!("Units:         {}", config.fleet.units.len());
        for unit in &config.fleet.units {
            println!("  {unit}");
        }
        println!("Controller:    {}", config.controller.kind);
        println!("Takeoff:       {} m", config.flight.takeoff_height);
        println!(
            "Timeouts:      command {} ms, estimator {} ms",
            config.dispatch.command_timeout_ms, config.dispatch.estimator_timeout_ms
        );
        println!("Attempts:      {}", config.dispatch.max_attempts);
    }
    Ok(())
}

fn handle_config_show(config: &Config, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    println!("Current Configuration");
    println!("=====================");
    println!();
    println!("[Fleet]");
    println!("  Units:              {}", config.fleet.units.len());
    println!("  Dry run:            {}", config.fleet.dry_run);
    println!();
    println!("[Flight]");
    println!("  Takeoff height:     {} m", config.flight.takeoff_height);
    println!("  Settle delay:       {} ms", config.flight.settle_delay_ms);
    println!();
    println!("[Controller]");
    println!("  Kind:               {}", config.controller.kind);
    println!("  Default velocity:   {} m/s", config.controller.default_velocity);
    println!("  Default height:     {} m", config.controller.default_height);
    println!();
    println!("[Dispatch]");
    println!("  Command timeout:    {} ms", config.dispatch.command_timeout_ms);
    println!("  Estimator timeout:  {} ms", config.dispatch.estimator_timeout_ms);
    println!("  Max attempts:       {}", config.dispatch.max_attempts);
    println!("  Retry backoff:      {} ms", config.dispatch.retry_backoff_ms);
    println!();
    println!("[Loopback]");
    println!("  Latency:            {} ms", config.loopback.latency_ms);
    println!("  Spacing:            {} m", config.loopback.spacing);
    Ok(())
}

fn handle_validate(path: std::path::PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path)) {
        Ok(_) => {
            println!("Configuration is valid.");
            Ok(())
        }
        Err(e) => bail!("configuration error: {e}"),
    }
}
