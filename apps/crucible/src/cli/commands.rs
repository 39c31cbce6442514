//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use crucible::api;
use crucible::config::CrucibleConfig;
use crucible_core::{
    Actor, AdjustAction, CrucibleError, FlaskId, Metal, MovementFilter, Pipeline, Weight,
};
use serde::Serialize;

// =============================================================================
// HELPERS
// =============================================================================

/// Open the configured database with the configured grace period.
pub fn open_pipeline(config: &CrucibleConfig) -> Result<Pipeline, CrucibleError> {
    Ok(Pipeline::open(&config.database)?.with_grace(config.sweep.grace()))
}

fn print_json<T: Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

/// Start the HTTP server and the promotion sweep.
pub async fn cmd_server(config: &CrucibleConfig) -> Result<(), CrucibleError> {
    let pipeline = open_pipeline(config)?;

    println!("Crucible Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Address:  {}", config.bind_address());
    println!("  Database: {}", config.database.display());
    println!(
        "  Sweep:    every {}s, grace {}s",
        config.sweep.interval_secs, config.sweep.grace_secs
    );
    println!();
    println!("Endpoints:");
    println!("  POST /trees, /waxing            - Intake and investing");
    println!("  POST /flasks/{{id}}/...          - Stage postings");
    println!("  GET  /queue/{{stage}}            - Work queues");
    println!("  GET  /scrap/reserves            - Scrap on hand");
    println!("  GET  /events                    - Live events (SSE)");
    println!("  GET  /health                    - Health check");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    api::run_server(config, pipeline).await
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create the database with its metal catalogue and zero reserves.
pub fn cmd_init(config: &CrucibleConfig, force: bool) -> Result<(), CrucibleError> {
    let path = &config.database;
    if path.exists() {
        if !force {
            return Err(CrucibleError::Conflict(format!(
                "database {} already exists, use --force to replace it",
                path.display()
            )));
        }
        std::fs::remove_file(path)
            .map_err(|e| CrucibleError::IoError(format!("cannot remove old database: {}", e)))?;
    }

    let pipeline = open_pipeline(config)?;
    let metals = pipeline.store().metals()?;
    println!(
        "Initialized floor database at {} ({} metals)",
        path.display(),
        metals.len()
    );
    Ok(())
}

// =============================================================================
// STATUS COMMANDS
// =============================================================================

/// Reserves plus the number of flasks in every stage.
pub fn cmd_status(config: &CrucibleConfig, json_mode: bool) -> Result<(), CrucibleError> {
    let pipeline = open_pipeline(config)?;
    let store = pipeline.store();
    let stages = store.stage_counts()?;
    let reserves = store.reserves()?;
    let in_transit = store.trees_in_transit()?.len();
    let flasks = store.flask_count()?;

    if json_mode {
        let stages: serde_json::Map<String, serde_json::Value> = stages
            .iter()
            .map(|(stage, count)| (stage.as_str().to_string(), (*count).into()))
            .collect();
        print_json(&serde_json::json!({
            "database": config.database.to_string_lossy(),
            "trees_in_transit": in_transit,
            "flasks": flasks,
            "stages": stages,
            "reserves": reserves,
        }));
        return Ok(());
    }

    println!("Crucible Floor Status");
    println!("=====================");
    println!("Database: {}", config.database.display());
    println!();
    println!("Trees in transit: {}", in_transit);
    println!("Flasks (total):   {}", flasks);
    println!();
    for (stage, count) in &stages {
        println!("  {:<16} {}", stage.as_str(), count);
    }
    println!();
    print_reserve_table(&reserves);
    Ok(())
}

pub fn cmd_reserves(config: &CrucibleConfig, json_mode: bool) -> Result<(), CrucibleError> {
    let pipeline = open_pipeline(config)?;
    let reserves = pipeline.store().reserves()?;
    if json_mode {
        print_json(&reserves);
    } else {
        print_reserve_table(&reserves);
    }
    Ok(())
}

fn print_reserve_table(reserves: &[crucible_core::ScrapReserve]) {
    println!("Scrap on hand");
    for reserve in reserves {
        println!("  {:<9} {:>14} g", reserve.metal.code(), reserve.quantity);
    }
}

pub fn cmd_movements(
    config: &CrucibleConfig,
    json_mode: bool,
    metal: Option<Metal>,
    flask: Option<u64>,
    limit: Option<usize>,
) -> Result<(), CrucibleError> {
    let pipeline = open_pipeline(config)?;
    let movements = pipeline.store().movements(&MovementFilter {
        metal,
        flask: flask.map(FlaskId),
        limit,
    })?;

    if json_mode {
        print_json(&movements);
        return Ok(());
    }

    if movements.is_empty() {
        println!("No movements");
        return Ok(());
    }
    for m in &movements {
        let flask = m
            .flask
            .map(|id| format!("flask {}", id))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "#{:<6} {} {:<9} {:>12} g  -> {:>12} g  {:<24} {:<10} {}",
            m.id,
            m.at.format("%Y-%m-%d %H:%M:%S"),
            m.metal.code(),
            m.delta,
            m.balance_after,
            m.source,
            flask,
            m.actor
        );
    }
    Ok(())
}

// =============================================================================
// MAINTENANCE COMMANDS
// =============================================================================

pub fn cmd_adjust(
    config: &CrucibleConfig,
    json_mode: bool,
    metal: Metal,
    action: AdjustAction,
    amount: Weight,
    actor: Actor,
) -> Result<(), CrucibleError> {
    let pipeline = open_pipeline(config)?;
    let movement = pipeline.adjust_reserve(metal, action, amount, actor)?;
    if json_mode {
        print_json(&movement);
    } else {
        println!(
            "{} {} g of {}; reserve now {} g",
            action, amount, metal, movement.balance_after
        );
    }
    Ok(())
}

/// One promotion pass, as the server's sweep would run it.
pub fn cmd_sweep(config: &CrucibleConfig, json_mode: bool) -> Result<(), CrucibleError> {
    let pipeline = open_pipeline(config)?;
    let report = pipeline.promote_ready()?;
    if json_mode {
        print_json(&report);
        return Ok(());
    }
    println!(
        "Examined {}, promoted {}, skipped {}, failed {}",
        report.examined,
        report.promoted.len(),
        report.skipped.len(),
        report.failed.len()
    );
    for id in &report.promoted {
        println!("  promoted flask {}", id);
    }
    for id in &report.failed {
        println!("  FAILED flask {}", id);
    }
    Ok(())
}

/// Recompute every balance from the log. Fails when any metal disagrees.
pub fn cmd_audit(config: &CrucibleConfig, json_mode: bool) -> Result<(), CrucibleError> {
    let pipeline = open_pipeline(config)?;
    let audit = pipeline.store().audit()?;

    if json_mode {
        print_json(&audit);
    } else {
        println!("Ledger audit");
        for entry in &audit.entries {
            println!(
                "  {:<9} recorded {:>12} g  computed {:>12} g  {:>5} movements  {}",
                entry.metal.code(),
                entry.recorded,
                entry.computed,
                entry.movements,
                if entry.is_consistent() { "ok" } else { "MISMATCH" }
            );
        }
    }

    if audit.is_consistent() {
        Ok(())
    } else {
        Err(CrucibleError::ValidationError(
            "ledger audit found inconsistent balances".to_string(),
        ))
    }
}
