//! # Crucible CLI Module
//!
//! This module implements the CLI interface for Crucible.
//!
//! ## Available Commands
//!
//! - `server` - Start the HTTP server and the promotion sweep
//! - `init` - Create a new floor database
//! - `status` - Show reserves and stage counts
//! - `reserves` - Show scrap on hand per metal
//! - `movements` - List the scrap movement log
//! - `adjust` - Manually add or remove scrap
//! - `sweep` - Run one promotion pass
//! - `audit` - Recompute balances from the movement log

mod commands;

use clap::{Parser, Subcommand};
use crucible::config::CrucibleConfig;
use crucible_core::{Actor, AdjustAction, CrucibleError, Metal, Weight};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Crucible - casting floor tracker
///
/// Follows trees and flasks through the casting pipeline and keeps the
/// scrap reserve of every metal.
#[derive(Parser, Debug)]
#[command(name = "crucible")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the floor database (overrides config and CRUCIBLE_DATABASE)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server and promotion sweep
    Server {
        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Initialize a new floor database
    Init {
        /// Replace an existing database
        #[arg(short, long)]
        force: bool,
    },

    /// Show reserves and stage counts
    Status,

    /// Show scrap on hand per metal
    Reserves,

    /// List scrap movements, oldest first
    Movements {
        /// Only this metal (e.g. 14Y, Platinum)
        #[arg(short, long)]
        metal: Option<Metal>,

        /// Only movements of this flask
        #[arg(short, long)]
        flask: Option<u64>,

        /// Keep only the most recent N
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Manually add or remove scrap
    Adjust {
        #[arg(short, long)]
        metal: Metal,

        /// add or remove
        #[arg(short, long)]
        action: AdjustAction,

        /// Grams, up to three decimals
        #[arg(long)]
        amount: Weight,

        /// Who is making the correction
        #[arg(long)]
        actor: Actor,
    },

    /// Promote every quenched flask past the grace period, once
    Sweep,

    /// Check every balance against the movement log
    Audit,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Resolve configuration (file, environment, flags) and run the command.
pub async fn execute(cli: Cli) -> Result<(), CrucibleError> {
    let mut config = CrucibleConfig::load(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.database = database;
    }
    let json_mode = cli.json_mode;
    if cli.verbose {
        tracing::info!(database = %config.database.display(), "configuration resolved");
    }

    match cli.command {
        Some(Commands::Server { host, port }) => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.validate()?;
            cmd_server(&config).await
        }
        Some(Commands::Init { force }) => cmd_init(&config, force),
        Some(Commands::Status) | None => cmd_status(&config, json_mode),
        Some(Commands::Reserves) => cmd_reserves(&config, json_mode),
        Some(Commands::Movements {
            metal,
            flask,
            limit,
        }) => cmd_movements(&config, json_mode, metal, flask, limit),
        Some(Commands::Adjust {
            metal,
            action,
            amount,
            actor,
        }) => cmd_adjust(&config, json_mode, metal, action, amount, actor),
        Some(Commands::Sweep) => cmd_sweep(&config, json_mode),
        Some(Commands::Audit) => cmd_audit(&config, json_mode),
    }
}
