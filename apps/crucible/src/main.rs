//! # Crucible - casting floor tracker
//!
//! The main binary for Crucible.
//!
//! This application provides:
//! - HTTP REST API server (axum-based) with live events over SSE
//! - Background promotion sweep for quenched flasks
//! - CLI interface for reserve maintenance and audits
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    apps/crucible (THE BINARY)                   │
//! │                                                                 │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐     │
//! │  │   CLI       │    │   HTTP API  │    │  Sweep Scheduler │     │
//! │  │  (clap)     │    │ (axum, SSE) │    │  (tokio task)    │     │
//! │  └──────┬──────┘    └──────┬──────┘    └────────┬─────────┘     │
//! │         │                  │                    │               │
//! │         └──────────────────┼────────────────────┘               │
//! │                            ▼                                    │
//! │                   ┌─────────────────┐                           │
//! │                   │  crucible-core  │                           │
//! │                   │   (THE LOGIC)   │                           │
//! │                   └─────────────────┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Start the HTTP server
//! crucible --config crucible.toml server --host 0.0.0.0 --port 8080
//!
//! # CLI operations
//! crucible status
//! crucible adjust --metal 14Y --action add --amount 250 --actor stores
//! crucible audit --json-mode
//! ```

mod cli;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // CRUCIBLE_LOG_FORMAT=json switches to machine-parseable output.
    let log_format = std::env::var("CRUCIBLE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "crucible=info,crucible_core=info,tower_http=debug".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!(kind = e.kind(), "Error: {}", e);
        std::process::exit(1);
    }
}

fn print_banner() {
    println!(
        r#"
   ___                _ _     _
  / __\ __ _   _  ___(_) |__ | | ___
 / / | '__| | | |/ __| | '_ \| |/ _ \
/ /__| |  | |_| | (__| | |_) | |  __/
\____/_|   \__,_|\___|_|_.__/|_|\___|

  Casting Floor Tracker v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
