//! Pump.fun Sandwich Engine - flashloan-funded sandwiches via Jito bundles
//!
//! # WARNING
//! - This engine trades with real money. The bribe ceiling and network fees
//!   are spent even when nothing lands.
//! - MEV competition means other searchers may outbid you.
//! - Run with `start --dry-run` first; dry-run results are estimates.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use pumpfun_sandwich::cli::commands;
use pumpfun_sandwich::config::Config;

/// Pump.fun Sandwich Engine
#[derive(Parser)]
#[command(name = "sandwich")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine
    Start {
        /// Settle units in memory; nothing is broadcast
        #[arg(long)]
        dry_run: bool,

        /// Skip the live-trading confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Show current configuration (secrets masked)
    Config,

    /// Check system health (RPC, feed, Jito, lending reserve, keypair)
    Health,

    /// Evaluate a hypothetical target buy against given reserves
    Simulate {
        /// Virtual SOL reserves, in SOL
        #[arg(long, default_value = "30")]
        sol_reserves: f64,

        /// Virtual token reserves, in base units
        #[arg(long, default_value = "1073000000000000")]
        token_reserves: u64,

        /// Target buy size, in SOL
        #[arg(long)]
        amount: f64,

        /// Target's declared slippage tolerance
        #[arg(long, default_value = "1000")]
        slippage_bps: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pumpfun_sandwich=info".parse()?),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration loaded from {}", cli.config);

    let result = match cli.command {
        Commands::Start { dry_run, yes } => commands::start(&config, dry_run, yes).await,
        Commands::Config => commands::show_config(&config),
        Commands::Health => commands::health(&config).await,
        Commands::Simulate {
            sol_reserves,
            token_reserves,
            amount,
            slippage_bps,
        } => commands::simulate(&config, sol_reserves, token_reserves, amount, slippage_bps),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
