//! CLI command implementations

use anyhow::{Context, Result};
use chrono::Utc;
use dialoguer::Confirm;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signer::Signer;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigHandle};
use crate::engine::runner::SandwichEngine;
use crate::engine::status::StatusUpdate;
use crate::pump::price::{bps_of, lamports_to_sol, sol_to_lamports, Reserves};
use crate::strategy::evaluator::{EvaluatorParams, OpportunityEvaluator};
use crate::strategy::pool_book::PoolState;
use crate::strategy::types::{BuyLimit, Direction, IntentStage, SwapIntent};
use crate::stream::listener::VenueFeed;
use crate::stream::pumpportal::PumpPortalFeed;
use crate::trading::jito::JitoVenue;
use crate::trading::tips::TipManager;
use crate::trading::venue::{DryRunVenue, ExecutionVenue, SlotClock};
use crate::wallet::load_keypair;

/// Simulated operator balance for dry runs
const DRY_RUN_BALANCE_SOL: f64 = 10.0;

/// Start the engine
pub async fn start(config: &Config, dry_run: bool, yes: bool) -> Result<()> {
    let feed: Arc<dyn VenueFeed> = Arc::new(PumpPortalFeed::new(config.feed.clone()));

    let venue: Arc<dyn ExecutionVenue> = if dry_run {
        warn!("Running in DRY-RUN mode - units settle in memory, nothing is broadcast");
        let base_slot = match rpc_client(config).get_slot().await {
            Ok(slot) => slot,
            Err(e) => {
                warn!("Could not read current slot, dry-run clock starts at 0: {}", e);
                0
            }
        };
        Arc::new(DryRunVenue::new(
            sol_to_lamports(DRY_RUN_BALANCE_SOL),
            SlotClock::wall(base_slot),
        ))
    } else {
        let keypair = load_keypair(Path::new(&config.venue.keypair_path))?;
        info!("Operator: {}", keypair.pubkey());

        if !yes {
            let confirmed = Confirm::new()
                .with_prompt(format!(
                    "Start LIVE sandwich engine with a {} lamport bribe ceiling?",
                    config.engine.priority_fee_ceiling_lamports
                ))
                .default(false)
                .interact()?;
            if !confirmed {
                println!("Cancelled.");
                return Ok(());
            }
        }

        Arc::new(JitoVenue::new(config, keypair)?)
    };

    info!(
        "Balance threshold: {} SOL, increment: {} SOL, ceiling: {} lamports",
        config.engine.balance_threshold_sol,
        config.engine.flashloan_increment_sol,
        config.engine.priority_fee_ceiling_lamports
    );

    let engine = Arc::new(SandwichEngine::new(
        ConfigHandle::new(config.clone()),
        venue,
        feed,
    ));

    // Status stream goes to the log as JSON lines
    let mut updates = engine.status().subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => log_status(&update),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Status stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let control = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; stopping after in-flight units resolve");
            control.stop();
        }
    });

    let stats = engine.run().await?;

    println!("\n=== SESSION SUMMARY ===\n");
    println!("Landed:    {}", stats.units_landed);
    println!("Reverted:  {}", stats.units_reverted);
    println!("Expired:   {}", stats.units_expired);
    println!("Exits:     {}", stats.exits_closed);
    println!("Win rate:  {:.1}%", stats.win_rate());
    println!("Net P&L:   {:.6} SOL", stats.net_pnl as f64 / 1e9);
    println!("Fees lost: {:.6} SOL", lamports_to_sol(stats.fees_lost));

    let open = engine.positions().held().await;
    if !open.is_empty() {
        println!("\n=== POSITIONS STILL HELD ===\n");
        for position in open {
            println!(
                "{}  mint={}  tokens={}  cost={:.6} SOL",
                position.id,
                position.mint,
                position.acquisition_tokens,
                lamports_to_sol(position.acquisition_cost)
            );
        }
    }

    Ok(())
}

fn log_status(update: &StatusUpdate) {
    match serde_json::to_string(update) {
        Ok(json) => match update {
            StatusUpdate::OperatorAlert { .. } => error!(target: "status", "{}", json),
            StatusUpdate::BidPlaced { .. } => debug!(target: "status", "{}", json),
            _ => info!(target: "status", "{}", json),
        },
        Err(e) => warn!("Unserializable status update: {}", e),
    }
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Check system health
pub async fn health(config: &Config) -> Result<()> {
    println!("\n=== SYSTEM HEALTH CHECK ===\n");

    let mut all_healthy = true;

    print!("RPC Endpoint... ");
    match check_rpc(config).await {
        Ok(latency) => println!("OK ({}ms)", latency),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    print!("Venue feed... ");
    match check_feed(config).await {
        Ok(_) => println!("OK"),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    print!("Jito tip floor... ");
    match check_jito(config).await {
        Ok(p50) => println!("OK (p50 tip: {} lamports)", p50),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    print!("Lending reserve... ");
    match check_lending_reserve(config).await {
        Ok(capacity) => println!("OK ({:.3} SOL available)", lamports_to_sol(capacity)),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    print!("Keypair... ");
    match check_keypair(config).await {
        Ok(balance) => println!("OK (balance: {} SOL)", balance),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    println!();
    if all_healthy {
        println!("All systems healthy!");
    } else {
        println!("Some systems are unhealthy. Check the errors above.");
    }

    Ok(())
}

fn rpc_client(config: &Config) -> RpcClient {
    RpcClient::new_with_timeout(
        config.rpc.endpoint.clone(),
        Duration::from_millis(config.rpc.timeout_ms),
    )
}

async fn check_rpc(config: &Config) -> Result<u64> {
    let client = rpc_client(config);
    let start = Instant::now();
    client.get_slot().await?;
    Ok(start.elapsed().as_millis() as u64)
}

async fn check_feed(config: &Config) -> Result<()> {
    let feed = PumpPortalFeed::new(config.feed.clone());
    let timeout = Duration::from_millis(config.feed.connect_timeout_ms);

    match tokio::time::timeout(timeout, feed.open_session()).await {
        // Dropping the receiver closes the session
        Ok(Ok(_session)) => Ok(()),
        Ok(Err(e)) => Err(anyhow::anyhow!("Connection failed: {}", e)),
        Err(_) => Err(anyhow::anyhow!("Connection timed out after {}ms", timeout.as_millis())),
    }
}

async fn check_jito(config: &Config) -> Result<u64> {
    let tips = TipManager::new(config.jito.clone()).fetch_tips().await?;
    Ok(tips.p50)
}

async fn check_lending_reserve(config: &Config) -> Result<u64> {
    let reserve: Pubkey = config
        .venue
        .lending_reserve
        .parse()
        .context("Invalid lending reserve")?;
    Ok(rpc_client(config).get_balance(&reserve).await?)
}

async fn check_keypair(config: &Config) -> Result<f64> {
    let keypair = load_keypair(Path::new(&config.venue.keypair_path))?;
    let balance = rpc_client(config).get_balance(&keypair.pubkey()).await?;
    Ok(lamports_to_sol(balance))
}

/// Evaluate one hypothetical target buy against the given reserves
pub fn simulate(
    config: &Config,
    sol_reserves: f64,
    token_reserves: u64,
    amount_sol: f64,
    slippage_bps: u32,
) -> Result<()> {
    let pool = PoolState {
        pool: Pubkey::new_unique(),
        mint: Pubkey::new_unique(),
        creator: None,
        reserves: Reserves {
            sol: sol_to_lamports(sol_reserves),
            token: token_reserves,
        },
        real_sol_reserves: 0,
        complete: false,
        slot: 0,
    };
    // Same shape a wallet sends: the tokens the SOL buys now, SOL ceiling on top
    let amount = sol_to_lamports(amount_sol);
    let venue_fee_bps = config.venue.venue_fee_bps;
    let tokens = pool
        .reserves
        .buy(amount, venue_fee_bps)
        .context("Reserves cannot price this buy")?
        .amount_out;
    let cost = pool
        .reserves
        .buy_cost(tokens, venue_fee_bps)
        .context("Reserves cannot price this buy")?;
    let intent = SwapIntent {
        id: "simulated".to_string(),
        source: Pubkey::new_unique(),
        pool: pool.pool,
        mint: pool.mint,
        direction: Direction::Buy,
        amount: cost,
        slippage_bps,
        limit: Some(BuyLimit {
            tokens,
            max_sol_cost: cost.saturating_add(bps_of(cost, slippage_bps)),
        }),
        stage: IntentStage::Pending,
        slot: 0,
        observed_at: Utc::now(),
        raw_transaction: None,
    };

    let evaluator = OpportunityEvaluator::new(EvaluatorParams::from_config(config));
    println!("\n=== SANDWICH SIMULATION ===\n");
    println!(
        "Pool: {} SOL / {} tokens, target buy {} SOL at {}bps tolerance",
        sol_reserves, token_reserves, amount_sol, slippage_bps
    );

    match evaluator.assess(&intent, &pool) {
        Ok(opp) => {
            println!("\nACCEPTED");
            println!("  Front-run:        {:.4} SOL", lamports_to_sol(opp.front_run_lamports));
            println!("  Front tokens:     {}", opp.front_run_tokens);
            println!("  Back-run tokens:  {}", opp.back_run_tokens);
            println!("  Retained tokens:  {}", opp.retained_tokens);
            println!("  Back proceeds:    {:.6} SOL", lamports_to_sol(opp.expected_proceeds));
            println!("  Gross profit:     {:.6} SOL", opp.gross_profit as f64 / 1e9);
            println!("  Loan fee:         {} lamports", opp.estimated_cost.loan_fee);
            println!("  Bribe ceiling:    {} lamports", opp.estimated_cost.priority_fee_ceiling);
            println!("  Network fee:      {} lamports", opp.estimated_cost.network_fee);
            println!("  Net profit:       {:.6} SOL", opp.net_profit as f64 / 1e9);
            println!("  Back-sell floor:  {:.6} SOL", lamports_to_sol(opp.min_back_proceeds));
        }
        Err(reason) => println!("\nREJECTED: {}", reason),
    }

    Ok(())
}
