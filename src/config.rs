//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

use crate::pump::price::sol_to_lamports;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub rpc: RpcConfig,
    pub jito: JitoConfig,
    pub feed: FeedConfig,
    pub backpressure: BackpressureConfig,
    pub engine: EngineConfig,
    #[serde(default)]
    pub venue: VenueConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub exits: ExitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_ws_endpoint")]
    pub ws_endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JitoConfig {
    #[serde(default = "default_jito_url")]
    pub block_engine_url: String,
    #[serde(default = "default_tip_floor_url")]
    pub tip_floor_url: String,
    #[serde(default = "default_tip_percentile")]
    pub tip_percentile: u32,
    #[serde(default = "default_min_tip")]
    pub min_tip_lamports: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

/// Venue feed (PumpPortal WebSocket) settings
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Signatures remembered across reconnects for dedup
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Mints whose trades are streamed in addition to new-token events
    #[serde(default)]
    pub watch_mints: Vec<String>,
    /// Pools with no update for this long leave the pool book
    #[serde(default = "default_pool_idle_secs")]
    pub pool_idle_secs: u64,
    /// How long a slot-stamped snapshot outranks updates that carry no slot
    #[serde(default = "default_slotless_grace_ms")]
    pub slotless_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_drop_policy")]
    pub drop_policy: DropPolicy,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest unevaluated intent; stale intents are worthless
    DropOldest,
    /// Refuse the incoming intent
    DropNewest,
}

/// Operator configuration: the risk bounds the engine must never exceed
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Largest front-run the engine will size
    #[serde(default = "default_balance_threshold_sol")]
    pub balance_threshold_sol: f64,
    /// Flashloan principal is borrowed in multiples of this size
    #[serde(default = "default_flashloan_increment_sol")]
    pub flashloan_increment_sol: f64,
    /// Hard ceiling for the priority fee (bribe) of one attempt
    #[serde(default = "default_priority_fee_ceiling")]
    pub priority_fee_ceiling_lamports: u64,
    /// Minimum net profit, in bps of the front-run principal
    #[serde(default = "default_min_profit_margin_bps")]
    pub min_profit_margin_bps: u32,
    /// Share of front-run tokens kept as a held position
    #[serde(default)]
    pub retain_bps: u32,
    /// Slots an opportunity stays valid after the target was observed
    #[serde(default = "default_opportunity_window_slots")]
    pub opportunity_window_slots: u64,
    /// Smallest bid increase on re-broadcast
    #[serde(default = "default_escalation_min_step")]
    pub escalation_min_step_lamports: u64,
    #[serde(default = "default_max_concurrent_attempts")]
    pub max_concurrent_attempts: usize,
}

impl EngineConfig {
    pub fn balance_threshold_lamports(&self) -> u64 {
        sol_to_lamports(self.balance_threshold_sol)
    }

    pub fn flashloan_increment_lamports(&self) -> u64 {
        sol_to_lamports(self.flashloan_increment_sol)
    }
}

/// Venue-specific constants supplied by the on-chain collaborator
#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    /// Trading fee charged on the SOL leg of every swap
    #[serde(default = "default_venue_fee_bps")]
    pub venue_fee_bps: u32,
    #[serde(default = "default_loan_fee_bps")]
    pub loan_fee_bps: u32,
    /// Base network fee for the whole bundle; the only non-reversible cost
    #[serde(default = "default_network_fee")]
    pub network_fee_lamports: u64,
    /// Real SOL reserves at which a curve graduates
    #[serde(default = "default_graduation_threshold_sol")]
    pub graduation_threshold_sol: f64,
    /// Collateral posted per loan, in bps of the principal
    #[serde(default = "default_collateral_bps")]
    pub collateral_bps: u32,
    #[serde(default = "default_lending_program")]
    pub lending_program_id: String,
    #[serde(default = "default_lending_reserve")]
    pub lending_reserve: String,
    /// Operator keypair (JSON byte array), used only by the live venue
    #[serde(default = "default_keypair_path")]
    pub keypair_path: String,
}

impl VenueConfig {
    pub fn graduation_threshold_lamports(&self) -> u64 {
        sol_to_lamports(self.graduation_threshold_sol)
    }
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            venue_fee_bps: default_venue_fee_bps(),
            loan_fee_bps: default_loan_fee_bps(),
            network_fee_lamports: default_network_fee(),
            graduation_threshold_sol: default_graduation_threshold_sol(),
            collateral_bps: default_collateral_bps(),
            lending_program_id: default_lending_program(),
            lending_reserve: default_lending_reserve(),
            keypair_path: default_keypair_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    /// Grace period after the expiry slot before an outcome is called ambiguous
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Allowed gap between estimated and realized profit
    #[serde(default = "default_estimate_tolerance_bps")]
    pub estimate_tolerance_bps: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: default_confirm_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            estimate_tolerance_bps: default_estimate_tolerance_bps(),
        }
    }
}

/// Exit triggers for held positions
#[derive(Debug, Clone, Deserialize)]
pub struct ExitConfig {
    /// Sell ahead of a pending sell by the token's creator
    #[serde(default = "default_true")]
    pub front_run_dev_sells: bool,
    /// Sell once the curve crosses the graduation threshold
    #[serde(default = "default_true")]
    pub exit_on_graduation: bool,
    #[serde(default = "default_exit_slippage_bps")]
    pub exit_slippage_bps: u32,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            front_run_dev_sells: true,
            exit_on_graduation: true,
            exit_slippage_bps: default_exit_slippage_bps(),
        }
    }
}

// Default value functions
fn default_rpc_endpoint() -> String {
    std::env::var("RPC_ENDPOINT").unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".into())
}

fn default_ws_endpoint() -> String {
    std::env::var("RPC_WS_ENDPOINT").unwrap_or_else(|_| "wss://api.mainnet-beta.solana.com".into())
}

fn default_timeout_ms() -> u64 {
    30000
}

fn default_max_retries() -> u32 {
    3
}

fn default_jito_url() -> String {
    std::env::var("JITO_BLOCK_ENGINE_URL")
        .unwrap_or_else(|_| "https://ny.mainnet.block-engine.jito.wtf".into())
}

fn default_tip_floor_url() -> String {
    "https://bundles.jito.wtf/api/v1/bundles/tip_floor".into()
}

fn default_tip_percentile() -> u32 {
    50
}

fn default_min_tip() -> u64 {
    10000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    50
}

fn default_feed_ws_url() -> String {
    "wss://pumpportal.fun/api/data".into()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_dedup_capacity() -> usize {
    4096
}

fn default_pool_idle_secs() -> u64 {
    1800
}

fn default_slotless_grace_ms() -> u64 {
    2000
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_drop_policy() -> DropPolicy {
    DropPolicy::DropOldest
}

fn default_balance_threshold_sol() -> f64 {
    2.0
}

fn default_flashloan_increment_sol() -> f64 {
    0.1
}

fn default_priority_fee_ceiling() -> u64 {
    5_000_000
}

fn default_min_profit_margin_bps() -> u32 {
    200
}

fn default_opportunity_window_slots() -> u64 {
    4
}

fn default_escalation_min_step() -> u64 {
    5000
}

fn default_max_concurrent_attempts() -> usize {
    8
}

fn default_venue_fee_bps() -> u32 {
    100
}

fn default_loan_fee_bps() -> u32 {
    9
}

fn default_network_fee() -> u64 {
    10000
}

fn default_graduation_threshold_sol() -> f64 {
    85.0
}

fn default_collateral_bps() -> u32 {
    0
}

fn default_lending_program() -> String {
    "So1endDq2YkqhipRh3WViPa8hdiSpxWy6z3Z6tMCpAo".into()
}

fn default_lending_reserve() -> String {
    "8PbodeaosQP19SjYFx855UMqWxH2HynZLdBXmsrbac36".into()
}

fn default_keypair_path() -> String {
    "operator.json".into()
}

fn default_confirm_timeout_ms() -> u64 {
    4000
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_estimate_tolerance_bps() -> u32 {
    500
}

fn default_exit_slippage_bps() -> u32 {
    1500
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("rpc.endpoint", default_rpc_endpoint())?
            .set_default("rpc.ws_endpoint", default_ws_endpoint())?
            .set_default("rpc.timeout_ms", default_timeout_ms() as i64)?
            .set_default("rpc.max_retries", default_max_retries() as i64)?
            .set_default("jito.block_engine_url", default_jito_url())?
            .set_default("feed.ws_url", default_feed_ws_url())?
            .set_default("backpressure.channel_capacity", default_channel_capacity() as i64)?
            .set_default("engine.balance_threshold_sol", default_balance_threshold_sol())?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix SANDWICH_)
            .add_source(
                config::Environment::with_prefix("SANDWICH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;

        if engine.balance_threshold_sol <= 0.0 {
            anyhow::bail!("balance_threshold_sol must be positive");
        }

        if engine.flashloan_increment_sol <= 0.0 {
            anyhow::bail!("flashloan_increment_sol must be positive");
        }

        if engine.flashloan_increment_sol > engine.balance_threshold_sol {
            anyhow::bail!(
                "flashloan_increment_sol ({}) exceeds balance_threshold_sol ({})",
                engine.flashloan_increment_sol,
                engine.balance_threshold_sol
            );
        }

        // A zero margin leaves no room for estimation error
        if engine.min_profit_margin_bps == 0 {
            anyhow::bail!("min_profit_margin_bps must be greater than zero");
        }

        if engine.retain_bps >= 10000 {
            anyhow::bail!("retain_bps must be below 10000 (something has to repay the loan)");
        }

        // Zero would sweep every pool the moment it arrives
        if self.feed.pool_idle_secs == 0 {
            anyhow::bail!("feed.pool_idle_secs must be greater than zero");
        }

        if engine.priority_fee_ceiling_lamports < self.jito.min_tip_lamports {
            return Err(crate::error::Error::CeilingBelowMinimumBid {
                ceiling: engine.priority_fee_ceiling_lamports,
                minimum: self.jito.min_tip_lamports,
            }
            .into());
        }

        if engine.opportunity_window_slots == 0 {
            anyhow::bail!("opportunity_window_slots must be at least 1");
        }

        if engine.max_concurrent_attempts == 0 {
            anyhow::bail!("max_concurrent_attempts must be at least 1");
        }

        if self.venue.venue_fee_bps >= 10000 || self.venue.loan_fee_bps >= 10000 {
            anyhow::bail!("venue_fee_bps and loan_fee_bps must be below 10000");
        }

        if self.exits.exit_slippage_bps > 10000 {
            anyhow::bail!("exit_slippage_bps cannot exceed 10000 (100%)");
        }

        if self.backpressure.channel_capacity == 0 {
            anyhow::bail!("backpressure.channel_capacity must be positive");
        }

        if self.backpressure.drop_policy == DropPolicy::DropNewest {
            tracing::warn!(
                "Backpressure drop_policy is 'drop_newest' - stale intents will crowd out fresh ones"
            );
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  RPC:
    endpoint: {}
    timeout: {}ms
  Jito:
    block_engine: {}
    tip_percentile: {}
    min_tip: {} lamports
  Feed:
    ws_url: {}
    reconnect_delay: {}ms
  Engine:
    balance_threshold: {} SOL
    flashloan_increment: {} SOL
    priority_fee_ceiling: {} lamports
    min_profit_margin: {}bps
    retain: {}bps
    opportunity_window: {} slots
  Venue:
    venue_fee: {}bps
    loan_fee: {}bps
    graduation_threshold: {} SOL
"#,
            mask_url(&self.rpc.endpoint),
            self.rpc.timeout_ms,
            mask_url(&self.jito.block_engine_url),
            self.jito.tip_percentile,
            self.jito.min_tip_lamports,
            mask_url(&self.feed.ws_url),
            self.feed.reconnect_delay_ms,
            self.engine.balance_threshold_sol,
            self.engine.flashloan_increment_sol,
            self.engine.priority_fee_ceiling_lamports,
            self.engine.min_profit_margin_bps,
            self.engine.retain_bps,
            self.engine.opportunity_window_slots,
            self.venue.venue_fee_bps,
            self.venue.loan_fee_bps,
            self.venue.graduation_threshold_sol,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc: RpcConfig {
                endpoint: default_rpc_endpoint(),
                ws_endpoint: default_ws_endpoint(),
                timeout_ms: default_timeout_ms(),
                max_retries: default_max_retries(),
            },
            jito: JitoConfig {
                block_engine_url: default_jito_url(),
                tip_floor_url: default_tip_floor_url(),
                tip_percentile: default_tip_percentile(),
                min_tip_lamports: default_min_tip(),
                retry_attempts: default_retry_attempts(),
                retry_base_delay_ms: default_retry_base_delay_ms(),
            },
            feed: FeedConfig {
                ws_url: default_feed_ws_url(),
                reconnect_delay_ms: default_reconnect_delay_ms(),
                connect_timeout_ms: default_connect_timeout_ms(),
                ping_interval_secs: default_ping_interval_secs(),
                dedup_capacity: default_dedup_capacity(),
                watch_mints: vec![],
                pool_idle_secs: default_pool_idle_secs(),
                slotless_grace_ms: default_slotless_grace_ms(),
            },
            backpressure: BackpressureConfig {
                channel_capacity: default_channel_capacity(),
                drop_policy: default_drop_policy(),
            },
            engine: EngineConfig {
                balance_threshold_sol: default_balance_threshold_sol(),
                flashloan_increment_sol: default_flashloan_increment_sol(),
                priority_fee_ceiling_lamports: default_priority_fee_ceiling(),
                min_profit_margin_bps: default_min_profit_margin_bps(),
                retain_bps: 0,
                opportunity_window_slots: default_opportunity_window_slots(),
                escalation_min_step_lamports: default_escalation_min_step(),
                max_concurrent_attempts: default_max_concurrent_attempts(),
            },
            venue: VenueConfig::default(),
            settlement: SettlementConfig::default(),
            exits: ExitConfig::default(),
        }
    }
}

/// Shared handle to the current configuration
///
/// Every evaluation cycle works on one immutable snapshot. `replace` only
/// affects snapshots taken afterwards; in-flight opportunities keep theirs.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// Current configuration snapshot
    pub fn snapshot(&self) -> Arc<Config> {
        self.tx.borrow().clone()
    }

    /// Validate and install a new configuration for subsequent cycles
    pub fn replace(&self, config: Config) -> Result<()> {
        config.validate()?;
        self.tx.send_replace(Arc::new(config));
        tracing::info!("Configuration replaced; applies from the next evaluation cycle");
        Ok(())
    }
}
