//! Shared types for intent evaluation
//!
//! A `SwapIntent` is what the listener observed; an `Opportunity` is what
//! the evaluator decided to act on. Both are immutable once built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use uuid::Uuid;

/// Swap direction from the trader's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Buy,
    Sell,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Buy => write!(f, "buy"),
            Direction::Sell => write!(f, "sell"),
        }
    }
}

/// Whether the swap has been observed before or after confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStage {
    Pending,
    Confirmed,
}

/// What a pump.fun buy instruction actually commits to: exact tokens out
/// and a SOL ceiling. The transaction fails on chain once the cost of
/// `tokens` exceeds `max_sol_cost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyLimit {
    pub tokens: u64,
    pub max_sol_cost: u64,
}

/// A swap observed on the venue, normalized against pool reserves
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapIntent {
    /// Transaction signature
    pub id: String,
    /// Trader wallet
    pub source: Pubkey,
    /// Bonding curve account
    pub pool: Pubkey,
    pub mint: Pubkey,
    pub direction: Direction,
    /// Declared input: lamports for a buy, token units for a sell
    pub amount: u64,
    /// Declared tolerance, in bps of the quote at observation time
    pub slippage_bps: u32,
    /// On-chain limit of a decoded buy instruction
    #[serde(default)]
    pub limit: Option<BuyLimit>,
    pub stage: IntentStage,
    pub slot: u64,
    pub observed_at: DateTime<Utc>,
    /// Signed transaction, when the source forwarded it
    #[serde(skip)]
    pub raw_transaction: Option<Vec<u8>>,
}

impl SwapIntent {
    pub fn is_pending_buy(&self) -> bool {
        self.stage == IntentStage::Pending && self.direction == Direction::Buy
    }
}

/// Costs charged against gross profit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub loan_fee: u64,
    /// Worst case: the bribe may climb all the way to the ceiling
    pub priority_fee_ceiling: u64,
    pub network_fee: u64,
}

impl CostBreakdown {
    pub fn total(&self) -> u64 {
        self.loan_fee
            .saturating_add(self.priority_fee_ceiling)
            .saturating_add(self.network_fee)
    }
}

/// A sized, profitable sandwich around one target intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub intent_id: String,
    pub pool: Pubkey,
    pub mint: Pubkey,
    /// Flashloan principal spent on the front-run
    pub front_run_lamports: u64,
    pub front_run_tokens: u64,
    /// Tokens sold back after the target
    pub back_run_tokens: u64,
    /// Tokens kept as a held position
    pub retained_tokens: u64,
    /// Back-run SOL proceeds, net of venue fee
    pub expected_proceeds: u64,
    /// `expected_proceeds - front_run_lamports`
    pub gross_profit: i128,
    pub estimated_cost: CostBreakdown,
    pub net_profit: i128,
    /// Front-run output floor (exact simulated output)
    pub min_front_tokens: u64,
    /// Back-run proceeds floor; at least what the loan needs back
    pub min_back_proceeds: u64,
    pub expiry_slot: u64,
    pub computed_at: DateTime<Utc>,
    /// Target transaction to bundle between the two legs
    #[serde(skip)]
    pub target_transaction: Option<Vec<u8>>,
}

impl Opportunity {
    /// An opportunity is only actionable within its slot window
    pub fn is_live(&self, slot: u64) -> bool {
        slot <= self.expiry_slot
    }
}
