//! Program ids, PDAs and Anchor discriminators
//!
//! Both programs a unit touches (pump.fun and the flash lending program)
//! are Anchor programs: instruction data starts with
//! `SHA-256("global:<name>")[0..8]`, account data with
//! `SHA-256("account:<Type>")[0..8]`. Discriminators are derived from those
//! names once at startup rather than hardcoded.

use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;

/// Pump.fun program ID
pub const PUMP_PROGRAM_ID_STR: &str = "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P";

/// Receives the venue fee on every swap
pub const FEE_RECIPIENT_STR: &str = "CebN5WGQ4jvEPvsVU4EoHEpgzq1VV7AbicfhtW4xC9iM";

/// Virtual reserves of a freshly created curve
pub const INITIAL_VIRTUAL_SOL_RESERVES: u64 = 30_000_000_000;
pub const INITIAL_VIRTUAL_TOKEN_RESERVES: u64 = 1_073_000_000_000_000;

lazy_static::lazy_static! {
    pub static ref PUMP_PROGRAM_ID: Pubkey =
        Pubkey::from_str(PUMP_PROGRAM_ID_STR).expect("Invalid pump program ID");

    pub static ref FEE_RECIPIENT: Pubkey =
        Pubkey::from_str(FEE_RECIPIENT_STR).expect("Invalid fee recipient");

    pub static ref GLOBAL_PDA: Pubkey =
        Pubkey::find_program_address(&[b"global"], &PUMP_PROGRAM_ID).0;

    pub static ref EVENT_AUTHORITY_PDA: Pubkey =
        Pubkey::find_program_address(&[b"__event_authority"], &PUMP_PROGRAM_ID).0;

    pub static ref BONDING_CURVE_ACCOUNT: [u8; 8] = anchor_discriminator("account", "BondingCurve");

    static ref OP_TABLE: Vec<(ProgramOp, [u8; 8])> = ProgramOp::ALL
        .iter()
        .map(|op| (*op, anchor_discriminator("global", op.name())))
        .collect();
}

/// Instructions the engine reads from the feed or writes into units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramOp {
    Create,
    Buy,
    Sell,
    FlashBorrow,
    FlashRepay,
}

impl ProgramOp {
    pub const ALL: [ProgramOp; 5] = [
        ProgramOp::Create,
        ProgramOp::Buy,
        ProgramOp::Sell,
        ProgramOp::FlashBorrow,
        ProgramOp::FlashRepay,
    ];

    /// Anchor instruction name
    pub fn name(self) -> &'static str {
        match self {
            ProgramOp::Create => "create",
            ProgramOp::Buy => "buy",
            ProgramOp::Sell => "sell",
            ProgramOp::FlashBorrow => "flash_borrow",
            ProgramOp::FlashRepay => "flash_repay",
        }
    }

    pub fn is_pump(self) -> bool {
        matches!(self, ProgramOp::Create | ProgramOp::Buy | ProgramOp::Sell)
    }

    pub fn discriminator(self) -> [u8; 8] {
        OP_TABLE
            .iter()
            .find(|(op, _)| *op == self)
            .map(|(_, d)| *d)
            .unwrap_or_else(|| anchor_discriminator("global", self.name()))
    }

    /// Identify a pump.fun instruction from its data
    pub fn from_pump_data(data: &[u8]) -> Option<ProgramOp> {
        let head = data.get(..8)?;
        OP_TABLE
            .iter()
            .find(|(op, d)| op.is_pump() && d[..] == *head)
            .map(|(op, _)| *op)
    }
}

impl std::fmt::Display for ProgramOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// `SHA-256("<namespace>:<name>")[0..8]`
pub fn anchor_discriminator(namespace: &str, name: &str) -> [u8; 8] {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(format!("{}:{}", namespace, name).as_bytes());
    let mut discriminator = [0u8; 8];
    discriminator.copy_from_slice(&hash[..8]);
    discriminator
}
