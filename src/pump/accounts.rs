//! Pump.fun bonding curve account
//!
//! # WARNING: The layout may change without notice
//! Pump.fun has extended this account before. Only the leading fields are
//! read; if decoding starts failing, check the layout first.

use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::pubkey::Pubkey;

use super::price::Reserves;
use super::program::BONDING_CURVE_ACCOUNT;
use crate::error::{Error, Result};

/// BondingCurve account - stores the bonding curve state for a token
///
/// Accounts are allocated larger than this layout; trailing bytes are ignored.
#[derive(Debug, Clone, BorshDeserialize, BorshSerialize)]
pub struct BondingCurve {
    _discriminator: [u8; 8],

    /// Virtual SOL reserves for price calculation
    pub virtual_sol_reserves: u64,

    /// Virtual token reserves for price calculation
    pub virtual_token_reserves: u64,

    /// Real SOL reserves (actual SOL held in bonding curve)
    pub real_sol_reserves: u64,

    /// Real token reserves (actual tokens held in bonding curve)
    pub real_token_reserves: u64,

    pub token_total_supply: u64,

    /// Whether the bonding curve is complete (migrated off the curve)
    pub complete: bool,

    /// Token creator; their sells are an exit signal for held positions
    pub creator: Pubkey,
}

impl BondingCurve {
    #[cfg(test)]
    pub fn new_for_test(
        virtual_sol_reserves: u64,
        virtual_token_reserves: u64,
        real_sol_reserves: u64,
        complete: bool,
        creator: Pubkey,
    ) -> Self {
        Self {
            _discriminator: *BONDING_CURVE_ACCOUNT,
            virtual_sol_reserves,
            virtual_token_reserves,
            real_sol_reserves,
            real_token_reserves: virtual_token_reserves,
            token_total_supply: virtual_token_reserves,
            complete,
            creator,
        }
    }

    /// Deserialize from account data
    pub fn try_from_slice(data: &[u8]) -> Result<Self> {
        check_discriminator(data, *BONDING_CURVE_ACCOUNT)?;

        // Not `try_from_slice`: that rejects the account's padding bytes
        let mut reader = data;
        BorshDeserialize::deserialize(&mut reader)
            .map_err(|e| Error::BondingCurveDecode(format!("Borsh decode failed: {}", e)))
    }

    /// Virtual reserves used for pricing
    pub fn reserves(&self) -> Reserves {
        Reserves {
            sol: self.virtual_sol_reserves,
            token: self.virtual_token_reserves,
        }
    }
}

fn check_discriminator(data: &[u8], expected: [u8; 8]) -> Result<()> {
    match data.get(..8) {
        Some(head) if head == expected => Ok(()),
        Some(head) => Err(Error::BondingCurveDecode(format!(
            "Not a bonding curve account (discriminator {:?})",
            head
        ))),
        None => Err(Error::BondingCurveDecode(format!(
            "Account data too short: {} bytes",
            data.len()
        ))),
    }
}
