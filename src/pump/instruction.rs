//! Pump.fun instruction data and account layouts
//!
//! Arguments are borsh-encoded after the 8-byte discriminator. Observed
//! instructions may carry trailing optional arguments the engine does not
//! read, so decoding stops after the known fields.

use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::pubkey::Pubkey;

use super::program::ProgramOp;
use crate::error::{Error, Result};

/// Decoded pump.fun instruction
#[derive(Debug, Clone)]
pub enum PumpInstruction {
    Create(CreateInstruction),
    Buy(BuyInstruction),
    Sell(SellInstruction),
    /// Recognized program, instruction the engine does not act on
    Other([u8; 8]),
}

impl PumpInstruction {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let Some(head) = data.get(..8) else {
            return Err(Error::InvalidInstruction(format!(
                "{} bytes is shorter than a discriminator",
                data.len()
            )));
        };
        let args = &data[8..];

        match ProgramOp::from_pump_data(data) {
            Some(ProgramOp::Create) => decode_args(ProgramOp::Create, args).map(Self::Create),
            Some(ProgramOp::Buy) => decode_args(ProgramOp::Buy, args).map(Self::Buy),
            Some(ProgramOp::Sell) => decode_args(ProgramOp::Sell, args).map(Self::Sell),
            _ => {
                let mut discriminator = [0u8; 8];
                discriminator.copy_from_slice(head);
                Ok(Self::Other(discriminator))
            }
        }
    }
}

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub struct CreateInstruction {
    pub name: String,
    pub symbol: String,
    pub uri: String,
}

/// Exact tokens out, SOL ceiling
#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub struct BuyInstruction {
    pub amount: u64,
    pub max_sol_cost: u64,
}

impl BuyInstruction {
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(ProgramOp::Buy, self)
    }
}

/// Exact tokens in, SOL floor
#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub struct SellInstruction {
    pub amount: u64,
    pub min_sol_output: u64,
}

impl SellInstruction {
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(ProgramOp::Sell, self)
    }
}

fn encode<T: BorshSerialize>(op: ProgramOp, args: &T) -> Vec<u8> {
    let mut data = op.discriminator().to_vec();
    // Writing into a Vec cannot fail
    let _ = args.serialize(&mut data);
    data
}

fn decode_args<T: BorshDeserialize>(op: ProgramOp, mut args: &[u8]) -> Result<T> {
    T::deserialize(&mut args)
        .map_err(|e| Error::InvalidInstruction(format!("{} arguments: {}", op, e)))
}

/// Account positions shared by buy and sell
pub mod swap_accounts {
    pub const MINT: usize = 2;
    pub const BONDING_CURVE: usize = 3;
    pub const USER: usize = 6;
    pub const LEN: usize = 12;
}

/// Account positions of create
pub mod create_accounts {
    pub const MINT: usize = 0;
    pub const BONDING_CURVE: usize = 2;
    pub const USER: usize = 7;
    pub const LEN: usize = 14;
}

/// The accounts of an observed instruction the engine cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionAccounts {
    pub mint: Pubkey,
    pub bonding_curve: Pubkey,
    /// Trader for swaps, creator for create
    pub user: Pubkey,
}

impl InstructionAccounts {
    pub fn swap(accounts: &[Pubkey]) -> Result<Self> {
        require_len("swap", accounts, swap_accounts::LEN)?;
        Ok(Self {
            mint: accounts[swap_accounts::MINT],
            bonding_curve: accounts[swap_accounts::BONDING_CURVE],
            user: accounts[swap_accounts::USER],
        })
    }

    pub fn create(accounts: &[Pubkey]) -> Result<Self> {
        require_len("create", accounts, create_accounts::LEN)?;
        Ok(Self {
            mint: accounts[create_accounts::MINT],
            bonding_curve: accounts[create_accounts::BONDING_CURVE],
            user: accounts[create_accounts::USER],
        })
    }
}

fn require_len(kind: &str, accounts: &[Pubkey], len: usize) -> Result<()> {
    if accounts.len() < len {
        return Err(Error::InvalidInstruction(format!(
            "{} needs {} accounts, got {}",
            kind,
            len,
            accounts.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buy_round_trip_with_trailing_args() {
        let mut data = BuyInstruction {
            amount: 1_000_000,
            max_sol_cost: 500_000_000,
        }
        .to_bytes();
        // Newer clients append an optional flag
        data.push(1);

        match PumpInstruction::parse(&data).unwrap() {
            PumpInstruction::Buy(buy) => {
                assert_eq!(buy.amount, 1_000_000);
                assert_eq!(buy.max_sol_cost, 500_000_000);
            }
            other => panic!("Expected Buy, got {:?}", other),
        }
    }

    #[test]
    fn test_sell_encoding_layout() {
        let data = SellInstruction {
            amount: 42,
            min_sol_output: 7,
        }
        .to_bytes();
        assert_eq!(data.len(), 24);
        assert_eq!(&data[..8], &ProgramOp::Sell.discriminator());
        assert_eq!(u64::from_le_bytes(data[8..16].try_into().unwrap()), 42);
    }

    #[test]
    fn test_truncated_args_rejected() {
        let mut data = ProgramOp::Buy.discriminator().to_vec();
        data.extend_from_slice(&[1, 2, 3]);
        assert!(PumpInstruction::parse(&data).is_err());
        assert!(PumpInstruction::parse(&[1, 2]).is_err());
    }

    #[test]
    fn test_parse_create() {
        let mut data = ProgramOp::Create.discriminator().to_vec();
        for s in ["Token", "TKN", "https://x"] {
            data.extend_from_slice(&(s.len() as u32).to_le_bytes());
            data.extend_from_slice(s.as_bytes());
        }
        match PumpInstruction::parse(&data).unwrap() {
            PumpInstruction::Create(create) => assert_eq!(create.symbol, "TKN"),
            other => panic!("Expected Create, got {:?}", other),
        }
    }

    #[test]
    fn test_other_instruction_kept() {
        let data = [9u8, 9, 9, 9, 9, 9, 9, 9, 1];
        assert!(matches!(
            PumpInstruction::parse(&data).unwrap(),
            PumpInstruction::Other(d) if d == [9u8; 8]
        ));
    }

    #[test]
    fn test_account_layouts() {
        let keys: Vec<Pubkey> = (0..14).map(|_| Pubkey::new_unique()).collect();
        let swap = InstructionAccounts::swap(&keys).unwrap();
        assert_eq!(swap.bonding_curve, keys[3]);
        assert_eq!(swap.user, keys[6]);

        let create = InstructionAccounts::create(&keys).unwrap();
        assert_eq!(create.mint, keys[0]);
        assert!(InstructionAccounts::create(&keys[..12]).is_err());
    }
}
