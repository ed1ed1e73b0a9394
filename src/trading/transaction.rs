//! Transaction building for atomic units
//!
//! A sandwich unit becomes two legs around the target: the front leg
//! borrows and buys, the back leg sells, repays and tips. An exit unit is a
//! single back leg.

use solana_sdk::{
    compute_budget::ComputeBudgetInstruction,
    hash::Hash,
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    signature::Keypair,
    signer::Signer,
    system_instruction,
    transaction::Transaction,
};
use std::str::FromStr;

use super::orchestrator::{AtomicUnit, UnitStep};
use crate::config::VenueConfig;
use crate::error::{Error, Result};
use crate::pump::instruction::{BuyInstruction, SellInstruction};
use crate::pump::program::{
    ProgramOp, EVENT_AUTHORITY_PDA, FEE_RECIPIENT, GLOBAL_PDA, PUMP_PROGRAM_ID,
};

/// Instructions for each leg of a unit
#[derive(Debug, Clone, Default)]
pub struct UnitLegs {
    /// Empty for exits
    pub front: Vec<Instruction>,
    pub back: Vec<Instruction>,
}

impl UnitLegs {
    /// Sign each non-empty leg with the operator as fee payer
    pub fn into_transactions(self, payer: &Keypair, recent_blockhash: Hash) -> Vec<Transaction> {
        [self.front, self.back]
            .into_iter()
            .filter(|leg| !leg.is_empty())
            .map(|leg| {
                Transaction::new_signed_with_payer(
                    &leg,
                    Some(&payer.pubkey()),
                    &[payer],
                    recent_blockhash,
                )
            })
            .collect()
    }
}

/// Encodes unit steps into program instructions
pub struct UnitEncoder {
    lending_program: Pubkey,
    lending_reserve: Pubkey,
}

impl UnitEncoder {
    pub fn new(venue: &VenueConfig) -> Result<Self> {
        Ok(Self {
            lending_program: parse_key("lending program", &venue.lending_program_id)?,
            lending_reserve: parse_key("lending reserve", &venue.lending_reserve)?,
        })
    }

    /// Build both legs of `unit`, tipping `bid` to `tip_account`
    pub fn encode(&self, unit: &AtomicUnit, bid: u64, tip_account: &Pubkey) -> Result<UnitLegs> {
        if bid > unit.tip_ceiling() {
            return Err(Error::TransactionBuild(format!(
                "Bid {} exceeds ceiling {}",
                bid,
                unit.tip_ceiling()
            )));
        }

        let operator = *unit.operator();
        let mut legs = UnitLegs::default();
        // Everything before the target goes in front; the rest in back
        let mut past_target = unit.loan().is_none();
        let mut budget = None;

        for step in unit.steps() {
            let leg = if past_target {
                &mut legs.back
            } else {
                &mut legs.front
            };
            match step {
                UnitStep::PriorityFee { compute_unit_limit } => {
                    let ix = ComputeBudgetInstruction::set_compute_unit_limit(*compute_unit_limit);
                    budget = Some(ix.clone());
                    leg.push(ix);
                }
                UnitStep::Borrow { principal } => {
                    leg.push(self.lending_instruction(ProgramOp::FlashBorrow, *principal, &operator));
                }
                UnitStep::FrontBuy {
                    tokens,
                    max_sol_cost,
                } => {
                    leg.push(
                        spl_associated_token_account::instruction::create_associated_token_account_idempotent(
                            &operator,
                            &operator,
                            unit.mint(),
                            &spl_token::ID,
                        ),
                    );
                    leg.push(self.buy_instruction(unit, &operator, *tokens, *max_sol_cost));
                }
                UnitStep::AwaitTarget { .. } => {
                    past_target = true;
                    if let Some(ix) = &budget {
                        legs.back.push(ix.clone());
                    }
                }
                UnitStep::BackSell {
                    tokens,
                    min_sol_out,
                } => {
                    leg.push(self.sell_instruction(unit, &operator, *tokens, *min_sol_out));
                }
                UnitStep::Repay { total } => {
                    leg.push(self.lending_instruction(ProgramOp::FlashRepay, *total, &operator));
                }
                UnitStep::Tip { .. } => {
                    leg.push(system_instruction::transfer(&operator, tip_account, bid));
                }
            }
        }

        Ok(legs)
    }

    fn lending_instruction(&self, op: ProgramOp, amount: u64, borrower: &Pubkey) -> Instruction {
        let mut data = Vec::with_capacity(16);
        data.extend_from_slice(&op.discriminator());
        data.extend_from_slice(&amount.to_le_bytes());

        Instruction {
            program_id: self.lending_program,
            accounts: vec![
                AccountMeta::new(self.lending_reserve, false),
                AccountMeta::new(*borrower, true),
                AccountMeta::new_readonly(solana_sdk::sysvar::instructions::ID, false),
                AccountMeta::new_readonly(solana_sdk::system_program::ID, false),
            ],
            data,
        }
    }

    fn buy_instruction(&self, unit: &AtomicUnit, user: &Pubkey, tokens: u64, max_sol_cost: u64) -> Instruction {
        let data = BuyInstruction {
            amount: tokens,
            max_sol_cost,
        }
        .to_bytes();

        // Order matters! Must match pump.fun program expectations
        let accounts = vec![
            AccountMeta::new_readonly(*GLOBAL_PDA, false),
            AccountMeta::new(*FEE_RECIPIENT, false),
            AccountMeta::new_readonly(*unit.mint(), false),
            AccountMeta::new(*unit.pool(), false),
            AccountMeta::new(derive_ata(unit.pool(), unit.mint()), false),
            AccountMeta::new(derive_ata(user, unit.mint()), false),
            AccountMeta::new(*user, true),
            AccountMeta::new_readonly(solana_sdk::system_program::ID, false),
            AccountMeta::new_readonly(spl_token::ID, false),
            AccountMeta::new_readonly(solana_sdk::sysvar::rent::ID, false),
            AccountMeta::new_readonly(*EVENT_AUTHORITY_PDA, false),
            AccountMeta::new_readonly(*PUMP_PROGRAM_ID, false),
        ];

        Instruction {
            program_id: *PUMP_PROGRAM_ID,
            accounts,
            data,
        }
    }

    fn sell_instruction(&self, unit: &AtomicUnit, user: &Pubkey, tokens: u64, min_sol_output: u64) -> Instruction {
        let data = SellInstruction {
            amount: tokens,
            min_sol_output,
        }
        .to_bytes();

        let accounts = vec![
            AccountMeta::new_readonly(*GLOBAL_PDA, false),
            AccountMeta::new(*FEE_RECIPIENT, false),
            AccountMeta::new_readonly(*unit.mint(), false),
            AccountMeta::new(*unit.pool(), false),
            AccountMeta::new(derive_ata(unit.pool(), unit.mint()), false),
            AccountMeta::new(derive_ata(user, unit.mint()), false),
            AccountMeta::new(*user, true),
            AccountMeta::new_readonly(solana_sdk::system_program::ID, false),
            AccountMeta::new_readonly(spl_associated_token_account::ID, false),
            AccountMeta::new_readonly(spl_token::ID, false),
            AccountMeta::new_readonly(*EVENT_AUTHORITY_PDA, false),
            AccountMeta::new_readonly(*PUMP_PROGRAM_ID, false),
        ];

        Instruction {
            program_id: *PUMP_PROGRAM_ID,
            accounts,
            data,
        }
    }
}

fn parse_key(what: &str, value: &str) -> Result<Pubkey> {
    Pubkey::from_str(value).map_err(|e| Error::Config(format!("Invalid {}: {}", what, e)))
}

/// Derive associated token account address
pub fn derive_ata(wallet: &Pubkey, mint: &Pubkey) -> Pubkey {
    spl_associated_token_account::get_associated_token_address(wallet, mint)
}
