//! Record decoder
//!
//! Turns raw venue records into swap intents and reserve updates. Swap
//! instructions declare `(token_amount, sol_limit)`; they are normalized
//! against the pool's reserves at observation time into a declared input
//! amount and a slippage tolerance.

use chrono::Utc;
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use tracing::debug;

use super::pumpportal::{NewTokenEvent, TradeEvent};
use crate::error::{Error, Result};
use crate::pump::accounts::BondingCurve;
use crate::pump::instruction::{
    BuyInstruction, InstructionAccounts, PumpInstruction, SellInstruction,
};
use crate::pump::price::{slippage_bps_between, Reserves};
use crate::pump::program::{INITIAL_VIRTUAL_SOL_RESERVES, INITIAL_VIRTUAL_TOKEN_RESERVES};
use crate::strategy::pool_book::{PoolBook, PoolState};
use crate::strategy::types::{BuyLimit, Direction, IntentStage, SwapIntent};

/// A pump.fun instruction as seen by a transaction source
#[derive(Debug, Clone)]
pub struct RawInstruction {
    pub signature: String,
    pub slot: u64,
    pub data: Vec<u8>,
    /// Instruction accounts, resolved to keys
    pub accounts: Vec<Pubkey>,
    /// Observed before confirmation
    pub pending: bool,
    /// Signed transaction bytes, when the source forwards them
    pub transaction: Option<Vec<u8>>,
}

/// One record from a venue feed
#[derive(Debug, Clone)]
pub enum RawRecord {
    Instruction(RawInstruction),
    Trade(TradeEvent),
    NewToken(NewTokenEvent),
    CurveAccount {
        pool: Pubkey,
        mint: Pubkey,
        data: Vec<u8>,
        slot: u64,
    },
}

impl RawRecord {
    /// Identifier used for cross-session dedup. The same transaction seen
    /// pending and later confirmed yields two distinct keys.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            RawRecord::Instruction(ix) if ix.pending => Some(format!("pending:{}", ix.signature)),
            RawRecord::Instruction(ix) => Some(format!("confirmed:{}", ix.signature)),
            RawRecord::Trade(trade) => Some(format!("trade:{}", trade.signature)),
            RawRecord::NewToken(token) => Some(format!("create:{}", token.signature)),
            RawRecord::CurveAccount { .. } => None,
        }
    }
}

/// Decoder output
#[derive(Debug, Clone)]
pub enum Decoded {
    Intent(SwapIntent),
    Reserves(PoolState),
    /// A confirmed trade and the reserves it left behind
    Trade(SwapIntent, PoolState),
    Discard,
}

/// Decoder for pump.fun records
pub struct PumpDecoder {
    venue_fee_bps: u32,
}

impl PumpDecoder {
    pub fn new(venue_fee_bps: u32) -> Self {
        Self { venue_fee_bps }
    }

    /// Decode one record. Malformed or irrelevant records are discarded.
    pub fn decode(&self, record: RawRecord, book: &PoolBook) -> Decoded {
        let result = match record {
            RawRecord::Instruction(ix) => self.decode_instruction(ix, book),
            RawRecord::Trade(trade) => decode_trade(trade),
            RawRecord::NewToken(token) => decode_new_token(token),
            RawRecord::CurveAccount {
                pool,
                mint,
                data,
                slot,
            } => BondingCurve::try_from_slice(&data)
                .map(|curve| Decoded::Reserves(PoolState::from_curve(pool, mint, &curve, slot))),
        };

        result.unwrap_or_else(|e| {
            debug!("Discarding record: {}", e);
            Decoded::Discard
        })
    }

    fn decode_instruction(&self, ix: RawInstruction, book: &PoolBook) -> Result<Decoded> {
        let stage = if ix.pending {
            IntentStage::Pending
        } else {
            IntentStage::Confirmed
        };

        match PumpInstruction::parse(&ix.data)? {
            PumpInstruction::Buy(buy) => {
                let accounts = InstructionAccounts::swap(&ix.accounts)?;
                let Some(pool) = book.snapshot(&accounts.bonding_curve) else {
                    debug!(tx = %ix.signature, "Buy on unknown pool");
                    return Ok(Decoded::Discard);
                };
                let (amount, slippage_bps) = self.normalize_buy(&buy, &pool.reserves)?;
                Ok(Decoded::Intent(SwapIntent {
                    id: ix.signature,
                    source: accounts.user,
                    pool: accounts.bonding_curve,
                    mint: accounts.mint,
                    direction: Direction::Buy,
                    amount,
                    slippage_bps,
                    limit: Some(BuyLimit {
                        tokens: buy.amount,
                        max_sol_cost: buy.max_sol_cost,
                    }),
                    stage,
                    slot: ix.slot,
                    observed_at: Utc::now(),
                    raw_transaction: ix.transaction,
                }))
            }
            PumpInstruction::Sell(sell) => {
                let accounts = InstructionAccounts::swap(&ix.accounts)?;
                let Some(pool) = book.snapshot(&accounts.bonding_curve) else {
                    debug!(tx = %ix.signature, "Sell on unknown pool");
                    return Ok(Decoded::Discard);
                };
                let slippage_bps = self.normalize_sell(&sell, &pool.reserves)?;
                Ok(Decoded::Intent(SwapIntent {
                    id: ix.signature,
                    source: accounts.user,
                    pool: accounts.bonding_curve,
                    mint: accounts.mint,
                    direction: Direction::Sell,
                    amount: sell.amount,
                    slippage_bps,
                    limit: None,
                    stage,
                    slot: ix.slot,
                    observed_at: Utc::now(),
                    raw_transaction: ix.transaction,
                }))
            }
            PumpInstruction::Create(_) => {
                let accounts = InstructionAccounts::create(&ix.accounts)?;
                Ok(Decoded::Reserves(fresh_pool(
                    accounts.bonding_curve,
                    accounts.mint,
                    accounts.user,
                    ix.slot,
                )))
            }
            PumpInstruction::Other(discriminator) => {
                debug!(tx = %ix.signature, ?discriminator, "Pump.fun instruction not tracked");
                Ok(Decoded::Discard)
            }
        }
    }

    /// A buy declares exact tokens out and a SOL ceiling. Returns the quoted
    /// SOL input and the ceiling's distance above it.
    fn normalize_buy(&self, buy: &BuyInstruction, reserves: &Reserves) -> Result<(u64, u32)> {
        let quote = reserves.buy_cost(buy.amount, self.venue_fee_bps)?;
        // A ceiling already below the quote leaves no tolerance at all
        let slippage = if buy.max_sol_cost > quote {
            slippage_bps_between(quote, buy.max_sol_cost)
        } else {
            0
        };
        Ok((quote, slippage))
    }

    /// A sell declares exact tokens in and a SOL floor
    fn normalize_sell(&self, sell: &SellInstruction, reserves: &Reserves) -> Result<u32> {
        let quote = reserves.sell(sell.amount, self.venue_fee_bps)?.amount_out;
        Ok(if sell.min_sol_output < quote {
            slippage_bps_between(quote, sell.min_sol_output)
        } else {
            0
        })
    }
}

/// Confirmed PumpPortal trade: the trade itself and post-trade reserves
fn decode_trade(trade: TradeEvent) -> Result<Decoded> {
    let pool = parse_key(&trade.pool)?;
    let mint = parse_key(&trade.mint)?;
    let source = parse_key(&trade.trader)?;

    let state = PoolState {
        pool,
        mint,
        creator: None,
        reserves: trade.reserves_after,
        real_sol_reserves: real_sol(&trade.reserves_after),
        complete: false,
        slot: 0,
    };

    let intent = SwapIntent {
        id: trade.signature,
        source,
        pool,
        mint,
        direction: trade.direction,
        amount: match trade.direction {
            Direction::Buy => trade.sol_amount,
            Direction::Sell => trade.token_amount,
        },
        slippage_bps: 0,
        limit: None,
        stage: IntentStage::Confirmed,
        slot: 0,
        observed_at: Utc::now(),
        raw_transaction: None,
    };

    Ok(Decoded::Trade(intent, state))
}

fn decode_new_token(token: NewTokenEvent) -> Result<Decoded> {
    let mut state = fresh_pool(
        parse_key(&token.pool)?,
        parse_key(&token.mint)?,
        parse_key(&token.creator)?,
        0,
    );
    state.reserves = token.reserves;
    state.real_sol_reserves = real_sol(&token.reserves);
    debug!(mint = %token.mint, symbol = %token.symbol, "New token");
    Ok(Decoded::Reserves(state))
}

/// Real SOL in a curve is whatever sits above the initial virtual reserve
fn real_sol(reserves: &Reserves) -> u64 {
    reserves.sol.saturating_sub(INITIAL_VIRTUAL_SOL_RESERVES)
}

fn fresh_pool(pool: Pubkey, mint: Pubkey, creator: Pubkey, slot: u64) -> PoolState {
    PoolState {
        pool,
        mint,
        creator: Some(creator),
        reserves: Reserves {
            sol: INITIAL_VIRTUAL_SOL_RESERVES,
            token: INITIAL_VIRTUAL_TOKEN_RESERVES,
        },
        real_sol_reserves: 0,
        complete: false,
        slot,
    }
}

fn parse_key(value: &str) -> Result<Pubkey> {
    Pubkey::from_str(value)
        .map_err(|e| Error::Deserialization(format!("Invalid pubkey '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::program::ProgramOp;
    use crate::strategy::evaluator::tests::params as evaluator_params;
    use crate::strategy::OpportunityEvaluator;

    const SOL: u64 = 1_000_000_000;

    fn book_with_pool() -> (PoolBook, PoolState) {
        let book = PoolBook::new();
        let state = PoolState {
            pool: Pubkey::new_unique(),
            mint: Pubkey::new_unique(),
            creator: None,
            reserves: Reserves {
                sol: 100 * SOL,
                token: 100 * SOL,
            },
            real_sol_reserves: 0,
            complete: false,
            slot: 1,
        };
        book.upsert(state.clone());
        (book, state)
    }

    fn trade_accounts(state: &PoolState, user: Pubkey) -> Vec<Pubkey> {
        let mut accounts = vec![Pubkey::new_unique(); 12];
        accounts[2] = state.mint;
        accounts[3] = state.pool;
        accounts[6] = user;
        accounts
    }

    #[test]
    fn test_pending_buy_normalized_against_reserves() {
        let (book, state) = book_with_pool();
        let decoder = PumpDecoder::new(0);
        let quote = state.reserves.buy_cost(9 * SOL, 0).unwrap();
        let buy = BuyInstruction {
            amount: 9 * SOL,
            max_sol_cost: quote + quote / 20,
        };

        let record = RawRecord::Instruction(RawInstruction {
            signature: "sig1".into(),
            slot: 5,
            data: buy.to_bytes(),
            accounts: trade_accounts(&state, Pubkey::new_unique()),
            pending: true,
            transaction: None,
        });

        match decoder.decode(record, &book) {
            Decoded::Intent(intent) => {
                assert!(intent.is_pending_buy());
                assert_eq!(intent.amount, quote);
                assert!((499..=500).contains(&intent.slippage_bps));
                assert_eq!(intent.pool, state.pool);
            }
            other => panic!("Expected intent, got {:?}", other),
        }
    }

    #[test]
    fn test_decoded_buy_sized_within_its_sol_ceiling() {
        let (book, state) = book_with_pool();
        let tokens = state.reserves.buy(10 * SOL, 0).unwrap().amount_out;
        let quote = state.reserves.buy_cost(tokens, 0).unwrap();
        let buy = BuyInstruction {
            amount: tokens,
            max_sol_cost: quote + quote / 20,
        };
        let record = RawRecord::Instruction(RawInstruction {
            signature: "sig6".into(),
            slot: 5,
            data: buy.to_bytes(),
            accounts: trade_accounts(&state, Pubkey::new_unique()),
            pending: true,
            transaction: None,
        });
        let Decoded::Intent(intent) = PumpDecoder::new(0).decode(record, &book) else {
            panic!("Expected intent");
        };
        assert_eq!(
            intent.limit,
            Some(BuyLimit {
                tokens,
                max_sol_cost: buy.max_sol_cost
            })
        );

        let mut params = evaluator_params();
        params.balance_threshold_lamports = 50 * SOL;
        params.flashloan_increment_lamports = SOL / 4;
        let opp = OpportunityEvaluator::new(params)
            .evaluate(&intent, &state)
            .expect("should be profitable");

        let front = state.reserves.buy(opp.front_run_lamports, 0).unwrap();
        let target_cost = front.after.buy_cost(tokens, 0).unwrap();
        assert!(target_cost <= buy.max_sol_cost);
    }

    #[test]
    fn test_unknown_pool_discarded() {
        let (book, _) = book_with_pool();
        let other = PoolState {
            pool: Pubkey::new_unique(),
            ..book_with_pool().1
        };
        let buy = BuyInstruction {
            amount: SOL,
            max_sol_cost: 2 * SOL,
        };
        let record = RawRecord::Instruction(RawInstruction {
            signature: "sig2".into(),
            slot: 5,
            data: buy.to_bytes(),
            accounts: trade_accounts(&other, Pubkey::new_unique()),
            pending: true,
            transaction: None,
        });

        assert!(matches!(PumpDecoder::new(0).decode(record, &book), Decoded::Discard));
    }

    #[test]
    fn test_malformed_instruction_discarded() {
        let (book, state) = book_with_pool();
        let mut data = ProgramOp::Sell.discriminator().to_vec();
        data.push(1);
        let record = RawRecord::Instruction(RawInstruction {
            signature: "sig3".into(),
            slot: 5,
            data,
            accounts: trade_accounts(&state, Pubkey::new_unique()),
            pending: true,
            transaction: None,
        });

        assert!(matches!(PumpDecoder::new(0).decode(record, &book), Decoded::Discard));
    }

    #[test]
    fn test_trade_event_yields_reserves() {
        let pool = Pubkey::new_unique();
        let trade = TradeEvent {
            signature: "sig4".into(),
            mint: Pubkey::new_unique().to_string(),
            trader: Pubkey::new_unique().to_string(),
            pool: pool.to_string(),
            direction: Direction::Sell,
            token_amount: 1_000,
            sol_amount: 50,
            reserves_after: Reserves {
                sol: 40 * SOL,
                token: 900 * SOL,
            },
        };

        match PumpDecoder::new(100).decode(RawRecord::Trade(trade), &PoolBook::new()) {
            Decoded::Trade(intent, state) => {
                assert_eq!(intent.direction, Direction::Sell);
                assert_eq!(intent.stage, IntentStage::Confirmed);
                assert_eq!(intent.amount, 1_000);
                assert_eq!(state.pool, pool);
                assert_eq!(state.real_sol_reserves, 10 * SOL);
            }
            other => panic!("Expected trade, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_pubkey_discarded() {
        let token = NewTokenEvent {
            signature: "sig5".into(),
            mint: "not-a-key".into(),
            creator: Pubkey::new_unique().to_string(),
            pool: Pubkey::new_unique().to_string(),
            symbol: "s".into(),
            reserves: Reserves { sol: 1, token: 1 },
        };

        assert!(matches!(
            PumpDecoder::new(0).decode(RawRecord::NewToken(token), &PoolBook::new()),
            Decoded::Discard
        ));
    }
}
