//! Constant-product pricing for pump.fun bonding curves
//!
//! All swap math is integer math on u128 intermediates. Rounding always
//! goes against the trader so simulated outputs never overstate what the
//! chain will pay.

use crate::error::{Error, Result};

/// SOL decimals (lamports)
pub const SOL_DECIMALS: u8 = 9;

/// Every pump.fun mint uses 6 decimals
pub const TOKEN_DECIMALS: u8 = 6;

const BPS: u128 = 10_000;

/// Virtual reserves of a curve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reserves {
    pub sol: u64,
    pub token: u64,
}

/// Result of a simulated swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapOutcome {
    /// Tokens for a buy, lamports (after fee) for a sell
    pub amount_out: u64,
    /// Venue fee charged on the SOL leg
    pub fee: u64,
    /// Reserves after the swap
    pub after: Reserves,
}

impl Reserves {
    fn k(&self) -> Result<u128> {
        if self.sol == 0 || self.token == 0 {
            return Err(Error::PriceOverflow);
        }
        (self.sol as u128)
            .checked_mul(self.token as u128)
            .ok_or(Error::PriceOverflow)
    }

    /// Buy with `sol_in` lamports, fee included
    pub fn buy(&self, sol_in: u64, fee_bps: u32) -> Result<SwapOutcome> {
        let k = self.k()?;
        let fee = bps_ceil(sol_in, fee_bps);
        let net_in = sol_in.checked_sub(fee).ok_or(Error::PriceOverflow)?;

        let new_sol = (self.sol as u128)
            .checked_add(net_in as u128)
            .ok_or(Error::PriceOverflow)?;
        let new_token = div_ceil(k, new_sol)?;
        let tokens_out = (self.token as u128)
            .checked_sub(new_token)
            .ok_or(Error::PriceOverflow)?;

        Ok(SwapOutcome {
            amount_out: to_u64(tokens_out)?,
            fee,
            after: Reserves {
                sol: to_u64(new_sol)?,
                token: to_u64(new_token)?,
            },
        })
    }

    /// Sell `tokens_in`, returning lamports net of the fee
    pub fn sell(&self, tokens_in: u64, fee_bps: u32) -> Result<SwapOutcome> {
        let k = self.k()?;
        let new_token = (self.token as u128)
            .checked_add(tokens_in as u128)
            .ok_or(Error::PriceOverflow)?;
        let new_sol = div_ceil(k, new_token)?;
        let gross = to_u64(
            (self.sol as u128)
                .checked_sub(new_sol)
                .ok_or(Error::PriceOverflow)?,
        )?;
        let fee = bps_ceil(gross, fee_bps);

        Ok(SwapOutcome {
            amount_out: gross - fee,
            fee,
            after: Reserves {
                sol: to_u64(new_sol)?,
                token: to_u64(new_token)?,
            },
        })
    }

    /// Lamports (fee included) needed to buy exactly `tokens_out`
    pub fn buy_cost(&self, tokens_out: u64, fee_bps: u32) -> Result<u64> {
        let k = self.k()?;
        if tokens_out >= self.token {
            return Err(Error::PriceOverflow);
        }
        let new_token = (self.token - tokens_out) as u128;
        let new_sol = div_ceil(k, new_token)?;
        let net_in = new_sol - self.sol as u128;
        let mut gross = to_u64(div_ceil(
            net_in.checked_mul(BPS).ok_or(Error::PriceOverflow)?,
            BPS.saturating_sub(fee_bps as u128),
        )?)?;
        // Fee rounding can leave the net input one lamport short
        while ((gross - bps_ceil(gross, fee_bps)) as u128) < net_in {
            gross = gross.checked_add(1).ok_or(Error::PriceOverflow)?;
        }
        Ok(gross)
    }

    /// Buy exactly `tokens_out`, the way the venue prices a buy instruction.
    /// Returns the lamports charged (fee included) and the outcome.
    pub fn buy_exact(&self, tokens_out: u64, fee_bps: u32) -> Result<(u64, SwapOutcome)> {
        let cost = self.buy_cost(tokens_out, fee_bps)?;
        let fee = bps_ceil(cost, fee_bps);
        let sol = self
            .sol
            .checked_add(cost - fee)
            .ok_or(Error::PriceOverflow)?;

        Ok((
            cost,
            SwapOutcome {
                amount_out: tokens_out,
                fee,
                after: Reserves {
                    sol,
                    token: self.token - tokens_out,
                },
            },
        ))
    }
}

/// `amount * bps / 10000`, rounded down
pub fn bps_of(amount: u64, bps: u32) -> u64 {
    ((amount as u128 * bps as u128) / BPS) as u64
}

/// `amount * bps / 10000`, rounded up
pub fn bps_ceil(amount: u64, bps: u32) -> u64 {
    ((amount as u128 * bps as u128).div_ceil(BPS)) as u64
}

/// Calculate minimum output with slippage
pub fn calculate_min_with_slippage(expected: u64, slippage_bps: u32) -> u64 {
    let slippage_factor = BPS.saturating_sub(slippage_bps as u128);
    ((expected as u128 * slippage_factor) / BPS) as u64
}

/// Distance between a quote and a trader's limit, in bps of the quote
pub fn slippage_bps_between(quote: u64, limit: u64) -> u32 {
    if quote == 0 {
        return 0;
    }
    let gap = quote.abs_diff(limit) as u128;
    ((gap * BPS) / quote as u128).min(BPS) as u32
}

/// Convert lamports to SOL
pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / 10f64.powi(SOL_DECIMALS as i32)
}

/// Convert SOL to lamports
pub fn sol_to_lamports(sol: f64) -> u64 {
    (sol * 10f64.powi(SOL_DECIMALS as i32)).round() as u64
}

/// Convert a whole-token amount to base units
pub fn tokens_to_base_units(tokens: f64) -> u64 {
    (tokens * 10f64.powi(TOKEN_DECIMALS as i32)).round() as u64
}

fn div_ceil(a: u128, b: u128) -> Result<u128> {
    if b == 0 {
        return Err(Error::PriceOverflow);
    }
    Ok(a.div_ceil(b))
}

fn to_u64(v: u128) -> Result<u64> {
    u64::try_from(v).map_err(|_| Error::PriceOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Reserves {
        Reserves {
            sol: 100_000_000_000,
            token: 100_000_000_000,
        }
    }

    #[test]
    fn test_buy_without_fee() {
        let out = pool().buy(10_000_000_000, 0).unwrap();
        // 100 - 10000/110 = 9.0909...
        assert_eq!(out.amount_out, 9_090_909_090);
        assert_eq!(out.fee, 0);
        assert_eq!(out.after.sol, 110_000_000_000);
    }

    #[test]
    fn test_fee_reduces_output() {
        let plain = pool().buy(1_000_000_000, 0).unwrap();
        let charged = pool().buy(1_000_000_000, 100).unwrap();
        assert_eq!(charged.fee, 10_000_000);
        assert!(charged.amount_out < plain.amount_out);

        let sell = pool().sell(1_000_000_000, 100).unwrap();
        assert!(sell.fee > 0);
    }

    #[test]
    fn test_round_trip_loses_value() {
        let bought = pool().buy(1_000_000_000, 100).unwrap();
        let sold = bought.after.sell(bought.amount_out, 100).unwrap();
        assert!(sold.amount_out < 1_000_000_000);
    }

    #[test]
    fn test_buy_cost_covers_exact_out() {
        let cost = pool().buy_cost(9_000_000_000, 100).unwrap();
        let out = pool().buy(cost, 100).unwrap();
        assert!(out.amount_out >= 9_000_000_000);
        assert!(pool().buy_cost(pool().token, 0).is_err());
    }

    #[test]
    fn test_buy_exact_moves_reserves_by_exact_tokens() {
        let (cost, out) = pool().buy_exact(9_000_000_000, 100).unwrap();
        assert_eq!(cost, pool().buy_cost(9_000_000_000, 100).unwrap());
        assert_eq!(out.amount_out, 9_000_000_000);
        assert_eq!(out.after.token, 91_000_000_000);
        assert_eq!(out.after.sol, 100_000_000_000 + cost - out.fee);
        assert!(out.after.sol as u128 * out.after.token as u128 >= 10u128.pow(22));
    }

    #[test]
    fn test_empty_reserves_rejected() {
        let empty = Reserves { sol: 0, token: 10 };
        assert!(empty.buy(1, 0).is_err());
    }

    #[test]
    fn test_slippage_helpers() {
        assert_eq!(calculate_min_with_slippage(1_000_000, 2500), 750_000);
        assert_eq!(slippage_bps_between(1_000_000, 1_050_000), 500);
        assert_eq!(slippage_bps_between(0, 5), 0);
        assert_eq!(bps_of(2_000_000_000, 9), 1_800_000);
    }

    #[test]
    fn test_lamports_conversion() {
        assert_eq!(lamports_to_sol(1_000_000_000), 1.0);
        assert_eq!(sol_to_lamports(1.0), 1_000_000_000);
        assert_eq!(sol_to_lamports(0.1), 100_000_000);
        assert_eq!(tokens_to_base_units(1_073_000_000.0), 1_073_000_000_000_000);
    }
}
