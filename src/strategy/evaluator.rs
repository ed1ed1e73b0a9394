//! Opportunity evaluation
//!
//! Decides whether a pending buy can be sandwiched at a profit and, if so,
//! how large the front-run should be. Evaluation is pure: it reads one
//! `PoolState` copy and one config snapshot, and never touches shared state.

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use super::pool_book::PoolState;
use super::types::{CostBreakdown, Opportunity, SwapIntent};
use crate::config::Config;
use crate::pump::price::{bps_ceil, bps_of, calculate_min_with_slippage, Reserves, SwapOutcome};

/// Evaluation parameters, taken from one configuration snapshot
#[derive(Debug, Clone)]
pub struct EvaluatorParams {
    pub balance_threshold_lamports: u64,
    pub flashloan_increment_lamports: u64,
    pub priority_fee_ceiling_lamports: u64,
    pub min_profit_margin_bps: u32,
    pub loan_fee_bps: u32,
    pub venue_fee_bps: u32,
    pub network_fee_lamports: u64,
    pub retain_bps: u32,
    pub opportunity_window_slots: u64,
    pub graduation_threshold_lamports: u64,
}

impl EvaluatorParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            balance_threshold_lamports: config.engine.balance_threshold_lamports(),
            flashloan_increment_lamports: config.engine.flashloan_increment_lamports(),
            priority_fee_ceiling_lamports: config.engine.priority_fee_ceiling_lamports,
            min_profit_margin_bps: config.engine.min_profit_margin_bps,
            loan_fee_bps: config.venue.loan_fee_bps,
            venue_fee_bps: config.venue.venue_fee_bps,
            network_fee_lamports: config.venue.network_fee_lamports,
            retain_bps: config.engine.retain_bps,
            opportunity_window_slots: config.engine.opportunity_window_slots,
            graduation_threshold_lamports: config.venue.graduation_threshold_lamports(),
        }
    }

    /// Largest multiple of the flashloan increment the operator allows
    fn max_steps(&self) -> u64 {
        if self.flashloan_increment_lamports == 0 {
            return 0;
        }
        self.balance_threshold_lamports / self.flashloan_increment_lamports
    }

    /// Profit an opportunity must strictly exceed
    pub fn required_profit(&self, front_run_lamports: u64) -> i128 {
        bps_of(front_run_lamports, self.min_profit_margin_bps).max(1) as i128
    }
}

/// Why an intent produced no opportunity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Only pending buys move the price in our favour
    NotPendingBuy,
    PoolMismatch,
    Graduated,
    ZeroAmount,
    /// Even the smallest front-run pushes the target past its tolerance
    ToleranceExceeded,
    BelowMargin { best_net: i128, required: i128 },
    /// Reserve math overflowed or the pool is empty
    Unpriceable,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::NotPendingBuy => write!(f, "not a pending buy"),
            Rejection::PoolMismatch => write!(f, "pool snapshot does not match intent"),
            Rejection::Graduated => write!(f, "pool has graduated"),
            Rejection::ZeroAmount => write!(f, "zero amount"),
            Rejection::ToleranceExceeded => write!(f, "target tolerance too tight"),
            Rejection::BelowMargin { best_net, required } => {
                write!(f, "best net {} does not exceed required {}", best_net, required)
            }
            Rejection::Unpriceable => write!(f, "pool cannot be priced"),
        }
    }
}

/// How the target buy is replayed and when it would still succeed
#[derive(Debug, Clone, Copy)]
enum TargetLeg {
    /// A decoded buy instruction: exact tokens, fails above the SOL ceiling
    ExactOut { tokens: u64, max_sol_cost: u64 },
    /// SOL in with an output floor taken from the quote at snapshot
    ExactIn { sol_in: u64, min_tokens_out: u64 },
}

impl TargetLeg {
    fn of(intent: &SwapIntent, pool: &PoolState, fee_bps: u32) -> Result<Self, Rejection> {
        if let Some(limit) = intent.limit {
            if limit.tokens == 0 {
                return Err(Rejection::ZeroAmount);
            }
            return Ok(TargetLeg::ExactOut {
                tokens: limit.tokens,
                max_sol_cost: limit.max_sol_cost,
            });
        }
        if intent.amount == 0 {
            return Err(Rejection::ZeroAmount);
        }
        let quote = pool
            .reserves
            .buy(intent.amount, fee_bps)
            .map_err(|_| Rejection::Unpriceable)?;
        Ok(TargetLeg::ExactIn {
            sol_in: intent.amount,
            min_tokens_out: calculate_min_with_slippage(quote.amount_out, intent.slippage_bps),
        })
    }

    /// Replay the target on `reserves`; `tolerated` is false when the
    /// target's own limit would make it fail
    fn replay(&self, reserves: &Reserves, fee_bps: u32) -> Option<(SwapOutcome, bool)> {
        match *self {
            TargetLeg::ExactOut {
                tokens,
                max_sol_cost,
            } => {
                let (cost, outcome) = reserves.buy_exact(tokens, fee_bps).ok()?;
                Some((outcome, cost <= max_sol_cost))
            }
            TargetLeg::ExactIn {
                sol_in,
                min_tokens_out,
            } => {
                let outcome = reserves.buy(sol_in, fee_bps).ok()?;
                Some((outcome, outcome.amount_out >= min_tokens_out))
            }
        }
    }
}

/// Outcome of replaying front-run, target and back-run on a pool copy
#[derive(Debug, Clone, Copy)]
struct Simulation {
    front_run_lamports: u64,
    front_tokens: u64,
    target_tolerated: bool,
    back_tokens: u64,
    retained_tokens: u64,
    proceeds: u64,
    costs: CostBreakdown,
    net: i128,
}

pub struct OpportunityEvaluator {
    params: EvaluatorParams,
}

impl OpportunityEvaluator {
    pub fn new(params: EvaluatorParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &EvaluatorParams {
        &self.params
    }

    /// Evaluate an intent; rejections are logged and yield `None`
    pub fn evaluate(&self, intent: &SwapIntent, pool: &PoolState) -> Option<Opportunity> {
        match self.assess(intent, pool) {
            Ok(opportunity) => Some(opportunity),
            Err(reason) => {
                debug!(intent = %intent.id, %reason, "Intent rejected");
                None
            }
        }
    }

    /// Evaluate an intent, returning the rejection reason on failure
    pub fn assess(&self, intent: &SwapIntent, pool: &PoolState) -> Result<Opportunity, Rejection> {
        if !intent.is_pending_buy() {
            return Err(Rejection::NotPendingBuy);
        }
        if intent.pool != pool.pool {
            return Err(Rejection::PoolMismatch);
        }
        if pool.is_graduated(self.params.graduation_threshold_lamports) {
            return Err(Rejection::Graduated);
        }

        let target = TargetLeg::of(intent, pool, self.params.venue_fee_bps)?;
        let max_k = self.largest_feasible_step(&target, pool)?;
        let best = self.most_profitable(&target, pool, max_k)?;

        let required = self.params.required_profit(best.front_run_lamports);
        if best.net <= required {
            return Err(Rejection::BelowMargin {
                best_net: best.net,
                required,
            });
        }

        Ok(self.build(intent, pool, best))
    }

    /// Binary search for the largest step whose front-run the target still tolerates
    fn largest_feasible_step(&self, target: &TargetLeg, pool: &PoolState) -> Result<u64, Rejection> {
        let feasible = |k: u64| {
            self.simulate(target, pool, k)
                .map(|s| s.target_tolerated)
                .unwrap_or(false)
        };

        let max_steps = self.params.max_steps();
        if max_steps == 0 || !feasible(1) {
            return Err(Rejection::ToleranceExceeded);
        }

        let (mut lo, mut hi) = (1u64, max_steps);
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if feasible(mid) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        Ok(lo)
    }

    /// Ternary search over `[1, max_k]` for the highest net profit
    fn most_profitable(
        &self,
        target: &TargetLeg,
        pool: &PoolState,
        max_k: u64,
    ) -> Result<Simulation, Rejection> {
        let net = |k: u64| {
            self.simulate(target, pool, k)
                .map(|s| s.net)
                .unwrap_or(i128::MIN)
        };

        let (mut lo, mut hi) = (1u64, max_k);
        while hi - lo > 2 {
            let m1 = lo + (hi - lo) / 3;
            let m2 = hi - (hi - lo) / 3;
            if net(m1) < net(m2) {
                lo = m1 + 1;
            } else {
                hi = m2 - 1;
            }
        }

        let mut best: Option<Simulation> = None;
        // Rounding can flatten the curve; look one step past the window
        let from = lo.saturating_sub(1).max(1);
        let to = (hi + 1).min(max_k);
        for k in from..=to {
            let Some(sim) = self.simulate(target, pool, k) else {
                continue;
            };
            if !sim.target_tolerated {
                continue;
            }
            if best.map_or(true, |b| sim.net > b.net) {
                best = Some(sim);
            }
        }

        best.ok_or(Rejection::Unpriceable)
    }

    /// Replay front-buy, target buy and back-sell for `k` increments
    fn simulate(&self, target: &TargetLeg, pool: &PoolState, k: u64) -> Option<Simulation> {
        let p = &self.params;
        let x = k.checked_mul(p.flashloan_increment_lamports)?;

        let front = pool.reserves.buy(x, p.venue_fee_bps).ok()?;
        let (target, target_tolerated) = target.replay(&front.after, p.venue_fee_bps)?;

        let retained_tokens = bps_of(front.amount_out, p.retain_bps);
        let back_tokens = front.amount_out - retained_tokens;
        let back = target.after.sell(back_tokens, p.venue_fee_bps).ok()?;

        let costs = CostBreakdown {
            loan_fee: bps_ceil(x, p.loan_fee_bps),
            priority_fee_ceiling: p.priority_fee_ceiling_lamports,
            network_fee: p.network_fee_lamports,
        };
        let net = back.amount_out as i128 - x as i128 - costs.total() as i128;

        Some(Simulation {
            front_run_lamports: x,
            front_tokens: front.amount_out,
            target_tolerated,
            back_tokens,
            retained_tokens,
            proceeds: back.amount_out,
            costs,
            net,
        })
    }

    fn build(&self, intent: &SwapIntent, pool: &PoolState, sim: Simulation) -> Opportunity {
        // Break-even floor: below it the back-sell must fail and take the
        // whole unit with it
        let min_back_proceeds = sim
            .front_run_lamports
            .saturating_add(sim.costs.total());

        Opportunity {
            id: Uuid::new_v4(),
            intent_id: intent.id.clone(),
            pool: pool.pool,
            mint: pool.mint,
            front_run_lamports: sim.front_run_lamports,
            front_run_tokens: sim.front_tokens,
            back_run_tokens: sim.back_tokens,
            retained_tokens: sim.retained_tokens,
            expected_proceeds: sim.proceeds,
            gross_profit: sim.proceeds as i128 - sim.front_run_lamports as i128,
            estimated_cost: sim.costs,
            net_profit: sim.net,
            min_front_tokens: sim.front_tokens,
            min_back_proceeds,
            expiry_slot: intent.slot + self.params.opportunity_window_slots,
            computed_at: Utc::now(),
            target_transaction: intent.raw_transaction.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::strategy::types::{BuyLimit, Direction, IntentStage};
    use solana_sdk::pubkey::Pubkey;

    const SOL: u64 = 1_000_000_000;

    pub(crate) fn params() -> EvaluatorParams {
        EvaluatorParams {
            balance_threshold_lamports: 2 * SOL,
            flashloan_increment_lamports: SOL,
            priority_fee_ceiling_lamports: 5_000_000,
            min_profit_margin_bps: 200,
            loan_fee_bps: 9,
            venue_fee_bps: 0,
            network_fee_lamports: 10_000,
            retain_bps: 0,
            opportunity_window_slots: 4,
            graduation_threshold_lamports: 85 * SOL,
        }
    }

    pub(crate) fn pool() -> PoolState {
        PoolState {
            pool: Pubkey::new_unique(),
            mint: Pubkey::new_unique(),
            creator: None,
            reserves: Reserves {
                sol: 100 * SOL,
                token: 100 * SOL,
            },
            real_sol_reserves: 0,
            complete: false,
            slot: 100,
        }
    }

    pub(crate) fn target_buy(pool: &PoolState, amount: u64, slippage_bps: u32) -> SwapIntent {
        SwapIntent {
            id: "target".into(),
            source: Pubkey::new_unique(),
            pool: pool.pool,
            mint: pool.mint,
            direction: Direction::Buy,
            amount,
            slippage_bps,
            limit: None,
            stage: IntentStage::Pending,
            slot: 100,
            observed_at: Utc::now(),
            raw_transaction: None,
        }
    }

    /// A buy instruction for the tokens `sol_in` would get at snapshot, with
    /// its SOL ceiling `slippage_bps` above the quoted cost
    pub(crate) fn target_exact_buy(pool: &PoolState, sol_in: u64, slippage_bps: u32) -> SwapIntent {
        let tokens = pool.reserves.buy(sol_in, 0).unwrap().amount_out;
        let cost = pool.reserves.buy_cost(tokens, 0).unwrap();
        let mut intent = target_buy(pool, cost, slippage_bps);
        intent.limit = Some(BuyLimit {
            tokens,
            max_sol_cost: cost + bps_of(cost, slippage_bps),
        });
        intent
    }

    #[test]
    fn test_large_buy_on_balanced_pool_is_profitable() {
        let pool = pool();
        let intent = target_buy(&pool, 10 * SOL, 500);
        let evaluator = OpportunityEvaluator::new(params());

        let opp = evaluator.evaluate(&intent, &pool).expect("should be profitable");

        assert_eq!(opp.front_run_lamports, 2 * SOL);
        assert!(opp.net_profit > (SOL / 25) as i128);
        assert!(opp.net_profit > evaluator.params().required_profit(opp.front_run_lamports));
        assert!(opp.min_back_proceeds >= opp.front_run_lamports + opp.estimated_cost.loan_fee);
        assert!(opp.expected_proceeds >= opp.min_back_proceeds);
        assert_eq!(opp.expiry_slot, 104);
        assert!(opp.is_live(104));
        assert!(!opp.is_live(105));
    }

    #[test]
    fn test_tight_tolerance_rejected() {
        let pool = pool();
        let intent = target_buy(&pool, 10 * SOL, 100);
        let evaluator = OpportunityEvaluator::new(params());

        assert_eq!(
            evaluator.assess(&intent, &pool).unwrap_err(),
            Rejection::ToleranceExceeded
        );
        assert!(evaluator.evaluate(&intent, &pool).is_none());
    }

    #[test]
    fn test_non_candidates_rejected() {
        let pool = pool();
        let evaluator = OpportunityEvaluator::new(params());

        let mut confirmed = target_buy(&pool, 10 * SOL, 500);
        confirmed.stage = IntentStage::Confirmed;
        assert_eq!(
            evaluator.assess(&confirmed, &pool).unwrap_err(),
            Rejection::NotPendingBuy
        );

        let mut sell = target_buy(&pool, 10 * SOL, 500);
        sell.direction = Direction::Sell;
        assert!(evaluator.evaluate(&sell, &pool).is_none());

        let mut graduated = pool.clone();
        graduated.complete = true;
        let intent = target_buy(&graduated, 10 * SOL, 500);
        assert_eq!(
            evaluator.assess(&intent, &graduated).unwrap_err(),
            Rejection::Graduated
        );

        let other = target_buy(&self::pool(), 10 * SOL, 500);
        assert_eq!(
            evaluator.assess(&other, &pool).unwrap_err(),
            Rejection::PoolMismatch
        );
    }

    #[test]
    fn test_small_target_below_margin() {
        let pool = pool();
        let intent = target_buy(&pool, SOL / 10, 5000);
        let evaluator = OpportunityEvaluator::new(params());

        assert!(matches!(
            evaluator.assess(&intent, &pool),
            Err(Rejection::BelowMargin { .. })
        ));
    }

    #[test]
    fn test_accepted_always_clears_margin() {
        let mut p = params();
        p.balance_threshold_lamports = 20 * SOL;
        p.flashloan_increment_lamports = SOL / 4;
        p.venue_fee_bps = 100;
        let evaluator = OpportunityEvaluator::new(p);

        for amount in [SOL, 3 * SOL, 10 * SOL, 30 * SOL] {
            for slippage in [50, 300, 1000, 2500] {
                let pool = pool();
                let intent = target_buy(&pool, amount, slippage);
                if let Some(opp) = evaluator.evaluate(&intent, &pool) {
                    let required = evaluator.params().required_profit(opp.front_run_lamports);
                    assert!(opp.net_profit > required);
                    assert_eq!(opp.front_run_lamports % (SOL / 4), 0);
                    assert!(opp.front_run_lamports <= 20 * SOL);
                }
            }
        }
    }

    #[test]
    fn test_chosen_size_respects_target_tolerance() {
        let mut p = params();
        p.balance_threshold_lamports = 50 * SOL;
        let evaluator = OpportunityEvaluator::new(p.clone());
        let pool = pool();
        let intent = target_buy(&pool, 10 * SOL, 1000);

        let opp = evaluator.evaluate(&intent, &pool).unwrap();

        let quote = pool.reserves.buy(intent.amount, 0).unwrap().amount_out;
        let front = pool.reserves.buy(opp.front_run_lamports, 0).unwrap();
        let target = front.after.buy(intent.amount, 0).unwrap();
        assert!(target.amount_out >= calculate_min_with_slippage(quote, 1000));
        assert!(opp.front_run_lamports < 50 * SOL);
    }

    #[test]
    fn test_retained_tokens_not_sold() {
        let mut p = params();
        p.retain_bps = 1000;
        let evaluator = OpportunityEvaluator::new(p);
        let pool = pool();
        let intent = target_buy(&pool, 10 * SOL, 500);

        let opp = evaluator.evaluate(&intent, &pool).unwrap();
        assert_eq!(opp.retained_tokens + opp.back_run_tokens, opp.front_run_tokens);
        assert!(opp.retained_tokens > 0);
    }

    #[test]
    fn test_exact_out_target_never_pushed_past_its_ceiling() {
        let mut p = params();
        p.balance_threshold_lamports = 50 * SOL;
        p.flashloan_increment_lamports = SOL / 4;
        let evaluator = OpportunityEvaluator::new(p);
        let pool = pool();
        let intent = target_exact_buy(&pool, 10 * SOL, 500);
        let limit = intent.limit.unwrap();

        let opp = evaluator.evaluate(&intent, &pool).expect("should be profitable");

        let front = pool.reserves.buy(opp.front_run_lamports, 0).unwrap();
        let cost = front.after.buy_cost(limit.tokens, 0).unwrap();
        assert!(cost <= limit.max_sol_cost);

        // One more increment would make the target fail on chain
        let bigger = pool.reserves.buy(opp.front_run_lamports + SOL / 4, 0).unwrap();
        assert!(bigger.after.buy_cost(limit.tokens, 0).unwrap() > limit.max_sol_cost);
    }

    #[test]
    fn test_exact_out_ceiling_below_quote_rejected() {
        let pool = pool();
        let mut intent = target_exact_buy(&pool, 10 * SOL, 0);
        if let Some(limit) = intent.limit.as_mut() {
            limit.max_sol_cost -= 1;
        }
        let evaluator = OpportunityEvaluator::new(params());

        assert_eq!(
            evaluator.assess(&intent, &pool).unwrap_err(),
            Rejection::ToleranceExceeded
        );
    }
}
