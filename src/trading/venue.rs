//! Execution venue abstraction
//!
//! The engine only talks to the chain and the block engine through
//! `ExecutionVenue`. `JitoVenue` is the live implementation; `DryRunVenue`
//! settles units in memory and never broadcasts.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use super::orchestrator::AtomicUnit;
use crate::error::{Error, Result};

/// Solana's target slot time
const SLOT_DURATION: Duration = Duration::from_millis(400);

/// Chain effects of a unit that landed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LandedUnit {
    pub slot: u64,
    /// Operator SOL change, fees and tip included
    pub sol_delta: i128,
    pub token_delta: i128,
    pub fee_paid: u64,
}

/// Status of one submission as reported by the venue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    /// Accepted, not yet in a block
    Pending,
    Landed(LandedUnit),
    Reverted { fee_paid: u64, reason: String },
    /// Lost the auction or was never accepted
    Dropped,
    /// The venue cannot tell right now
    Unknown,
}

/// Final answer from confirmed chain state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Committed(LandedUnit),
    Reverted { fee_paid: u64 },
    NotLanded,
}

#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    fn name(&self) -> &str;

    /// Wallet that signs units and owns positions
    fn operator(&self) -> Pubkey;

    async fn current_slot(&self) -> Result<u64>;

    async fn operator_balance(&self) -> Result<u64>;

    /// Largest principal the lending venue can advance right now
    async fn loan_capacity(&self) -> Result<u64>;

    /// Submit the unit with `bid` as its tip. Returns a submission id.
    async fn submit(&self, unit: &AtomicUnit, bid: u64) -> Result<String>;

    async fn unit_status(&self, submission_id: &str) -> Result<UnitStatus>;

    /// Best competing bid for the same opportunity, when observable
    async fn competing_bid(&self, _unit: &AtomicUnit) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Re-read chain state for every submission of `unit`
    async fn authoritative_outcome(
        &self,
        unit: &AtomicUnit,
        submissions: &[String],
    ) -> Result<UnitOutcome>;

    async fn token_balance(&self, mint: &Pubkey) -> Result<u64>;

    /// Forget what was tracked for a unit once it has settled
    fn release(&self, _unit: &AtomicUnit) {}
}

/// Slot source for the dry-run venue
pub enum SlotClock {
    /// Advances one slot per query
    Ticking(AtomicU64),
    /// Follows wall time from `base`
    Wall { start: Instant, base: u64 },
}

impl SlotClock {
    pub fn ticking(start: u64) -> Self {
        SlotClock::Ticking(AtomicU64::new(start))
    }

    pub fn wall(base: u64) -> Self {
        SlotClock::Wall {
            start: Instant::now(),
            base,
        }
    }

    fn next(&self) -> u64 {
        match self {
            SlotClock::Ticking(slot) => slot.fetch_add(1, Ordering::SeqCst),
            SlotClock::Wall { start, base } => {
                base + (start.elapsed().as_millis() / SLOT_DURATION.as_millis()) as u64
            }
        }
    }
}

/// How the dry-run venue treats the next unit it sees
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DryRunScript {
    /// Lands as estimated on the nth submission
    LandAtAttempt(u32),
    /// Lands on the nth submission with a different SOL change
    LandWithDelta { attempt: u32, sol_delta: i128 },
    NeverLand,
    Revert,
    /// Status stays unknown; chain state says whether it landed
    Ambiguous { lands: bool },
    /// A competitor keeps bidding this much
    Outbid(u64),
}

#[derive(Debug)]
struct DryRunUnit {
    script: DryRunScript,
    attempts: u32,
    outcome: UnitOutcome,
}

#[derive(Default)]
struct DryRunLedger {
    balance: u64,
    tokens: HashMap<Pubkey, u64>,
}

impl DryRunLedger {
    fn apply(&mut self, mint: &Pubkey, landed: &LandedUnit) {
        let balance = (self.balance as i128 + landed.sol_delta).max(0);
        self.balance = balance.min(u64::MAX as i128) as u64;
        let held = self.tokens.entry(*mint).or_default();
        *held = (*held as i128 + landed.token_delta).max(0) as u64;
    }
}

/// In-memory venue for `start --dry-run` and tests
pub struct DryRunVenue {
    operator: Pubkey,
    clock: SlotClock,
    loan_capacity: u64,
    ledger: Mutex<DryRunLedger>,
    scripts: Mutex<VecDeque<DryRunScript>>,
    units: DashMap<Uuid, DryRunUnit>,
    submissions: DashMap<String, UnitStatus>,
}

impl DryRunVenue {
    pub fn new(balance: u64, clock: SlotClock) -> Self {
        Self {
            operator: Pubkey::new_unique(),
            clock,
            loan_capacity: u64::MAX,
            ledger: Mutex::new(DryRunLedger {
                balance,
                tokens: HashMap::new(),
            }),
            scripts: Mutex::new(VecDeque::new()),
            units: DashMap::new(),
            submissions: DashMap::new(),
        }
    }

    pub fn with_loan_capacity(mut self, capacity: u64) -> Self {
        self.loan_capacity = capacity;
        self
    }

    /// Scripts are consumed one per new unit; units past the end land on
    /// their first submission
    pub fn with_scripts(self, scripts: Vec<DryRunScript>) -> Self {
        *self.scripts.lock().unwrap_or_else(|e| e.into_inner()) = scripts.into();
        self
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, DryRunLedger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_script(&self) -> DryRunScript {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(DryRunScript::LandAtAttempt(1))
    }

    fn land(&self, unit: &AtomicUnit, slot: u64, bid: u64, sol_delta: i128) -> LandedUnit {
        let landed = LandedUnit {
            slot,
            sol_delta,
            token_delta: unit.expected_token_delta(),
            fee_paid: bid + unit.network_fee(),
        };
        self.ledger().apply(unit.mint(), &landed);
        info!(unit = %unit.id(), sol_delta, "[DRY RUN] Unit landed");
        landed
    }

    /// Simulated wallet balance for `mint`
    pub fn tokens_held(&self, mint: &Pubkey) -> u64 {
        self.ledger().tokens.get(mint).copied().unwrap_or(0)
    }

    pub fn set_tokens_held(&self, mint: Pubkey, amount: u64) {
        self.ledger().tokens.insert(mint, amount);
    }
}

#[async_trait]
impl ExecutionVenue for DryRunVenue {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn operator(&self) -> Pubkey {
        self.operator
    }

    async fn current_slot(&self) -> Result<u64> {
        Ok(self.clock.next())
    }

    async fn operator_balance(&self) -> Result<u64> {
        Ok(self.ledger().balance)
    }

    async fn loan_capacity(&self) -> Result<u64> {
        Ok(self.loan_capacity)
    }

    async fn submit(&self, unit: &AtomicUnit, bid: u64) -> Result<String> {
        if bid > unit.tip_ceiling() {
            return Err(Error::BundleRejected(format!(
                "Bid {} above unit ceiling {}",
                bid,
                unit.tip_ceiling()
            )));
        }

        let slot = self.clock.next();
        let mut entry = self.units.entry(unit.id()).or_insert_with(|| DryRunUnit {
            script: self.next_script(),
            attempts: 0,
            outcome: UnitOutcome::NotLanded,
        });
        entry.attempts += 1;
        let attempt = entry.attempts;
        let submission_id = format!("dry-{}-{}", unit.id(), attempt);

        // A unit settles at most once
        let status = if entry.outcome != UnitOutcome::NotLanded {
            UnitStatus::Dropped
        } else {
            match entry.script.clone() {
                DryRunScript::LandAtAttempt(n) if attempt >= n => {
                    let landed = self.land(unit, slot, bid, unit.expected_balance_delta(bid));
                    entry.outcome = UnitOutcome::Committed(landed.clone());
                    UnitStatus::Landed(landed)
                }
                DryRunScript::LandWithDelta {
                    attempt: n,
                    sol_delta,
                } if attempt >= n => {
                    let landed = self.land(unit, slot, bid, sol_delta);
                    entry.outcome = UnitOutcome::Committed(landed.clone());
                    UnitStatus::Landed(landed)
                }
                DryRunScript::Revert => {
                    let fee_paid = unit.network_fee();
                    {
                        let mut ledger = self.ledger();
                        ledger.balance = ledger.balance.saturating_sub(fee_paid);
                    }
                    entry.outcome = UnitOutcome::Reverted { fee_paid };
                    UnitStatus::Reverted {
                        fee_paid,
                        reason: "back-sell below floor".to_string(),
                    }
                }
                DryRunScript::Ambiguous { lands } => {
                    if lands {
                        let landed = self.land(unit, slot, bid, unit.expected_balance_delta(bid));
                        entry.outcome = UnitOutcome::Committed(landed);
                    }
                    UnitStatus::Unknown
                }
                _ => UnitStatus::Dropped,
            }
        };
        drop(entry);

        debug!(submission = %submission_id, bid, ?status, "[DRY RUN] Unit submitted");
        self.submissions.insert(submission_id.clone(), status);
        Ok(submission_id)
    }

    async fn unit_status(&self, submission_id: &str) -> Result<UnitStatus> {
        Ok(self
            .submissions
            .get(submission_id)
            .map(|s| s.value().clone())
            .unwrap_or(UnitStatus::Unknown))
    }

    async fn competing_bid(&self, unit: &AtomicUnit) -> Result<Option<u64>> {
        Ok(self.units.get(&unit.id()).and_then(|u| match u.script {
            DryRunScript::Outbid(bid) => Some(bid),
            _ => None,
        }))
    }

    async fn authoritative_outcome(
        &self,
        unit: &AtomicUnit,
        _submissions: &[String],
    ) -> Result<UnitOutcome> {
        Ok(self
            .units
            .get(&unit.id())
            .map(|u| u.outcome.clone())
            .unwrap_or(UnitOutcome::NotLanded))
    }

    async fn token_balance(&self, mint: &Pubkey) -> Result<u64> {
        Ok(self.tokens_held(mint))
    }

    fn release(&self, unit: &AtomicUnit) {
        self.units.remove(&unit.id());
        let prefix = format!("dry-{}-", unit.id());
        self.submissions.retain(|id, _| !id.starts_with(&prefix));
    }
}
