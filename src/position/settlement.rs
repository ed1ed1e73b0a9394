//! Settlement of attempted units
//!
//! Turns what the attempt loop observed into ledger and position changes.
//! Nothing is mutated on a guess: ambiguous observations are re-read from
//! confirmed chain state first.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::book::PositionBook;
use super::ledger::ProfitLedger;
use crate::config::Config;
use crate::engine::status::{StatusBus, StatusUpdate};
use crate::error::{Error, Result};
use crate::pump::price::bps_of;
use crate::trading::flashloan::CollateralPool;
use crate::trading::orchestrator::{AtomicUnit, UnitKind};
use crate::trading::venue::{ExecutionVenue, LandedUnit, UnitOutcome};

/// What the attempt loop saw when it stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Landed(LandedUnit),
    Reverted { fee_paid: u64 },
    /// Window closed; `broadcast` if any submission was accepted
    Expired { broadcast: bool },
    /// Status could not be determined before the deadline
    Ambiguous,
}

impl std::fmt::Display for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Observation::Landed(_) => write!(f, "landed"),
            Observation::Reverted { .. } => write!(f, "reverted"),
            Observation::Expired { .. } => write!(f, "expired"),
            Observation::Ambiguous => write!(f, "ambiguous"),
        }
    }
}

/// One attempt as the settlement guard needs it
#[derive(Debug, Clone, Copy)]
pub struct AttemptRecord<'a> {
    pub unit: &'a AtomicUnit,
    pub position_id: Uuid,
    pub submissions: &'a [String],
    pub final_bid: u64,
}

/// Result of settling one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Sandwich landed and tokens were retained
    Opened {
        position_id: Uuid,
        tokens: u64,
        realized: i128,
    },
    /// Sandwich landed with nothing retained
    Flat { position_id: Uuid, realized: i128 },
    /// Sandwich never committed
    Discarded { position_id: Uuid, fee_paid: u64 },
    ExitClosed { position_id: Uuid, pnl: i128 },
    /// Exit never committed; the position is open again
    ExitRestored { position_id: Uuid, fee_paid: u64 },
}

impl std::fmt::Display for Settlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Settlement::Opened { tokens, realized, .. } => {
                write!(f, "landed: {} lamports, {} tokens held", realized, tokens)
            }
            Settlement::Flat { realized, .. } => write!(f, "landed: {} lamports", realized),
            Settlement::Discarded { fee_paid, .. } => write!(f, "discarded (fee {})", fee_paid),
            Settlement::ExitClosed { pnl, .. } => write!(f, "exit closed: pnl {}", pnl),
            Settlement::ExitRestored { fee_paid, .. } => {
                write!(f, "exit failed (fee {}); position reopened", fee_paid)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettlementParams {
    pub estimate_tolerance_bps: u32,
    pub query_timeout: Duration,
}

impl SettlementParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            estimate_tolerance_bps: config.settlement.estimate_tolerance_bps,
            query_timeout: Duration::from_millis(config.rpc.timeout_ms),
        }
    }
}

pub struct SettlementGuard {
    venue: Arc<dyn ExecutionVenue>,
    positions: Arc<PositionBook>,
    ledger: Arc<ProfitLedger>,
    collateral: CollateralPool,
    status: StatusBus,
}

impl SettlementGuard {
    pub fn new(
        venue: Arc<dyn ExecutionVenue>,
        positions: Arc<PositionBook>,
        ledger: Arc<ProfitLedger>,
        collateral: CollateralPool,
        status: StatusBus,
    ) -> Self {
        Self {
            venue,
            positions,
            ledger,
            collateral,
            status,
        }
    }

    pub async fn settle(
        &self,
        attempt: &AttemptRecord<'_>,
        observation: Observation,
        params: &SettlementParams,
    ) -> Result<Settlement> {
        let outcome = self.resolve(attempt, observation, params).await?;
        debug!(unit = %attempt.unit.id(), ?outcome, "Settling unit");

        match attempt.unit.kind() {
            UnitKind::Sandwich { .. } => self.settle_sandwich(attempt, outcome, params).await,
            UnitKind::Exit { .. } => self.settle_exit(attempt, outcome).await,
        }
    }

    async fn resolve(
        &self,
        attempt: &AttemptRecord<'_>,
        observation: Observation,
        params: &SettlementParams,
    ) -> Result<UnitOutcome> {
        match observation {
            Observation::Landed(landed) => Ok(UnitOutcome::Committed(landed)),
            Observation::Reverted { fee_paid } => Ok(UnitOutcome::Reverted { fee_paid }),
            Observation::Expired { broadcast: false } => Ok(UnitOutcome::NotLanded),
            Observation::Expired { broadcast: true } | Observation::Ambiguous => {
                info!(unit = %attempt.unit.id(), "Re-reading outcome from chain");
                tokio::time::timeout(
                    params.query_timeout,
                    self.venue
                        .authoritative_outcome(attempt.unit, attempt.submissions),
                )
                .await
                .map_err(|_| Error::RpcTimeout(params.query_timeout.as_millis() as u64))?
            }
        }
    }

    async fn settle_sandwich(
        &self,
        attempt: &AttemptRecord<'_>,
        outcome: UnitOutcome,
        params: &SettlementParams,
    ) -> Result<Settlement> {
        let id = attempt.position_id;
        let unit = attempt.unit;

        let landed = match outcome {
            UnitOutcome::Committed(landed) => landed,
            UnitOutcome::Reverted { fee_paid } => {
                self.collateral.apply_delta(-(fee_paid as i128));
                self.ledger.record_revert(fee_paid).await;
                self.positions.force_close(id, -(fee_paid as i128)).await?;
                self.publish_position(id, "closed");
                return Ok(Settlement::Discarded {
                    position_id: id,
                    fee_paid,
                });
            }
            UnitOutcome::NotLanded => {
                self.ledger.record_expired().await;
                self.positions.force_close(id, 0).await?;
                self.publish_position(id, "closed");
                return Ok(Settlement::Discarded {
                    position_id: id,
                    fee_paid: 0,
                });
            }
        };

        let realized = landed.sol_delta;
        self.collateral.apply_delta(realized);
        let session_total = self.ledger.record_landed(realized).await;
        self.status.publish(StatusUpdate::ProfitRecorded {
            realized,
            session_total,
        });

        let divergence = divergence(unit, attempt.final_bid, &landed, params.estimate_tolerance_bps);
        let tokens = match &divergence {
            None => landed.token_delta.max(0) as u64,
            Some(_) => self.chain_tokens(id, unit).await?,
        };

        let cost = match unit.front_buy() {
            Some((front_tokens, principal)) if front_tokens > 0 => {
                (principal as u128 * tokens as u128 / front_tokens as u128) as u64
            }
            _ => 0,
        };
        self.positions.confirm_open(id, tokens, cost).await?;

        let settlement = if tokens == 0 {
            self.positions.close_flat(id, realized).await?;
            self.publish_position(id, "closed");
            Settlement::Flat {
                position_id: id,
                realized,
            }
        } else {
            self.publish_position(id, "open");
            Settlement::Opened {
                position_id: id,
                tokens,
                realized,
            }
        };

        if let Some(detail) = divergence {
            error!(position = %id, %detail, "Settlement diverged from estimate");
            self.status.publish(StatusUpdate::OperatorAlert {
                detail: format!("position {}: {}", id, detail),
            });
            return Err(Error::SettlementDivergence {
                id: id.to_string(),
                detail,
            });
        }
        Ok(settlement)
    }

    async fn settle_exit(
        &self,
        attempt: &AttemptRecord<'_>,
        outcome: UnitOutcome,
    ) -> Result<Settlement> {
        let id = attempt.position_id;
        match outcome {
            UnitOutcome::Committed(landed) => {
                self.collateral.apply_delta(landed.sol_delta);
                let closed = self.positions.confirm_close(id, landed.sol_delta).await?;
                let session_total = self.ledger.record_exit(closed.realized_pnl).await;
                self.status.publish(StatusUpdate::ProfitRecorded {
                    realized: closed.realized_pnl,
                    session_total,
                });
                self.publish_position(id, "closed");
                Ok(Settlement::ExitClosed {
                    position_id: id,
                    pnl: closed.realized_pnl,
                })
            }
            UnitOutcome::Reverted { fee_paid } => {
                self.collateral.apply_delta(-(fee_paid as i128));
                self.ledger.record_revert(fee_paid).await;
                self.positions.revert_exit(id).await?;
                self.publish_position(id, "open");
                Ok(Settlement::ExitRestored {
                    position_id: id,
                    fee_paid,
                })
            }
            UnitOutcome::NotLanded => {
                self.ledger.record_expired().await;
                self.positions.revert_exit(id).await?;
                self.publish_position(id, "open");
                Ok(Settlement::ExitRestored {
                    position_id: id,
                    fee_paid: 0,
                })
            }
        }
    }

    /// Tokens on chain for the unit's mint, less what other positions hold
    async fn chain_tokens(&self, id: Uuid, unit: &AtomicUnit) -> Result<u64> {
        let on_chain = self.venue.token_balance(unit.mint()).await?;
        let others: u64 = self
            .positions
            .held()
            .await
            .iter()
            .filter(|p| p.id != id && &p.mint == unit.mint())
            .map(|p| p.acquisition_tokens)
            .sum();
        warn!(position = %id, on_chain, others, "Resyncing position from chain");
        Ok(on_chain.saturating_sub(others))
    }

    fn publish_position(&self, id: Uuid, status: &str) {
        self.status.publish(StatusUpdate::PositionChanged {
            position_id: id,
            status: status.to_string(),
        });
    }
}

/// Why a landed unit cannot be trusted as estimated, if it cannot
fn divergence(
    unit: &AtomicUnit,
    bid: u64,
    landed: &LandedUnit,
    tolerance_bps: u32,
) -> Option<String> {
    if landed.sol_delta <= 0 {
        return Some(format!("committed at a loss ({} lamports)", landed.sol_delta));
    }

    let expected = unit.expected_balance_delta(bid);
    let tolerance = bps_of(expected.unsigned_abs().min(u64::MAX as u128) as u64, tolerance_bps);
    let gap = (landed.sol_delta - expected).unsigned_abs();
    if gap > tolerance as u128 {
        return Some(format!(
            "realized {} vs estimated {} lamports",
            landed.sol_delta, expected
        ));
    }

    if landed.token_delta != unit.expected_token_delta() {
        return Some(format!(
            "token change {} vs estimated {}",
            landed.token_delta,
            unit.expected_token_delta()
        ));
    }
    None
}
