//! Atomic units and their preparation
//!
//! An `AtomicUnit` is the all-or-nothing bundle the venue executes. Borrow
//! and repay always travel together, and the back-sell floor covers the
//! repayment, so a shortfall fails the whole unit on chain.

use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::flashloan::{CollateralPool, CollateralReservation, LoanRequest};
use super::venue::ExecutionVenue;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pump::price::bps_ceil;
use crate::strategy::types::Opportunity;

/// Compute budget for either leg
pub const COMPUTE_UNIT_LIMIT: u32 = 200_000;

/// One step of a unit, in execution order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum UnitStep {
    PriorityFee { compute_unit_limit: u32 },
    Borrow { principal: u64 },
    /// Buy exactly `tokens`, paying at most `max_sol_cost`
    FrontBuy { tokens: u64, max_sol_cost: u64 },
    AwaitTarget { intent_id: String },
    BackSell { tokens: u64, min_sol_out: u64 },
    Repay { total: u64 },
    /// Block engine tip; the bid itself is chosen at submission
    Tip { ceiling: u64 },
}

impl UnitStep {
    fn rank(&self) -> u8 {
        match self {
            UnitStep::PriorityFee { .. } => 0,
            UnitStep::Borrow { .. } => 1,
            UnitStep::FrontBuy { .. } => 2,
            UnitStep::AwaitTarget { .. } => 3,
            UnitStep::BackSell { .. } => 4,
            UnitStep::Repay { .. } => 5,
            UnitStep::Tip { .. } => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    Sandwich { opportunity_id: Uuid },
    Exit { position_id: Uuid },
}

/// Sell order for a held position
#[derive(Debug, Clone)]
pub struct ExitOrder {
    pub position_id: Uuid,
    pub pool: Pubkey,
    pub mint: Pubkey,
    pub tokens: u64,
    pub min_sol_out: u64,
    pub expected_proceeds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AtomicUnit {
    id: Uuid,
    kind: UnitKind,
    pool: Pubkey,
    mint: Pubkey,
    operator: Pubkey,
    steps: Vec<UnitStep>,
    loan: Option<LoanRequest>,
    expiry_slot: u64,
    network_fee: u64,
    expected_proceeds: u64,
    expected_token_delta: i128,
    #[serde(skip)]
    target_transaction: Option<Vec<u8>>,
}

impl AtomicUnit {
    /// Flashloan-funded front-run and back-run around one target swap
    pub fn sandwich(
        opportunity: &Opportunity,
        operator: Pubkey,
        collateral: u64,
        params: &ExecutionParams,
    ) -> Result<Self> {
        let principal = opportunity.front_run_lamports;
        if principal == 0 || opportunity.min_front_tokens == 0 {
            return Err(Error::UnitConstruction("Empty front-run".to_string()));
        }
        let loan = LoanRequest::new(principal, collateral, operator, params.loan_fee_bps);

        let steps = vec![
            UnitStep::PriorityFee {
                compute_unit_limit: COMPUTE_UNIT_LIMIT,
            },
            UnitStep::Borrow { principal },
            UnitStep::FrontBuy {
                tokens: opportunity.min_front_tokens,
                max_sol_cost: principal,
            },
            UnitStep::AwaitTarget {
                intent_id: opportunity.intent_id.clone(),
            },
            UnitStep::BackSell {
                tokens: opportunity.back_run_tokens,
                min_sol_out: opportunity.min_back_proceeds,
            },
            UnitStep::Repay {
                total: loan.repay_total(),
            },
            UnitStep::Tip {
                ceiling: params.priority_fee_ceiling,
            },
        ];

        let unit = Self {
            id: Uuid::new_v4(),
            kind: UnitKind::Sandwich {
                opportunity_id: opportunity.id,
            },
            pool: opportunity.pool,
            mint: opportunity.mint,
            operator,
            steps,
            loan: Some(loan),
            expiry_slot: opportunity.expiry_slot,
            network_fee: params.network_fee,
            expected_proceeds: opportunity.expected_proceeds,
            expected_token_delta: opportunity.retained_tokens as i128,
            target_transaction: opportunity.target_transaction.clone(),
        };
        unit.validate()?;
        Ok(unit)
    }

    /// Loan-free sell of a held position
    pub fn exit(
        order: &ExitOrder,
        operator: Pubkey,
        expiry_slot: u64,
        params: &ExecutionParams,
    ) -> Result<Self> {
        if order.tokens == 0 {
            return Err(Error::UnitConstruction("Nothing to sell".to_string()));
        }

        let unit = Self {
            id: Uuid::new_v4(),
            kind: UnitKind::Exit {
                position_id: order.position_id,
            },
            pool: order.pool,
            mint: order.mint,
            operator,
            steps: vec![
                UnitStep::PriorityFee {
                    compute_unit_limit: COMPUTE_UNIT_LIMIT,
                },
                UnitStep::BackSell {
                    tokens: order.tokens,
                    min_sol_out: order.min_sol_out,
                },
                UnitStep::Tip {
                    ceiling: params.priority_fee_ceiling,
                },
            ],
            loan: None,
            expiry_slot,
            network_fee: params.network_fee,
            expected_proceeds: order.expected_proceeds,
            expected_token_delta: -(order.tokens as i128),
            target_transaction: None,
        };
        unit.validate()?;
        Ok(unit)
    }

    fn validate(&self) -> Result<()> {
        let ordered = self
            .steps
            .windows(2)
            .all(|pair| pair[0].rank() < pair[1].rank());
        if !ordered {
            return Err(Error::UnitConstruction("Steps out of order".to_string()));
        }

        if !matches!(self.steps.last(), Some(UnitStep::Tip { .. })) {
            return Err(Error::UnitConstruction("Unit must end with a tip".to_string()));
        }

        let borrow = self.steps.iter().find_map(|s| match s {
            UnitStep::Borrow { principal } => Some(*principal),
            _ => None,
        });
        let repay = self.steps.iter().find_map(|s| match s {
            UnitStep::Repay { total } => Some(*total),
            _ => None,
        });
        let sell_floor = self.back_sell().map(|(_, min_sol_out)| min_sol_out);

        match (borrow, repay, &self.loan) {
            (None, None, None) => {}
            (Some(principal), Some(total), Some(loan)) => {
                if principal != loan.principal() || total != loan.repay_total() {
                    return Err(Error::UnitConstruction(
                        "Borrow or repay disagrees with loan terms".to_string(),
                    ));
                }
                let floor = sell_floor.ok_or_else(|| {
                    Error::UnitConstruction("Loan without a back-sell".to_string())
                })?;
                if floor < total {
                    return Err(Error::UnitConstruction(format!(
                        "Back-sell floor {} does not cover repayment {}",
                        floor, total
                    )));
                }
            }
            _ => {
                return Err(Error::UnitConstruction(
                    "Borrow and repay must appear together".to_string(),
                ))
            }
        }

        match self.back_sell() {
            Some((tokens, _)) if tokens > 0 => Ok(()),
            _ => Err(Error::UnitConstruction("Back-sell sells nothing".to_string())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn pool(&self) -> &Pubkey {
        &self.pool
    }

    pub fn mint(&self) -> &Pubkey {
        &self.mint
    }

    pub fn operator(&self) -> &Pubkey {
        &self.operator
    }

    pub fn steps(&self) -> &[UnitStep] {
        &self.steps
    }

    pub fn loan(&self) -> Option<&LoanRequest> {
        self.loan.as_ref()
    }

    pub fn expiry_slot(&self) -> u64 {
        self.expiry_slot
    }

    pub fn target_transaction(&self) -> Option<&[u8]> {
        self.target_transaction.as_deref()
    }

    pub fn front_buy(&self) -> Option<(u64, u64)> {
        self.steps.iter().find_map(|s| match s {
            UnitStep::FrontBuy {
                tokens,
                max_sol_cost,
            } => Some((*tokens, *max_sol_cost)),
            _ => None,
        })
    }

    pub fn back_sell(&self) -> Option<(u64, u64)> {
        self.steps.iter().find_map(|s| match s {
            UnitStep::BackSell {
                tokens,
                min_sol_out,
            } => Some((*tokens, *min_sol_out)),
            _ => None,
        })
    }

    pub fn tip_ceiling(&self) -> u64 {
        self.steps
            .iter()
            .find_map(|s| match s {
                UnitStep::Tip { ceiling } => Some(*ceiling),
                _ => None,
            })
            .unwrap_or(0)
    }

    /// Operator SOL change if the unit lands as estimated with `bid`
    pub fn expected_balance_delta(&self, bid: u64) -> i128 {
        let mut delta = self.expected_proceeds as i128;
        if let Some(loan) = &self.loan {
            // Principal is borrowed, so only the fee leaves the wallet
            delta -= loan.principal() as i128 + loan.fee() as i128;
        }
        delta - bid as i128 - self.network_fee as i128
    }

    /// Token change if the unit lands: retained tokens, or minus the sale
    pub fn expected_token_delta(&self) -> i128 {
        self.expected_token_delta
    }

    pub fn network_fee(&self) -> u64 {
        self.network_fee
    }
}

/// Per-cycle execution parameters, taken from a config snapshot
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    pub loan_fee_bps: u32,
    pub collateral_bps: u32,
    pub priority_fee_ceiling: u64,
    pub network_fee: u64,
    pub min_step: u64,
    pub exit_window_slots: u64,
    pub exit_slippage_bps: u32,
}

impl ExecutionParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            loan_fee_bps: config.venue.loan_fee_bps,
            collateral_bps: config.venue.collateral_bps,
            priority_fee_ceiling: config.engine.priority_fee_ceiling_lamports,
            network_fee: config.venue.network_fee_lamports,
            min_step: config.engine.escalation_min_step_lamports,
            exit_window_slots: config.engine.opportunity_window_slots,
            exit_slippage_bps: config.exits.exit_slippage_bps,
        }
    }

    /// Operator funds a unit can consume in the worst case
    fn required_collateral(&self, principal: u64) -> u64 {
        bps_ceil(principal, self.collateral_bps)
            .saturating_add(self.priority_fee_ceiling)
            .saturating_add(self.network_fee)
    }
}

/// A unit ready for the bribe loop, holding its collateral
#[derive(Debug)]
pub struct PreparedAttempt {
    unit: AtomicUnit,
    opportunity: Option<Opportunity>,
    reservation: CollateralReservation,
    /// Slot the unit was prepared at
    opened_slot: u64,
}

impl PreparedAttempt {
    pub fn unit(&self) -> &AtomicUnit {
        &self.unit
    }

    pub fn opportunity(&self) -> Option<&Opportunity> {
        self.opportunity.as_ref()
    }

    pub fn collateral(&self) -> u64 {
        self.reservation.amount()
    }

    pub fn opened_slot(&self) -> u64 {
        self.opened_slot
    }
}

/// Turns opportunities and exit orders into collateralized units
pub struct FlashloanOrchestrator {
    venue: Arc<dyn ExecutionVenue>,
    collateral: CollateralPool,
}

impl FlashloanOrchestrator {
    pub fn new(venue: Arc<dyn ExecutionVenue>, collateral: CollateralPool) -> Self {
        Self { venue, collateral }
    }

    pub fn collateral(&self) -> &CollateralPool {
        &self.collateral
    }

    pub async fn prepare(
        &self,
        opportunity: &Opportunity,
        current_slot: u64,
        params: &ExecutionParams,
    ) -> Result<PreparedAttempt> {
        if !opportunity.is_live(current_slot) {
            return Err(Error::OpportunityExpired {
                id: opportunity.id.to_string(),
                expiry_slot: opportunity.expiry_slot,
                current_slot,
            });
        }

        let principal = opportunity.front_run_lamports;
        let capacity = self.venue.loan_capacity().await?;
        if capacity < principal {
            return Err(Error::LoanUnavailable {
                requested: principal,
                capacity,
            });
        }

        let reservation = self
            .collateral
            .reserve(params.required_collateral(principal))?;
        let unit = AtomicUnit::sandwich(
            opportunity,
            self.venue.operator(),
            reservation.amount(),
            params,
        )?;

        info!(
            unit = %unit.id(),
            opportunity = %opportunity.id,
            principal,
            collateral = reservation.amount(),
            "Sandwich unit prepared"
        );

        Ok(PreparedAttempt {
            unit,
            opportunity: Some(opportunity.clone()),
            reservation,
            opened_slot: current_slot,
        })
    }

    pub fn prepare_exit(
        &self,
        order: &ExitOrder,
        current_slot: u64,
        params: &ExecutionParams,
    ) -> Result<PreparedAttempt> {
        let reservation = self.collateral.reserve(params.required_collateral(0))?;
        let unit = AtomicUnit::exit(
            order,
            self.venue.operator(),
            current_slot + params.exit_window_slots,
            params,
        )?;
        debug!(unit = %unit.id(), position = %order.position_id, "Exit unit prepared");

        Ok(PreparedAttempt {
            unit,
            opportunity: None,
            reservation,
            opened_slot: current_slot,
        })
    }
}
