//! The bribe loop for one unit
//!
//! Submits the unit, polls its submissions and re-broadcasts at higher bids
//! until it lands, reverts or runs out of window. Every wait is bounded: the
//! loop polls every `poll_interval`, stops bidding at the expiry slot and
//! gives in-flight submissions `confirm_timeout` past that to resolve. A
//! wall-clock deadline fixed before the first tick caps the whole loop, so
//! a slot source that never answers cannot hold it open.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::status::{StatusBus, StatusUpdate};
use crate::position::settlement::Observation;
use crate::trading::bribe::{BribeAction, BribeController, BribePhase};
use crate::trading::orchestrator::{AtomicUnit, UnitKind};
use crate::trading::venue::{ExecutionVenue, UnitStatus};

/// Wall time per slot used to bound the loop when slots stop advancing
const SLOT_BUDGET: Duration = Duration::from_millis(400);

#[derive(Debug, Clone)]
pub struct AttemptSettings {
    pub poll_interval: Duration,
    pub confirm_timeout: Duration,
    pub min_step: u64,
}

impl AttemptSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.settlement.poll_interval_ms.max(1)),
            confirm_timeout: Duration::from_millis(config.settlement.confirm_timeout_ms),
            min_step: config.engine.escalation_min_step_lamports,
        }
    }
}

/// What one attempt did and how it ended
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub submissions: Vec<String>,
    /// Bid of the landed submission, else the last one sent
    pub final_bid: u64,
    pub phase: BribePhase,
    pub observation: Observation,
}

impl AttemptReport {
    pub fn broadcast(&self) -> bool {
        !self.submissions.is_empty()
    }
}

pub struct BribeLoop {
    venue: Arc<dyn ExecutionVenue>,
    status: StatusBus,
    settings: AttemptSettings,
}

impl BribeLoop {
    pub fn new(venue: Arc<dyn ExecutionVenue>, status: StatusBus, settings: AttemptSettings) -> Self {
        Self {
            venue,
            status,
            settings,
        }
    }

    /// Run the loop for `unit`, opening at `baseline`. `opened_slot` is the
    /// slot the unit was prepared at. Venue errors are logged and retried on
    /// the next tick; only the deadline ends the attempt without a verdict.
    pub async fn run(&self, unit: &AtomicUnit, baseline: u64, opened_slot: u64) -> AttemptReport {
        let mut bribe = BribeController::new(
            baseline,
            unit.tip_ceiling(),
            self.settings.min_step,
            unit.expiry_slot(),
        );
        let mut sent: Vec<(String, u64)> = Vec::new();
        let mut last_bid_slot: Option<u64> = None;
        let mut last_slot: Option<u64> = None;
        let mut closed_at: Option<Instant> = None;
        let mut unknown = false;

        let deadline = self.deadline(Instant::now(), unit.expiry_slot(), opened_slot);

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.check_submissions(&sent).await {
                Check::Landed(landed, bid) => {
                    bribe.mark_won();
                    info!(unit = %unit.id(), bid, slot = landed.slot, "Unit landed");
                    return report(sent, bid, bribe.phase(), Observation::Landed(landed));
                }
                Check::Reverted(fee_paid) => {
                    bribe.mark_expired();
                    warn!(unit = %unit.id(), fee_paid, "Unit reverted");
                    let bid = last_bid(&sent);
                    return report(sent, bid, bribe.phase(), Observation::Reverted { fee_paid });
                }
                Check::Unknown => unknown = true,
                Check::Open => {}
            }

            if Instant::now() >= deadline {
                bribe.mark_expired();
                if sent.is_empty() {
                    warn!(unit = %unit.id(), "Deadline passed before any submission");
                    return report(sent, 0, bribe.phase(), Observation::Expired { broadcast: false });
                }
                return self.give_up(unit, sent, &bribe, unknown);
            }

            let slot = match self.venue.current_slot().await {
                Ok(slot) => {
                    last_slot = Some(slot);
                    slot
                }
                Err(e) => {
                    warn!(unit = %unit.id(), "Slot query failed: {}", e);
                    match last_slot {
                        Some(slot) => slot,
                        None => continue,
                    }
                }
            };

            if slot > unit.expiry_slot() || bribe.phase() == BribePhase::Expired {
                bribe.mark_expired();
                if sent.is_empty() {
                    debug!(unit = %unit.id(), "Window closed before any submission");
                    return report(sent, 0, bribe.phase(), Observation::Expired { broadcast: false });
                }
                let since = *closed_at.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.settings.confirm_timeout {
                    return self.give_up(unit, sent, &bribe, unknown);
                }
                continue;
            }

            // One bid per slot; the opening bid goes out as-is
            if last_bid_slot.is_some_and(|s| s >= slot) {
                continue;
            }
            let action = if sent.is_empty() {
                BribeAction::Rebroadcast(bribe.bid())
            } else {
                let competing = self.venue.competing_bid(unit).await.unwrap_or_else(|e| {
                    debug!("Competing bid unavailable: {}", e);
                    None
                });
                bribe.escalate(slot, competing)
            };

            match action {
                BribeAction::Rebroadcast(bid) => match self.venue.submit(unit, bid).await {
                    Ok(id) => {
                        debug!(unit = %unit.id(), submission = %id, bid, slot, "Submitted");
                        last_bid_slot = Some(slot);
                        sent.push((id, bid));
                        if let UnitKind::Sandwich { opportunity_id } = unit.kind() {
                            self.status.publish(StatusUpdate::BidPlaced {
                                opportunity_id,
                                bid,
                            });
                        }
                    }
                    Err(e) => warn!(unit = %unit.id(), bid, "Submission failed: {}", e),
                },
                BribeAction::Hold => {
                    last_bid_slot = Some(slot);
                }
                BribeAction::GiveUp => {
                    info!(unit = %unit.id(), bid = bribe.bid(), "Bidding stopped");
                    // Submissions already out may still land; wait them out
                }
            }
        }
    }

    /// Slots may stall or the slot source may be down; the window is also
    /// budgeted in wall time from the slot the unit was prepared at
    fn deadline(&self, started: Instant, expiry_slot: u64, opened_slot: u64) -> Instant {
        let slots = expiry_slot.saturating_sub(opened_slot).saturating_add(1);
        let window = SLOT_BUDGET.saturating_mul(slots.min(u32::MAX as u64) as u32);
        started + window.saturating_add(self.settings.confirm_timeout)
    }

    async fn check_submissions(&self, sent: &[(String, u64)]) -> Check {
        let mut result = Check::Open;
        for (id, bid) in sent.iter().rev() {
            match self.venue.unit_status(id).await {
                Ok(UnitStatus::Landed(landed)) => return Check::Landed(landed, *bid),
                Ok(UnitStatus::Reverted { fee_paid, reason }) => {
                    debug!(submission = %id, %reason, "Submission reverted");
                    return Check::Reverted(fee_paid);
                }
                Ok(UnitStatus::Unknown) => result = Check::Unknown,
                Ok(UnitStatus::Pending | UnitStatus::Dropped) => {}
                Err(e) => {
                    debug!(submission = %id, "Status query failed: {}", e);
                    result = Check::Unknown;
                }
            }
        }
        result
    }

    fn give_up(
        &self,
        unit: &AtomicUnit,
        sent: Vec<(String, u64)>,
        bribe: &BribeController,
        unknown: bool,
    ) -> AttemptReport {
        let observation = if unknown {
            Observation::Ambiguous
        } else {
            Observation::Expired { broadcast: true }
        };
        info!(unit = %unit.id(), submissions = sent.len(), ?observation, "Attempt window closed");
        let bid = last_bid(&sent);
        report(sent, bid, bribe.phase(), observation)
    }
}

enum Check {
    Open,
    Unknown,
    Landed(crate::trading::venue::LandedUnit, u64),
    Reverted(u64),
}

fn last_bid(sent: &[(String, u64)]) -> u64 {
    sent.last().map(|(_, bid)| *bid).unwrap_or(0)
}

fn report(
    sent: Vec<(String, u64)>,
    final_bid: u64,
    phase: BribePhase,
    observation: Observation,
) -> AttemptReport {
    AttemptReport {
        submissions: sent.into_iter().map(|(id, _)| id).collect(),
        final_bid,
        phase,
        observation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::orchestrator::tests::{execution_params, opportunity};
    use crate::trading::venue::{DryRunScript, DryRunVenue, SlotClock};

    const CEILING: u64 = 5_000_000;

    fn settings() -> AttemptSettings {
        AttemptSettings {
            poll_interval: Duration::from_millis(2),
            confirm_timeout: Duration::from_millis(20),
            min_step: 5_000,
        }
    }

    /// Venue clock starts at the opportunity's slot (100, window 4)
    fn setup(scripts: Vec<DryRunScript>) -> (Arc<DryRunVenue>, BribeLoop, AtomicUnit) {
        let venue = Arc::new(
            DryRunVenue::new(10_000_000_000, SlotClock::ticking(100)).with_scripts(scripts),
        );
        let unit =
            AtomicUnit::sandwich(&opportunity(), venue.operator(), 0, &execution_params()).unwrap();
        let bribe_loop = BribeLoop::new(venue.clone(), StatusBus::new(), settings());
        (venue, bribe_loop, unit)
    }

    #[tokio::test]
    async fn test_lands_at_opening_bid() {
        let (_, bribe_loop, unit) = setup(vec![]);
        let report = bribe_loop.run(&unit, 10_000, 100).await;

        assert!(matches!(report.observation, Observation::Landed(_)));
        assert_eq!(report.phase, BribePhase::Won);
        assert_eq!(report.final_bid, 10_000);
        assert_eq!(report.submissions.len(), 1);
    }

    #[tokio::test]
    async fn test_escalates_until_landing() {
        let (_, bribe_loop, unit) = setup(vec![DryRunScript::LandAtAttempt(2)]);
        let report = bribe_loop.run(&unit, 10_000, 100).await;

        assert!(matches!(report.observation, Observation::Landed(_)));
        assert_eq!(report.submissions.len(), 2);
        assert!(report.final_bid > 10_000);
        assert!(report.final_bid <= CEILING);
    }

    #[tokio::test]
    async fn test_competitor_pushes_bid_to_ceiling_then_expires() {
        let (_, bribe_loop, unit) = setup(vec![DryRunScript::Outbid(CEILING - 1)]);
        let status = bribe_loop.status.clone();
        let mut updates = status.subscribe();

        let report = bribe_loop.run(&unit, 10_000, 100).await;

        assert_eq!(report.observation, Observation::Expired { broadcast: true });
        assert_eq!(report.phase, BribePhase::Expired);
        assert_eq!(report.final_bid, CEILING);

        let mut bids = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if let StatusUpdate::BidPlaced { bid, .. } = update {
                bids.push(bid);
            }
        }
        assert!(bids.windows(2).all(|w| w[0] <= w[1]));
        assert!(bids.iter().all(|b| *b <= CEILING));
    }

    #[tokio::test]
    async fn test_revert_ends_loop() {
        let (_, bribe_loop, unit) = setup(vec![DryRunScript::Revert]);
        let report = bribe_loop.run(&unit, 10_000, 100).await;
        assert_eq!(report.observation, Observation::Reverted { fee_paid: 10_000 });
    }

    #[tokio::test]
    async fn test_unknown_status_is_ambiguous() {
        let (_, bribe_loop, unit) = setup(vec![DryRunScript::Ambiguous { lands: true }]);
        let report = bribe_loop.run(&unit, 10_000, 100).await;
        assert_eq!(report.observation, Observation::Ambiguous);
        assert!(report.broadcast());
    }

    #[tokio::test]
    async fn test_expired_before_first_bid() {
        let venue = Arc::new(DryRunVenue::new(10_000_000_000, SlotClock::ticking(500)));
        let unit =
            AtomicUnit::sandwich(&opportunity(), venue.operator(), 0, &execution_params()).unwrap();
        let report = BribeLoop::new(venue, StatusBus::new(), settings())
            .run(&unit, 10_000, 100)
            .await;

        assert_eq!(report.observation, Observation::Expired { broadcast: false });
        assert!(!report.broadcast());
    }

    /// Dry-run venue whose slot source is always down
    struct SlotlessVenue(DryRunVenue);

    #[async_trait::async_trait]
    impl ExecutionVenue for SlotlessVenue {
        fn name(&self) -> &str {
            "slotless"
        }

        fn operator(&self) -> solana_sdk::pubkey::Pubkey {
            self.0.operator()
        }

        async fn current_slot(&self) -> crate::error::Result<u64> {
            Err(crate::error::Error::Rpc("connection refused".into()))
        }

        async fn operator_balance(&self) -> crate::error::Result<u64> {
            self.0.operator_balance().await
        }

        async fn loan_capacity(&self) -> crate::error::Result<u64> {
            self.0.loan_capacity().await
        }

        async fn submit(&self, unit: &AtomicUnit, bid: u64) -> crate::error::Result<String> {
            self.0.submit(unit, bid).await
        }

        async fn unit_status(&self, submission_id: &str) -> crate::error::Result<UnitStatus> {
            self.0.unit_status(submission_id).await
        }

        async fn authoritative_outcome(
            &self,
            unit: &AtomicUnit,
            submissions: &[String],
        ) -> crate::error::Result<crate::trading::venue::UnitOutcome> {
            self.0.authoritative_outcome(unit, submissions).await
        }

        async fn token_balance(&self, mint: &solana_sdk::pubkey::Pubkey) -> crate::error::Result<u64> {
            self.0.token_balance(mint).await
        }
    }

    #[tokio::test]
    async fn test_dead_slot_source_still_ends_attempt() {
        let venue = Arc::new(SlotlessVenue(DryRunVenue::new(
            10_000_000_000,
            SlotClock::ticking(100),
        )));
        let unit =
            AtomicUnit::sandwich(&opportunity(), venue.operator(), 0, &execution_params()).unwrap();
        let bribe_loop = BribeLoop::new(venue, StatusBus::new(), settings());

        let report = tokio::time::timeout(Duration::from_secs(5), bribe_loop.run(&unit, 10_000, 100))
            .await
            .expect("attempt must end on its own deadline");

        assert_eq!(report.observation, Observation::Expired { broadcast: false });
        assert_eq!(report.phase, BribePhase::Expired);
    }
}
