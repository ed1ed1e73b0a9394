//! Priority-fee escalation for one submission attempt
//!
//! The bid opens at the tip manager's recommendation and climbs toward the
//! ceiling as the slot window closes. It never decreases and never exceeds
//! the ceiling.

use serde::Serialize;
use tracing::debug;

/// Where an attempt's bidding stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BribePhase {
    Initial,
    Escalating,
    Won,
    Expired,
}

/// What the attempt loop should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BribeAction {
    /// Resubmit with this bid
    Rebroadcast(u64),
    /// Bid is at the ceiling; keep waiting
    Hold,
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BribeState {
    pub bid: u64,
    pub ceiling: u64,
    pub last_competing_bid: Option<u64>,
    /// Minimum raise per escalation
    pub step: u64,
}

pub struct BribeController {
    state: BribeState,
    phase: BribePhase,
    expiry_slot: u64,
}

impl BribeController {
    pub fn new(baseline: u64, ceiling: u64, min_step: u64, expiry_slot: u64) -> Self {
        Self {
            state: BribeState {
                bid: baseline.min(ceiling),
                ceiling,
                last_competing_bid: None,
                step: min_step.max(1),
            },
            phase: BribePhase::Initial,
            expiry_slot,
        }
    }

    pub fn bid(&self) -> u64 {
        self.state.bid
    }

    pub fn phase(&self) -> BribePhase {
        self.phase
    }

    pub fn state(&self) -> &BribeState {
        &self.state
    }

    /// Decide the next move at `slot`, given the best competing bid seen
    pub fn escalate(&mut self, slot: u64, competing_bid: Option<u64>) -> BribeAction {
        match self.phase {
            BribePhase::Won => return BribeAction::Hold,
            BribePhase::Expired => return BribeAction::GiveUp,
            BribePhase::Initial | BribePhase::Escalating => {}
        }

        if slot > self.expiry_slot {
            debug!(slot, expiry = self.expiry_slot, "Bribe window closed");
            self.phase = BribePhase::Expired;
            return BribeAction::GiveUp;
        }

        if let Some(competing) = competing_bid {
            self.state.last_competing_bid = Some(competing);
            // Outbidding would need ceiling + 1
            if competing >= self.state.ceiling {
                debug!(competing, ceiling = self.state.ceiling, "Outbid beyond ceiling");
                self.phase = BribePhase::Expired;
                return BribeAction::GiveUp;
            }
        }

        self.phase = BribePhase::Escalating;
        if self.state.bid >= self.state.ceiling {
            return BribeAction::Hold;
        }

        let slots_remaining = self.expiry_slot - slot + 1;
        let headroom = self.state.ceiling - self.state.bid;
        let step = self.state.step.max(headroom / slots_remaining);

        let mut next = self.state.bid.saturating_add(step);
        if let Some(competing) = competing_bid {
            next = next.max(competing + 1);
        }
        self.state.bid = next.min(self.state.ceiling);

        BribeAction::Rebroadcast(self.state.bid)
    }

    pub fn mark_won(&mut self) {
        self.phase = BribePhase::Won;
    }

    /// Close out an attempt that ran out of time without a result
    pub fn mark_expired(&mut self) {
        if self.phase != BribePhase::Won {
            self.phase = BribePhase::Expired;
        }
    }
}
