//! Per-pool reserve snapshots
//!
//! The listener writes, the evaluator and exit triggers read copies.
//! Nothing here is shared mutably across an evaluation. Graduated and idle
//! pools are swept out so the book tracks live curves only.

use dashmap::DashMap;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::pump::accounts::BondingCurve;
use crate::pump::price::Reserves;

/// Reserve state of one bonding curve at a slot
#[derive(Debug, Clone, PartialEq)]
pub struct PoolState {
    pub pool: Pubkey,
    pub mint: Pubkey,
    pub creator: Option<Pubkey>,
    /// Virtual reserves used for pricing
    pub reserves: Reserves,
    pub real_sol_reserves: u64,
    pub complete: bool,
    pub slot: u64,
}

impl PoolState {
    pub fn from_curve(pool: Pubkey, mint: Pubkey, curve: &BondingCurve, slot: u64) -> Self {
        Self {
            pool,
            mint,
            creator: Some(curve.creator).filter(|c| *c != Pubkey::default()),
            reserves: curve.reserves(),
            real_sol_reserves: curve.real_sol_reserves,
            complete: curve.complete,
            slot,
        }
    }

    /// Whether the curve is at or past migration
    pub fn is_graduated(&self, threshold_lamports: u64) -> bool {
        self.complete || self.real_sol_reserves >= threshold_lamports
    }

    pub fn is_creator(&self, wallet: &Pubkey) -> bool {
        self.creator.as_ref() == Some(wallet)
    }
}

const DEFAULT_SLOTLESS_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct Tracked {
    state: PoolState,
    /// When this process last accepted an update for the pool
    updated_at: Instant,
}

impl Tracked {
    fn new(state: PoolState) -> Self {
        Self {
            state,
            updated_at: Instant::now(),
        }
    }
}

/// Latest known state of every pool the feed has reported
#[derive(Debug)]
pub struct PoolBook {
    pools: DashMap<Pubkey, Tracked>,
    slotless_grace: Duration,
}

impl Default for PoolBook {
    fn default() -> Self {
        Self {
            pools: DashMap::new(),
            slotless_grace: DEFAULT_SLOTLESS_GRACE,
        }
    }
}

impl PoolBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slotless_grace(mut self, grace: Duration) -> Self {
        self.slotless_grace = grace;
        self
    }

    /// Insert or refresh a pool. Older slots never overwrite newer ones,
    /// and a known creator survives updates that lack one. Feeds without
    /// slot information report slot 0; such an update cannot replace a
    /// slot-stamped snapshot accepted within the grace period.
    pub fn upsert(&self, mut state: PoolState) {
        let pool = state.pool;
        match self.pools.get_mut(&pool) {
            Some(mut existing) => {
                let current = &existing.state;
                if state.slot != 0 && state.slot < current.slot {
                    trace!(pool = %pool, "Ignoring stale reserve update");
                    return;
                }
                if state.slot == 0
                    && current.slot != 0
                    && existing.updated_at.elapsed() < self.slotless_grace
                {
                    trace!(pool = %pool, slot = current.slot, "Keeping slot-stamped snapshot");
                    return;
                }
                if state.creator.is_none() {
                    state.creator = current.creator;
                }
                *existing = Tracked::new(state);
            }
            None => {
                self.pools.insert(pool, Tracked::new(state));
            }
        }
    }

    /// Record the creator of a pool whose reserves are known
    pub fn set_creator(&self, pool: &Pubkey, creator: Pubkey) {
        if let Some(mut existing) = self.pools.get_mut(pool) {
            existing.state.creator = Some(creator);
        }
    }

    /// Copy of the current state for one pool
    pub fn snapshot(&self, pool: &Pubkey) -> Option<PoolState> {
        self.pools.get(pool).map(|entry| entry.state.clone())
    }

    /// Find a pool by its mint
    pub fn by_mint(&self, mint: &Pubkey) -> Option<PoolState> {
        self.pools
            .iter()
            .find(|entry| entry.state.mint == *mint)
            .map(|entry| entry.state.clone())
    }

    /// Drop graduated pools and pools idle for `idle` or longer. Pools in
    /// `keep` stay regardless. Returns how many were dropped.
    pub fn evict(&self, idle: Duration, graduation_threshold: u64, keep: &HashSet<Pubkey>) -> usize {
        let before = self.pools.len();
        self.pools.retain(|pool, tracked| {
            keep.contains(pool)
                || (!tracked.state.is_graduated(graduation_threshold)
                    && tracked.updated_at.elapsed() < idle)
        });
        before.saturating_sub(self.pools.len())
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
