//! Position state machine
//!
//! Tracks tokens retained from landed sandwiches until an exit trigger
//! sells them. Every status change goes through `transition`, which rejects
//! anything the lifecycle does not allow. A position that reaches `Closed`
//! leaves the book; the caller gets its final state back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::strategy::pool_book::PoolState;
use crate::strategy::types::{Direction, SwapIntent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Unit in flight; not yet held
    PendingOpen,
    Open,
    /// Exit unit in flight
    PendingClose,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionStatus::PendingOpen => write!(f, "pending_open"),
            PositionStatus::Open => write!(f, "open"),
            PositionStatus::PendingClose => write!(f, "pending_close"),
            PositionStatus::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitTrigger {
    /// The token's creator is selling
    DevSellFrontRun,
    Graduation,
}

impl std::fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitTrigger::DevSellFrontRun => write!(f, "dev_sell"),
            ExitTrigger::Graduation => write!(f, "graduation"),
        }
    }
}

/// A single position in a token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub mint: Pubkey,
    pub pool: Pubkey,
    /// Lamports per token unit at acquisition
    pub acquisition_price: f64,
    pub acquisition_tokens: u64,
    /// Lamports attributed to the retained tokens
    pub acquisition_cost: u64,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub trigger: Option<ExitTrigger>,
    pub realized_pnl: i128,
}

impl Position {
    /// Exposure counts from `Open` until the exit settles
    pub fn is_held(&self) -> bool {
        matches!(self.status, PositionStatus::Open | PositionStatus::PendingClose)
    }
}

/// Which transitions the lifecycle allows
fn allowed(from: PositionStatus, to: PositionStatus) -> bool {
    use PositionStatus::*;
    matches!(
        (from, to),
        (PendingOpen, Open)
            | (Open, PendingClose)
            | (PendingClose, Closed)
            | (PendingClose, Open)
            | (PendingOpen, Closed)
            | (Open, Closed)
    )
}

/// Exit rules from a config snapshot
#[derive(Debug, Clone, Copy)]
pub struct ExitRules {
    pub front_run_dev_sells: bool,
    pub exit_on_graduation: bool,
    pub graduation_threshold_lamports: u64,
}

impl ExitRules {
    pub fn from_config(config: &Config) -> Self {
        Self {
            front_run_dev_sells: config.exits.front_run_dev_sells,
            exit_on_graduation: config.exits.exit_on_graduation,
            graduation_threshold_lamports: config.venue.graduation_threshold_lamports(),
        }
    }

    /// Trigger for positions on `pool`, given the latest pool state and the
    /// intent that produced it, if any
    pub fn trigger(&self, pool: &PoolState, intent: Option<&SwapIntent>) -> Option<ExitTrigger> {
        let dev_sell = intent.is_some_and(|i| {
            i.direction == Direction::Sell && i.pool == pool.pool && pool.is_creator(&i.source)
        });
        if self.front_run_dev_sells && dev_sell {
            return Some(ExitTrigger::DevSellFrontRun);
        }
        if self.exit_on_graduation && pool.is_graduated(self.graduation_threshold_lamports) {
            return Some(ExitTrigger::Graduation);
        }
        None
    }
}

/// All positions, keyed by id
#[derive(Default)]
pub struct PositionBook {
    positions: Arc<RwLock<HashMap<Uuid, Position>>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an in-flight sandwich unit
    pub async fn open_pending(&self, mint: Pubkey, pool: Pubkey) -> Uuid {
        let position = Position {
            id: Uuid::new_v4(),
            mint,
            pool,
            acquisition_price: 0.0,
            acquisition_tokens: 0,
            acquisition_cost: 0,
            status: PositionStatus::PendingOpen,
            opened_at: Utc::now(),
            trigger: None,
            realized_pnl: 0,
        };
        let id = position.id;
        self.positions.write().await.insert(id, position);
        debug!(position = %id, "Position pending");
        id
    }

    /// Move `id` to `to`, provided it currently sits in one of `from`
    async fn transition<F>(
        &self,
        id: Uuid,
        from: &[PositionStatus],
        to: PositionStatus,
        update: F,
    ) -> Result<Position>
    where
        F: FnOnce(&mut Position),
    {
        let mut positions = self.positions.write().await;
        let position = positions
            .get_mut(&id)
            .ok_or_else(|| Error::PositionNotFound(id.to_string()))?;

        if !from.contains(&position.status) || !allowed(position.status, to) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: position.status.to_string(),
                to: to.to_string(),
            });
        }

        update(position);
        debug!(position = %id, from = %position.status, to = %to, "Position transition");
        position.status = to;

        if to == PositionStatus::Closed {
            return positions
                .remove(&id)
                .ok_or_else(|| Error::PositionNotFound(id.to_string()));
        }
        Ok(position.clone())
    }

    /// Unit landed: the retained tokens are now held
    pub async fn confirm_open(&self, id: Uuid, tokens: u64, cost: u64) -> Result<Position> {
        let position = self
            .transition(id, &[PositionStatus::PendingOpen], PositionStatus::Open, |p| {
                p.acquisition_tokens = tokens;
                p.acquisition_cost = cost;
                p.acquisition_price = if tokens == 0 {
                    0.0
                } else {
                    cost as f64 / tokens as f64
                };
                p.opened_at = Utc::now();
            })
            .await?;
        info!(
            position = %id,
            tokens,
            cost,
            "Position opened"
        );
        Ok(position)
    }

    /// Nothing was retained: the unit's profit is the whole story
    pub async fn close_flat(&self, id: Uuid, realized: i128) -> Result<Position> {
        {
            let positions = self.positions.read().await;
            let position = positions
                .get(&id)
                .ok_or_else(|| Error::PositionNotFound(id.to_string()))?;
            if position.acquisition_tokens != 0 {
                return Err(Error::InvalidTransition {
                    id: id.to_string(),
                    from: format!("{} with tokens", position.status),
                    to: PositionStatus::Closed.to_string(),
                });
            }
        }
        self.transition(id, &[PositionStatus::Open], PositionStatus::Closed, |p| {
            p.realized_pnl = realized
        })
        .await
    }

    pub async fn begin_exit(&self, id: Uuid, trigger: ExitTrigger) -> Result<Position> {
        let position = self
            .transition(id, &[PositionStatus::Open], PositionStatus::PendingClose, |p| {
                p.trigger = Some(trigger)
            })
            .await?;
        info!(position = %id, %trigger, "Exit triggered");
        Ok(position)
    }

    /// Exit sell confirmed with `proceeds` lamports back
    pub async fn confirm_close(&self, id: Uuid, proceeds: i128) -> Result<Position> {
        let position = self
            .transition(id, &[PositionStatus::PendingClose], PositionStatus::Closed, |p| {
                p.realized_pnl = proceeds - p.acquisition_cost as i128;
                p.acquisition_tokens = 0;
            })
            .await?;
        info!(position = %id, pnl = position.realized_pnl, "Position closed");
        Ok(position)
    }

    /// Exit unit reverted or expired; the tokens are still held
    pub async fn revert_exit(&self, id: Uuid) -> Result<Position> {
        let position = self
            .transition(id, &[PositionStatus::PendingClose], PositionStatus::Open, |p| {
                p.trigger = None
            })
            .await?;
        warn!(position = %id, "Exit did not land; position open again");
        Ok(position)
    }

    /// Discard a position whose unit never committed
    pub async fn force_close(&self, id: Uuid, realized: i128) -> Result<Position> {
        let position = self
            .transition(
                id,
                &[
                    PositionStatus::PendingOpen,
                    PositionStatus::Open,
                    PositionStatus::PendingClose,
                ],
                PositionStatus::Closed,
                |p| p.realized_pnl = realized,
            )
            .await?;
        debug!(position = %id, "Position force-closed");
        Ok(position)
    }

    pub async fn get(&self, id: &Uuid) -> Option<Position> {
        self.positions.read().await.get(id).cloned()
    }

    /// Positions not yet closed
    pub async fn count(&self) -> usize {
        self.positions.read().await.len()
    }

    /// Positions an exit trigger may act on
    pub async fn open_on_pool(&self, pool: &Pubkey) -> Vec<Position> {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.status == PositionStatus::Open && &p.pool == pool)
            .cloned()
            .collect()
    }

    pub async fn held(&self) -> Vec<Position> {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.is_held())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::pool_book::tests::pool_state;
    use crate::strategy::types::IntentStage;

    async fn open_position(book: &PositionBook) -> Uuid {
        let id = book.open_pending(Pubkey::new_unique(), Pubkey::new_unique()).await;
        book.confirm_open(id, 1_000, 500).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let book = PositionBook::new();
        let id = open_position(&book).await;
        assert!(book.get(&id).await.unwrap().is_held());

        book.begin_exit(id, ExitTrigger::Graduation).await.unwrap();
        let closed = book.confirm_close(id, 800).await.unwrap();

        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.realized_pnl, 300);
        assert_eq!(closed.trigger, Some(ExitTrigger::Graduation));
        assert!(book.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_closed_positions_leave_the_book() {
        let book = PositionBook::new();
        for _ in 0..100 {
            let id = book.open_pending(Pubkey::new_unique(), Pubkey::new_unique()).await;
            let closed = book.force_close(id, 0).await.unwrap();
            assert_eq!(closed.status, PositionStatus::Closed);
        }
        let flat = book.open_pending(Pubkey::new_unique(), Pubkey::new_unique()).await;
        book.confirm_open(flat, 0, 0).await.unwrap();
        book.close_flat(flat, 1).await.unwrap();

        let held = open_position(&book).await;
        assert_eq!(book.count().await, 1);
        assert!(book.get(&held).await.is_some());
    }

    #[tokio::test]
    async fn test_pending_open_is_not_held() {
        let book = PositionBook::new();
        let id = book.open_pending(Pubkey::new_unique(), Pubkey::new_unique()).await;
        assert!(!book.get(&id).await.unwrap().is_held());
        assert!(book.held().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_requires_pending_close() {
        let book = PositionBook::new();
        let id = open_position(&book).await;

        let err = book.confirm_close(id, 1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let pending = book.open_pending(Pubkey::new_unique(), Pubkey::new_unique()).await;
        assert!(book.begin_exit(pending, ExitTrigger::Graduation).await.is_err());
    }

    #[tokio::test]
    async fn test_reverted_exit_reopens() {
        let book = PositionBook::new();
        let id = open_position(&book).await;
        book.begin_exit(id, ExitTrigger::DevSellFrontRun).await.unwrap();

        let reopened = book.revert_exit(id).await.unwrap();
        assert_eq!(reopened.status, PositionStatus::Open);
        assert_eq!(reopened.trigger, None);
        assert_eq!(reopened.acquisition_tokens, 1_000);
    }

    #[tokio::test]
    async fn test_closed_is_terminal() {
        let book = PositionBook::new();
        let id = book.open_pending(Pubkey::new_unique(), Pubkey::new_unique()).await;
        book.force_close(id, -5_000).await.unwrap();

        assert!(matches!(
            book.confirm_open(id, 1, 1).await,
            Err(Error::PositionNotFound(_))
        ));
        assert!(book.force_close(id, 0).await.is_err());
        assert!(matches!(
            book.begin_exit(Uuid::new_v4(), ExitTrigger::Graduation).await,
            Err(Error::PositionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_flat_requires_no_tokens() {
        let book = PositionBook::new();
        let flat = book.open_pending(Pubkey::new_unique(), Pubkey::new_unique()).await;
        book.confirm_open(flat, 0, 0).await.unwrap();
        assert_eq!(book.close_flat(flat, 42).await.unwrap().realized_pnl, 42);

        let held = open_position(&book).await;
        assert!(book.close_flat(held, 42).await.is_err());
    }

    fn rules() -> ExitRules {
        ExitRules {
            front_run_dev_sells: true,
            exit_on_graduation: true,
            graduation_threshold_lamports: 85_000_000_000,
        }
    }

    fn sell_by(pool: &PoolState, source: Pubkey) -> SwapIntent {
        SwapIntent {
            id: "dev".into(),
            source,
            pool: pool.pool,
            mint: pool.mint,
            direction: Direction::Sell,
            amount: 1_000,
            slippage_bps: 0,
            limit: None,
            stage: IntentStage::Pending,
            slot: 1,
            observed_at: Utc::now(),
            raw_transaction: None,
        }
    }

    #[test]
    fn test_dev_sell_trigger() {
        let creator = Pubkey::new_unique();
        let mut pool = pool_state(100, 100);
        pool.creator = Some(creator);

        assert_eq!(
            rules().trigger(&pool, Some(&sell_by(&pool, creator))),
            Some(ExitTrigger::DevSellFrontRun)
        );
        assert_eq!(rules().trigger(&pool, Some(&sell_by(&pool, Pubkey::new_unique()))), None);

        let disabled = ExitRules {
            front_run_dev_sells: false,
            ..rules()
        };
        assert_eq!(disabled.trigger(&pool, Some(&sell_by(&pool, creator))), None);
    }

    #[test]
    fn test_graduation_trigger() {
        let mut pool = pool_state(100, 100);
        pool.real_sol_reserves = 85_000_000_000;
        assert_eq!(rules().trigger(&pool, None), Some(ExitTrigger::Graduation));

        pool.real_sol_reserves = 0;
        pool.complete = true;
        assert_eq!(rules().trigger(&pool, None), Some(ExitTrigger::Graduation));
    }
}
