//! Engine wiring
//!
//! Pulls intents from the listener, checks held positions for exit
//! triggers, evaluates sandwich candidates and runs each attempt as its own
//! task. One config snapshot is taken per intent; everything spawned for that
//! intent keeps it.

use solana_sdk::pubkey::Pubkey;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::attempt::{AttemptSettings, BribeLoop};
use super::lifecycle::Lifecycle;
use super::status::{StatusBus, StatusUpdate};
use crate::config::{Config, ConfigHandle};
use crate::error::{Error, Result};
use crate::position::book::{ExitRules, Position, PositionBook};
use crate::position::ledger::{ProfitLedger, SessionStats};
use crate::position::settlement::{AttemptRecord, SettlementGuard, SettlementParams};
use crate::pump::price::{calculate_min_with_slippage, lamports_to_sol};
use crate::strategy::evaluator::{EvaluatorParams, OpportunityEvaluator};
use crate::strategy::pool_book::{PoolBook, PoolState};
use crate::strategy::types::{Opportunity, SwapIntent};
use crate::stream::listener::{EventListener, ListenerSettings, VenueFeed};
use crate::trading::flashloan::CollateralPool;
use crate::trading::orchestrator::{
    ExecutionParams, ExitOrder, FlashloanOrchestrator, PreparedAttempt,
};
use crate::trading::tips::TipManager;
use crate::trading::venue::ExecutionVenue;

/// How often graduated and idle pools are swept from the pool book
const POOL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct SandwichEngine {
    config: ConfigHandle,
    venue: Arc<dyn ExecutionVenue>,
    feed: Arc<dyn VenueFeed>,
    tips: Arc<TipManager>,
    pools: Arc<PoolBook>,
    positions: Arc<PositionBook>,
    ledger: Arc<ProfitLedger>,
    lifecycle: Arc<Lifecycle>,
    status: StatusBus,
    refresh_tips: bool,
}

impl SandwichEngine {
    pub fn new(
        config: ConfigHandle,
        venue: Arc<dyn ExecutionVenue>,
        feed: Arc<dyn VenueFeed>,
    ) -> Self {
        let snapshot = config.snapshot();
        let tips = Arc::new(TipManager::new(snapshot.jito.clone()));
        let pools = PoolBook::new()
            .with_slotless_grace(Duration::from_millis(snapshot.feed.slotless_grace_ms));
        Self {
            config,
            venue,
            feed,
            tips,
            pools: Arc::new(pools),
            positions: Arc::new(PositionBook::new()),
            ledger: Arc::new(ProfitLedger::new()),
            lifecycle: Arc::new(Lifecycle::new()),
            status: StatusBus::new(),
            refresh_tips: true,
        }
    }

    /// Start from an existing pool book instead of an empty one
    pub fn with_pool_book(mut self, pools: Arc<PoolBook>) -> Self {
        self.pools = pools;
        self
    }

    /// Whether to poll the tip floor endpoint while running
    pub fn with_tip_refresh(mut self, enabled: bool) -> Self {
        self.refresh_tips = enabled;
        self
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    pub fn status(&self) -> &StatusBus {
        &self.status
    }

    pub fn positions(&self) -> Arc<PositionBook> {
        self.positions.clone()
    }

    pub fn ledger(&self) -> Arc<ProfitLedger> {
        self.ledger.clone()
    }

    /// Stop accepting new intents; `run` returns once in-flight units resolve
    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    /// Run until stopped. Returns the session statistics.
    pub async fn run(&self) -> Result<SessionStats> {
        let cancel = self.lifecycle.start()?;
        let snapshot = self.config.snapshot();

        let balance = match self.venue.operator_balance().await {
            Ok(balance) => balance,
            Err(e) => {
                self.lifecycle.mark_stopped();
                return Err(e);
            }
        };
        info!(
            venue = self.venue.name(),
            balance_sol = lamports_to_sol(balance),
            "Engine running"
        );
        self.status.publish(StatusUpdate::Started {
            operator_balance: balance,
        });

        let collateral = CollateralPool::new(balance);
        let workers = Arc::new(Workers {
            venue: self.venue.clone(),
            orchestrator: FlashloanOrchestrator::new(self.venue.clone(), collateral.clone()),
            guard: SettlementGuard::new(
                self.venue.clone(),
                self.positions.clone(),
                self.ledger.clone(),
                collateral,
                self.status.clone(),
            ),
            positions: self.positions.clone(),
            tips: self.tips.clone(),
            status: self.status.clone(),
        });

        let tip_task = self
            .refresh_tips
            .then(|| tokio::spawn(self.tips.clone().run(cancel.clone())));

        let (mut intents, listener) = EventListener::spawn(
            self.feed.clone(),
            self.pools.clone(),
            ListenerSettings::from_config(&snapshot),
            self.status.clone(),
            cancel,
        );

        let mut attempts = JoinSet::new();
        let mut sweep = tokio::time::interval(POOL_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                intent = intents.next() => match intent {
                    Some(intent) if self.lifecycle.is_accepting() => {
                        self.on_intent(intent, &workers, &mut attempts).await;
                    }
                    Some(intent) => debug!(intent = %intent.id, "Stopping; intent ignored"),
                    None => break,
                },
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => log_join(joined),
                _ = sweep.tick() => self.sweep_pools().await,
            }
        }

        let in_flight = attempts.len();
        info!(
            in_flight,
            dropped = intents.dropped(),
            "Intake stopped; waiting for in-flight units"
        );
        self.status.publish(StatusUpdate::Stopping { in_flight });
        while let Some(joined) = attempts.join_next().await {
            log_join(joined);
        }

        if let Err(e) = listener.await {
            warn!("Listener task failed: {}", e);
        }
        if let Some(task) = tip_task {
            let _ = task.await;
        }

        let stats = self.ledger.snapshot().await;
        info!(
            open_positions = self.positions.count().await,
            "Session summary: {}",
            self.ledger.summary().await
        );
        self.lifecycle.mark_stopped();
        self.status.publish(StatusUpdate::Stopped);
        Ok(stats)
    }

    /// Drop graduated and idle pools, keeping those behind a held position
    async fn sweep_pools(&self) {
        let config = self.config.snapshot();
        let held: HashSet<Pubkey> = self
            .positions
            .held()
            .await
            .into_iter()
            .map(|position| position.pool)
            .collect();
        let evicted = self.pools.evict(
            Duration::from_secs(config.feed.pool_idle_secs),
            config.venue.graduation_threshold_lamports(),
            &held,
        );
        if evicted > 0 {
            debug!(evicted, remaining = self.pools.len(), "Pool book swept");
        }
    }

    async fn on_intent(
        &self,
        intent: SwapIntent,
        workers: &Arc<Workers>,
        attempts: &mut JoinSet<()>,
    ) {
        let config = self.config.snapshot();
        let Some(pool) = self.pools.snapshot(&intent.pool) else {
            debug!(intent = %intent.id, "No pool snapshot");
            return;
        };

        if let Some(trigger) = ExitRules::from_config(&config).trigger(&pool, Some(&intent)) {
            for held in self.positions.open_on_pool(&pool.pool).await {
                match self.positions.begin_exit(held.id, trigger).await {
                    Ok(position) => {
                        self.publish_position(position.id, "pending_close");
                        let workers = workers.clone();
                        let (pool, config) = (pool.clone(), config.clone());
                        attempts.spawn(async move { workers.exit(position, pool, config).await });
                    }
                    Err(e) => debug!(position = %held.id, "Exit not started: {}", e),
                }
            }
        }

        if attempts.len() >= config.engine.max_concurrent_attempts {
            debug!(intent = %intent.id, "At attempt capacity; intent skipped");
            return;
        }

        let evaluator = OpportunityEvaluator::new(EvaluatorParams::from_config(&config));
        let Some(opportunity) = evaluator.evaluate(&intent, &pool) else {
            return;
        };

        info!(
            opportunity = %opportunity.id,
            intent = %intent.id,
            front_run_sol = lamports_to_sol(opportunity.front_run_lamports),
            net_profit = opportunity.net_profit as i64,
            "Opportunity found"
        );
        self.status.publish(StatusUpdate::OpportunityFound {
            opportunity_id: opportunity.id,
            intent_id: intent.id.clone(),
            front_run_lamports: opportunity.front_run_lamports,
            net_profit: opportunity.net_profit,
        });

        let workers = workers.clone();
        attempts.spawn(async move { workers.sandwich(opportunity, config).await });
    }

    fn publish_position(&self, id: Uuid, status: &str) {
        self.status.publish(StatusUpdate::PositionChanged {
            position_id: id,
            status: status.to_string(),
        });
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("Attempt task failed: {}", e);
    }
}

/// Everything an attempt task needs, shared across tasks
struct Workers {
    venue: Arc<dyn ExecutionVenue>,
    orchestrator: FlashloanOrchestrator,
    guard: SettlementGuard,
    positions: Arc<PositionBook>,
    tips: Arc<TipManager>,
    status: StatusBus,
}

impl Workers {
    async fn sandwich(&self, opportunity: Opportunity, config: Arc<Config>) {
        let params = ExecutionParams::from_config(&config);
        let prepared = match self.venue.current_slot().await {
            Ok(slot) => self.orchestrator.prepare(&opportunity, slot, &params).await,
            Err(e) => Err(e),
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                info!(opportunity = %opportunity.id, "Attempt rejected: {}", e);
                self.status.publish(StatusUpdate::AttemptRejected {
                    opportunity_id: opportunity.id,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let position_id = self
            .positions
            .open_pending(opportunity.mint, opportunity.pool)
            .await;
        self.execute(&prepared, position_id, Some(opportunity.id), &config)
            .await;
    }

    async fn exit(&self, position: Position, pool: PoolState, config: Arc<Config>) {
        let params = ExecutionParams::from_config(&config);
        match self.prepare_exit(&position, &pool, &config, &params).await {
            Ok(prepared) => self.execute(&prepared, position.id, None, &config).await,
            Err(e) => {
                warn!(position = %position.id, "Exit could not be prepared: {}", e);
                if let Err(e) = self.positions.revert_exit(position.id).await {
                    error!(position = %position.id, "Failed to reopen position: {}", e);
                }
            }
        }
    }

    async fn prepare_exit(
        &self,
        position: &Position,
        pool: &PoolState,
        config: &Config,
        params: &ExecutionParams,
    ) -> Result<PreparedAttempt> {
        let expected = pool
            .reserves
            .sell(position.acquisition_tokens, config.venue.venue_fee_bps)?
            .amount_out;
        let order = ExitOrder {
            position_id: position.id,
            pool: position.pool,
            mint: position.mint,
            tokens: position.acquisition_tokens,
            min_sol_out: calculate_min_with_slippage(expected, params.exit_slippage_bps),
            expected_proceeds: expected,
        };
        let slot = self.venue.current_slot().await?;
        self.orchestrator.prepare_exit(&order, slot, params)
    }

    /// Bribe loop then settlement. The reservation is held until both finish.
    async fn execute(
        &self,
        prepared: &PreparedAttempt,
        position_id: Uuid,
        opportunity_id: Option<Uuid>,
        config: &Config,
    ) {
        let unit = prepared.unit();
        let baseline = self.tips.recommended_tip(unit.tip_ceiling()).await;
        let report = BribeLoop::new(
            self.venue.clone(),
            self.status.clone(),
            AttemptSettings::from_config(config),
        )
        .run(unit, baseline, prepared.opened_slot())
        .await;

        if let Some(opportunity_id) = opportunity_id {
            self.status.publish(StatusUpdate::AttemptResolved {
                opportunity_id,
                outcome: report.observation.to_string(),
            });
        }

        let record = AttemptRecord {
            unit,
            position_id,
            submissions: &report.submissions,
            final_bid: report.final_bid,
        };
        match self
            .guard
            .settle(&record, report.observation.clone(), &SettlementParams::from_config(config))
            .await
        {
            Ok(settlement) => info!(unit = %unit.id(), position = %position_id, "Settled: {}", settlement),
            Err(e @ Error::SettlementDivergence { .. }) => {
                // Already resynced and alerted
                debug!(unit = %unit.id(), "Settlement diverged: {}", e);
            }
            Err(e) => {
                error!(unit = %unit.id(), position = %position_id, "Settlement failed: {}", e);
                self.status.publish(StatusUpdate::OperatorAlert {
                    detail: format!("position {} unresolved: {}", position_id, e),
                });
            }
        }
        self.venue.release(unit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lifecycle::EngineState;
    use crate::pump::instruction::SellInstruction;
    use crate::stream::decoder::{RawInstruction, RawRecord};
    use crate::stream::listener::tests::{pending_buy, seeded_book, ScriptedFeed};
    use crate::trading::venue::{DryRunScript, DryRunVenue, SlotClock};
    use solana_sdk::pubkey::Pubkey;
    use std::time::Duration;
    use tokio::sync::broadcast;

    const BALANCE: u64 = 10_000_000_000;
    const TARGET_TOKENS: u64 = 9_000_000_000;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.settlement.poll_interval_ms = 2;
        config.settlement.confirm_timeout_ms = 20;
        config.feed.reconnect_delay_ms = 5;
        config.feed.connect_timeout_ms = 200;
        config
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<StatusUpdate>,
        pred: impl Fn(&StatusUpdate) -> bool,
    ) -> StatusUpdate {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(update) if pred(&update) => return update,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("status bus closed: {}", e),
                }
            }
        })
        .await
        .expect("status update in time")
    }

    fn dev_sell(signature: &str, pool: &PoolState, creator: Pubkey, tokens: u64) -> RawRecord {
        let mut accounts = vec![Pubkey::new_unique(); 12];
        accounts[2] = pool.mint;
        accounts[3] = pool.pool;
        accounts[6] = creator;
        RawRecord::Instruction(RawInstruction {
            signature: signature.to_string(),
            slot: 40,
            data: SellInstruction {
                amount: tokens,
                min_sol_output: 0,
            }
            .to_bytes(),
            accounts,
            pending: true,
            transaction: None,
        })
    }

    fn engine(
        config: Config,
        venue: Arc<DryRunVenue>,
        sessions: Vec<Vec<RawRecord>>,
        pools: Arc<PoolBook>,
    ) -> Arc<SandwichEngine> {
        Arc::new(
            SandwichEngine::new(
                ConfigHandle::new(config),
                venue,
                Arc::new(ScriptedFeed::new(sessions)),
            )
            .with_pool_book(pools)
            .with_tip_refresh(false),
        )
    }

    fn spawn_run(
        engine: &Arc<SandwichEngine>,
    ) -> tokio::task::JoinHandle<Result<SessionStats>> {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    }

    #[tokio::test]
    async fn test_sandwich_lands_end_to_end() {
        let (pools, state) = seeded_book();
        let venue = Arc::new(DryRunVenue::new(BALANCE, SlotClock::ticking(10)));
        let engine = engine(
            test_config(),
            venue.clone(),
            vec![vec![pending_buy("target", &state, TARGET_TOKENS)]],
            pools,
        );
        let mut updates = engine.status().subscribe();
        let handle = spawn_run(&engine);

        wait_for(&mut updates, |u| matches!(u, StatusUpdate::ProfitRecorded { .. })).await;
        engine.stop();
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(stats.units_landed, 1);
        assert!(stats.net_pnl > 0);
        assert_eq!(
            venue.operator_balance().await.unwrap() as i128,
            BALANCE as i128 + stats.net_pnl
        );
        assert!(engine.positions().held().await.is_empty());
        assert_eq!(engine.lifecycle().state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_ceiling_reached_then_expired_leaves_no_position() {
        let (pools, state) = seeded_book();
        let config = test_config();
        let ceiling = config.engine.priority_fee_ceiling_lamports;
        let venue = Arc::new(
            DryRunVenue::new(BALANCE, SlotClock::ticking(10))
                .with_scripts(vec![DryRunScript::Outbid(ceiling - 1)]),
        );
        let engine = engine(
            config,
            venue.clone(),
            vec![vec![pending_buy("target", &state, TARGET_TOKENS)]],
            pools,
        );
        let mut updates = engine.status().subscribe();
        let handle = spawn_run(&engine);

        let mut bids = Vec::new();
        loop {
            match wait_for(&mut updates, |u| {
                matches!(
                    u,
                    StatusUpdate::BidPlaced { .. } | StatusUpdate::AttemptResolved { .. }
                )
            })
            .await
            {
                StatusUpdate::BidPlaced { bid, .. } => bids.push(bid),
                StatusUpdate::AttemptResolved { outcome, .. } => {
                    assert_eq!(outcome, "expired");
                    break;
                }
                _ => unreachable!(),
            }
        }
        engine.stop();
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(bids.last().copied(), Some(ceiling));
        assert!(bids.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(stats.units_expired, 1);
        assert_eq!(stats.units_landed, 0);
        assert!(engine.positions().held().await.is_empty());
        assert_eq!(venue.operator_balance().await.unwrap(), BALANCE);
    }

    #[tokio::test]
    async fn test_retained_position_exits_ahead_of_dev_sell() {
        let (pools, state) = seeded_book();
        let creator = Pubkey::new_unique();
        pools.set_creator(&state.pool, creator);

        let mut config = test_config();
        config.engine.retain_bps = 1000;
        // Give the sandwich time to settle before the dev sell shows up
        config.feed.reconnect_delay_ms = 300;

        let venue = Arc::new(DryRunVenue::new(BALANCE, SlotClock::ticking(10)));
        let engine = engine(
            config,
            venue.clone(),
            vec![
                vec![pending_buy("target", &state, TARGET_TOKENS)],
                vec![dev_sell("dev-sell", &state, creator, 1_000_000_000)],
            ],
            pools,
        );
        let mut updates = engine.status().subscribe();
        let handle = spawn_run(&engine);

        let opened = wait_for(&mut updates, |u| {
            matches!(u, StatusUpdate::PositionChanged { status, .. } if status == "open")
        })
        .await;
        let StatusUpdate::PositionChanged { position_id, .. } = opened else {
            unreachable!()
        };
        let held = engine.positions().get(&position_id).await.unwrap();
        assert!(held.acquisition_tokens > 0);
        assert_eq!(venue.tokens_held(&state.mint), held.acquisition_tokens);

        wait_for(&mut updates, |u| {
            matches!(u, StatusUpdate::PositionChanged { position_id: id, status } if *id == position_id && status == "closed")
        })
        .await;
        engine.stop();
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(stats.units_landed, 1);
        assert_eq!(stats.exits_closed, 1);
        assert_eq!(venue.tokens_held(&state.mint), 0);
        assert!(engine.positions().get(&position_id).await.is_none());
        assert_eq!(engine.positions().count().await, 0);
    }

    #[tokio::test]
    async fn test_start_fails_cleanly_when_running() {
        let (pools, _) = seeded_book();
        let venue = Arc::new(DryRunVenue::new(BALANCE, SlotClock::ticking(10)));
        let engine = engine(test_config(), venue, vec![], pools);
        let mut updates = engine.status().subscribe();
        let handle = spawn_run(&engine);

        wait_for(&mut updates, |u| matches!(u, StatusUpdate::Started { .. })).await;
        assert!(engine.run().await.is_err());

        engine.stop();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.units_landed, 0);
    }
}
