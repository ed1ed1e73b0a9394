//! Session profit ledger
//!
//! Realized results of settled units. Nothing is persisted; a restart
//! starts a fresh session from the venue's balance.

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::pump::price::lamports_to_sol;

/// Session statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub units_landed: u32,
    pub units_reverted: u32,
    pub units_expired: u32,
    pub exits_closed: u32,
    pub winning_units: u32,
    pub losing_units: u32,
    /// Lamports
    pub total_profit: i128,
    pub total_loss: i128,
    pub net_pnl: i128,
    /// Network fees burned by reverted units
    pub fees_lost: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started_at: chrono::Utc::now(),
            ..Default::default()
        }
    }

    fn record_pnl(&mut self, pnl: i128) {
        if pnl >= 0 {
            self.winning_units += 1;
            self.total_profit += pnl;
        } else {
            self.losing_units += 1;
            self.total_loss += pnl.abs();
        }
        self.net_pnl = self.total_profit - self.total_loss;
    }

    pub fn win_rate(&self) -> f64 {
        let total = self.winning_units + self.losing_units;
        if total == 0 {
            return 0.0;
        }
        (self.winning_units as f64 / total as f64) * 100.0
    }
}

/// Ledger of realized profit for this session
pub struct ProfitLedger {
    stats: RwLock<SessionStats>,
}

impl ProfitLedger {
    pub fn new() -> Self {
        Self {
            stats: RwLock::new(SessionStats::new()),
        }
    }

    /// A sandwich landed with this balance change. Returns the session net.
    pub async fn record_landed(&self, realized: i128) -> i128 {
        let mut stats = self.stats.write().await;
        stats.units_landed += 1;
        stats.record_pnl(realized);
        info!(
            realized,
            session_net_sol = stats.net_pnl as f64 / 1e9,
            "Profit recorded"
        );
        stats.net_pnl
    }

    /// An exit sold at `pnl` against its cost basis
    pub async fn record_exit(&self, pnl: i128) -> i128 {
        let mut stats = self.stats.write().await;
        stats.exits_closed += 1;
        stats.record_pnl(pnl);
        stats.net_pnl
    }

    pub async fn record_revert(&self, fee_paid: u64) -> i128 {
        let mut stats = self.stats.write().await;
        stats.units_reverted += 1;
        stats.fees_lost += fee_paid;
        stats.total_loss += fee_paid as i128;
        stats.net_pnl = stats.total_profit - stats.total_loss;
        stats.net_pnl
    }

    pub async fn record_expired(&self) {
        self.stats.write().await.units_expired += 1;
    }

    pub async fn snapshot(&self) -> SessionStats {
        self.stats.read().await.clone()
    }

    pub async fn summary(&self) -> String {
        let stats = self.stats.read().await;
        format!(
            "landed={} reverted={} expired={} exits={} win_rate={:.1}% net={:.6} SOL fees_lost={:.6} SOL",
            stats.units_landed,
            stats.units_reverted,
            stats.units_expired,
            stats.exits_closed,
            stats.win_rate(),
            stats.net_pnl as f64 / 1e9,
            lamports_to_sol(stats.fees_lost),
        )
    }
}

impl Default for ProfitLedger {
    fn default() -> Self {
        Self::new()
    }
}
