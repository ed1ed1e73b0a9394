//! Jito tip management
//!
//! Keeps a recent snapshot of landed-tip percentiles from the block engine's
//! tip floor endpoint. The bribe controller uses it as its opening bid.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::JitoConfig;
use crate::error::{Error, Result};
use crate::pump::price::sol_to_lamports;

/// How often the tip floor is refreshed while the engine runs
const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Tip percentiles from Jito tip floor API
#[derive(Debug, Clone, Default)]
pub struct TipPercentiles {
    pub p25: u64,
    pub p50: u64,
    pub p75: u64,
    pub p95: u64,
    pub p99: u64,
    pub ema: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// One row of the tip floor response; values are in SOL
#[derive(Debug, Deserialize)]
struct TipFloorRow {
    landed_tips_25th_percentile: f64,
    landed_tips_50th_percentile: f64,
    landed_tips_75th_percentile: f64,
    landed_tips_95th_percentile: f64,
    landed_tips_99th_percentile: f64,
    ema_landed_tips_50th_percentile: f64,
}

impl From<TipFloorRow> for TipPercentiles {
    fn from(row: TipFloorRow) -> Self {
        Self {
            p25: sol_to_lamports(row.landed_tips_25th_percentile),
            p50: sol_to_lamports(row.landed_tips_50th_percentile),
            p75: sol_to_lamports(row.landed_tips_75th_percentile),
            p95: sol_to_lamports(row.landed_tips_95th_percentile),
            p99: sol_to_lamports(row.landed_tips_99th_percentile),
            ema: sol_to_lamports(row.ema_landed_tips_50th_percentile),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Parse the tip floor body (a JSON array with one row)
fn parse_tip_floor(body: &str) -> Result<TipPercentiles> {
    let rows: Vec<TipFloorRow> = serde_json::from_str(body)?;
    rows.into_iter()
        .next()
        .map(TipPercentiles::from)
        .ok_or_else(|| Error::Deserialization("Empty tip floor response".to_string()))
}

/// Tip manager for dynamic tip calculation
pub struct TipManager {
    config: JitoConfig,
    http: reqwest::Client,
    current_tips: Arc<RwLock<TipPercentiles>>,
}

impl TipManager {
    pub fn new(config: JitoConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            current_tips: Arc::new(RwLock::new(TipPercentiles::default())),
        }
    }

    /// Refresh the tip floor periodically until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Starting tip manager against {}", self.config.tip_floor_url);
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.fetch_tips().await {
                        Ok(tips) => self.update_percentiles(tips).await,
                        Err(e) => warn!("Tip floor refresh failed: {}", e),
                    }
                }
            }
        }
    }

    /// Opening bid: the configured percentile, clamped to `[min_tip, ceiling]`
    pub async fn recommended_tip(&self, ceiling: u64) -> u64 {
        let tips = self.current_tips.read().await;

        let base_tip = match self.config.tip_percentile {
            p if p <= 25 => tips.p25,
            p if p <= 50 => tips.p50,
            p if p <= 75 => tips.p75,
            p if p <= 95 => tips.p95,
            _ => tips.p99,
        };

        // If no data yet, use minimum
        let tip = if base_tip == 0 {
            self.config.min_tip_lamports
        } else {
            base_tip
        };

        tip.clamp(self.config.min_tip_lamports, ceiling.max(self.config.min_tip_lamports))
    }

    /// Update tip percentiles (called when new data received)
    pub async fn update_percentiles(&self, percentiles: TipPercentiles) {
        let mut tips = self.current_tips.write().await;
        *tips = percentiles;
        debug!("Updated tip percentiles: p50={}", tips.p50);
    }

    /// Fetch current tips from REST API
    pub async fn fetch_tips(&self) -> Result<TipPercentiles> {
        let body = self
            .http
            .get(&self.config.tip_floor_url)
            .send()
            .await
            .map_err(|e| Error::Rpc(format!("Tip floor request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::Rpc(format!("Tip floor status: {}", e)))?
            .text()
            .await
            .map_err(|e| Error::Rpc(format!("Tip floor body: {}", e)))?;

        parse_tip_floor(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> JitoConfig {
        JitoConfig {
            tip_percentile: 50,
            min_tip_lamports: 1000,
            ..Config::default().jito
        }
    }

    #[tokio::test]
    async fn test_tip_manager() {
        let manager = TipManager::new(test_config());

        // Should return minimum when no data
        let tip = manager.recommended_tip(100_000).await;
        assert_eq!(tip, 1000);

        manager
            .update_percentiles(TipPercentiles {
                p25: 2000,
                p50: 5000,
                p75: 10000,
                p95: 50000,
                p99: 100000,
                ema: 7500,
                timestamp: chrono::Utc::now(),
            })
            .await;

        assert_eq!(manager.recommended_tip(100_000).await, 5000);
        // Ceiling wins over the percentile
        assert_eq!(manager.recommended_tip(3000).await, 3000);
    }

    #[test]
    fn test_parse_tip_floor() {
        let body = r#"[{"time":"2024-09-01T12:58:00Z",
            "landed_tips_25th_percentile":0.000006,
            "landed_tips_50th_percentile":0.00001,
            "landed_tips_75th_percentile":0.000036,
            "landed_tips_95th_percentile":0.0014,
            "landed_tips_99th_percentile":0.01,
            "ema_landed_tips_50th_percentile":0.000019}]"#;
        let tips = parse_tip_floor(body).unwrap();
        assert_eq!(tips.p50, 10_000);
        assert_eq!(tips.p99, 10_000_000);
        assert_eq!(tips.ema, 19_000);
    }

    #[test]
    fn test_parse_empty_tip_floor() {
        assert!(parse_tip_floor("[]").is_err());
    }
}
