//! PumpPortal WebSocket feed
//!
//! PumpPortal streams confirmed pump.fun activity: token creations and
//! trades with the curve's virtual reserves after each one. Creations seed
//! the pool book and every new mint gets a trade subscription, so reserves
//! stay current and creator sells show up as exit signals.
//!
//! Endpoint: wss://pumpportal.fun/api/data

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::decoder::RawRecord;
use super::listener::VenueFeed;
use crate::config::FeedConfig;
use crate::error::{Error, Result};
use crate::pump::price::{sol_to_lamports, tokens_to_base_units, Reserves};
use crate::strategy::types::Direction;

/// Records buffered per session before the reader waits on the listener
const SESSION_BUFFER: usize = 1024;

/// Outgoing subscription request
#[derive(Debug, Clone, Serialize)]
struct Subscribe<'a> {
    method: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    keys: &'a [String],
}

impl Subscribe<'_> {
    fn message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

fn new_tokens() -> Subscribe<'static> {
    Subscribe {
        method: "subscribeNewToken",
        keys: &[],
    }
}

fn token_trades(mints: &[String]) -> Subscribe<'_> {
    Subscribe {
        method: "subscribeTokenTrade",
        keys: mints,
    }
}

/// One frame as PumpPortal sends it. Amounts are decimal SOL and whole
/// tokens; the trade fields are absent on creations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortalFrame {
    signature: String,
    mint: String,
    trader_public_key: String,
    tx_type: String,
    bonding_curve_key: String,
    v_tokens_in_bonding_curve: f64,
    v_sol_in_bonding_curve: f64,
    #[serde(default)]
    token_amount: f64,
    #[serde(default)]
    sol_amount: f64,
    #[serde(default)]
    symbol: String,
}

impl PortalFrame {
    fn reserves(&self) -> Reserves {
        Reserves {
            sol: sol_to_lamports(self.v_sol_in_bonding_curve),
            token: tokens_to_base_units(self.v_tokens_in_bonding_curve),
        }
    }
}

/// A confirmed trade and the reserves it left. Keys are unparsed.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub signature: String,
    pub mint: String,
    pub trader: String,
    pub pool: String,
    pub direction: Direction,
    /// Base units
    pub token_amount: u64,
    /// Lamports
    pub sol_amount: u64,
    pub reserves_after: Reserves,
}

/// A token creation
#[derive(Debug, Clone)]
pub struct NewTokenEvent {
    pub signature: String,
    pub mint: String,
    pub creator: String,
    pub pool: String,
    pub symbol: String,
    /// Reserves after the creator's initial buy
    pub reserves: Reserves,
}

/// Parse one text frame. Acks and unknown frames yield `None`.
pub fn parse_message(text: &str) -> Option<RawRecord> {
    let frame = match serde_json::from_str::<PortalFrame>(text) {
        Ok(frame) => frame,
        Err(_) => {
            debug!("Ignoring frame: {}", &text[..text.len().min(100)]);
            return None;
        }
    };
    let reserves = frame.reserves();

    let direction = match frame.tx_type.as_str() {
        "create" => {
            return Some(RawRecord::NewToken(NewTokenEvent {
                signature: frame.signature,
                mint: frame.mint,
                creator: frame.trader_public_key,
                pool: frame.bonding_curve_key,
                symbol: frame.symbol,
                reserves,
            }))
        }
        "buy" => Direction::Buy,
        "sell" => Direction::Sell,
        other => {
            debug!(tx_type = other, "Ignoring frame of unknown type");
            return None;
        }
    };

    Some(RawRecord::Trade(TradeEvent {
        signature: frame.signature,
        mint: frame.mint,
        trader: frame.trader_public_key,
        pool: frame.bonding_curve_key,
        direction,
        token_amount: tokens_to_base_units(frame.token_amount),
        sol_amount: sol_to_lamports(frame.sol_amount),
        reserves_after: reserves,
    }))
}

/// PumpPortal-backed venue feed
pub struct PumpPortalFeed {
    config: FeedConfig,
}

impl PumpPortalFeed {
    pub fn new(config: FeedConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl VenueFeed for PumpPortalFeed {
    async fn open_session(&self) -> Result<mpsc::Receiver<RawRecord>> {
        let url = url::Url::parse(&self.config.ws_url)
            .map_err(|e| Error::Config(format!("Invalid feed URL: {}", e)))?;
        info!("Connecting to PumpPortal at {}", url);

        let (mut socket, _) = connect_async(url)
            .await
            .map_err(|e| Error::FeedConnection(format!("connect: {}", e)))?;

        let mut subscriptions = vec![new_tokens().message()?];
        if !self.config.watch_mints.is_empty() {
            subscriptions.push(token_trades(&self.config.watch_mints).message()?);
        }
        for message in subscriptions {
            socket
                .send(message)
                .await
                .map_err(|e| Error::FeedConnection(format!("subscribe: {}", e)))?;
        }
        info!(
            watched = self.config.watch_mints.len(),
            "PumpPortal session open"
        );

        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let ping_every = Duration::from_secs(self.config.ping_interval_secs.max(1));

        tokio::spawn(async move {
            let (mut write, mut read) = socket.split();
            let mut ping = tokio::time::interval(ping_every);

            let reason = loop {
                tokio::select! {
                    _ = ping.tick() => {
                        if let Err(e) = write.send(Message::Ping(vec![])).await {
                            break format!("ping failed: {}", e);
                        }
                    }
                    frame = read.next() => {
                        let text = match frame {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) => break "closed by server".to_string(),
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => break e.to_string(),
                            None => break "stream ended".to_string(),
                        };
                        let Some(record) = parse_message(&text) else {
                            continue;
                        };

                        if let RawRecord::NewToken(token) = &record {
                            let mint = [token.mint.clone()];
                            let sent = match token_trades(&mint).message() {
                                Ok(message) => write.send(message).await.map_err(|e| e.to_string()),
                                Err(e) => Err(e.to_string()),
                            };
                            if let Err(e) = sent {
                                warn!(mint = %token.mint, "Trade subscription failed: {}", e);
                            }
                        }

                        if tx.send(record).await.is_err() {
                            break "listener dropped the session".to_string();
                        }
                    }
                }
            };
            info!(%reason, "PumpPortal session ended");
        });

        Ok(rx)
    }

    fn name(&self) -> &str {
        "pumpportal"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_messages() {
        let json = serde_json::to_string(&new_tokens()).unwrap();
        assert_eq!(json, r#"{"method":"subscribeNewToken"}"#);

        let mints = vec!["DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK".to_string()];
        let json = serde_json::to_string(&token_trades(&mints)).unwrap();
        assert!(json.contains("subscribeTokenTrade"));
        assert!(json.contains("DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK"));
    }

    #[test]
    fn test_parse_creation_converts_units() {
        let json = r#"{
            "signature": "create_sig",
            "mint": "mint",
            "traderPublicKey": "creator",
            "txType": "create",
            "initialBuy": 35000000.5,
            "bondingCurveKey": "curve",
            "vTokensInBondingCurve": 1038000000.0,
            "vSolInBondingCurve": 31.0,
            "marketCapSol": 29.8,
            "name": "Test Token",
            "symbol": "TEST",
            "uri": "https://example.com"
        }"#;

        match parse_message(json) {
            Some(RawRecord::NewToken(event)) => {
                assert_eq!(event.creator, "creator");
                assert_eq!(event.symbol, "TEST");
                assert_eq!(event.reserves.sol, 31_000_000_000);
                assert_eq!(event.reserves.token, 1_038_000_000_000_000);
            }
            other => panic!("Expected creation, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_trade() {
        let json = r#"{
            "signature": "trade_sig",
            "mint": "mint",
            "traderPublicKey": "trader",
            "txType": "sell",
            "tokenAmount": 5000.25,
            "solAmount": 0.5,
            "bondingCurveKey": "curve",
            "vTokensInBondingCurve": 1000.0,
            "vSolInBondingCurve": 40.0,
            "marketCapSol": 31.5
        }"#;

        match parse_message(json) {
            Some(RawRecord::Trade(trade)) => {
                assert_eq!(trade.direction, Direction::Sell);
                assert_eq!(trade.token_amount, 5_000_250_000);
                assert_eq!(trade.sol_amount, 500_000_000);
                assert_eq!(trade.reserves_after.sol, 40_000_000_000);
            }
            other => panic!("Expected trade, got {:?}", other),
        }
    }

    #[test]
    fn test_acks_ignored() {
        assert!(parse_message(r#"{"message":"Successfully subscribed"}"#).is_none());
        assert!(parse_message("not json").is_none());
    }
}
