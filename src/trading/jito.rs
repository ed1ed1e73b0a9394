//! Jito block engine venue
//!
//! Encodes atomic units into signed transactions, submits them as bundles
//! over the block engine's JSON-RPC API with retry, and reads outcomes back
//! from Solana RPC.

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::program_pack::Pack;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use solana_sdk::transaction::Transaction;
use solana_transaction_status::option_serializer::OptionSerializer;
use solana_transaction_status::{UiTransactionEncoding, UiTransactionTokenBalance};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::orchestrator::AtomicUnit;
use super::transaction::{derive_ata, UnitEncoder};
use super::venue::{ExecutionVenue, LandedUnit, UnitOutcome, UnitStatus};
use crate::config::{Config, JitoConfig};
use crate::error::{Error, Result};

/// Block engine limit
const MAX_BUNDLE_TRANSACTIONS: usize = 5;

/// Tip accounts published by the block engine; the tip goes in the last
/// transaction of the bundle and never through a lookup table
const TIP_ACCOUNTS: [&str; 8] = [
    "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5",
    "HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe",
    "Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY",
    "ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49",
    "DfXygSm4jCyNCybVYYK6DwvWqjKee8pbDmJGcLWNDXjh",
    "ADuUkR4vqLUMWXxW9gh6D6L8pMSawimctcNZ5pGwDcEt",
    "DttWaMuVvTiduZRnguLF7jNxTgiMBZ1hyAumKUiL2KRL",
    "3AVi9Tg9Uo68tJfuvoKvqKNWKkC5wPdSSdeBnizKZ6jT",
];

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ContextValue<T> {
    value: Vec<Option<T>>,
}

/// Row of `getBundleStatuses`
#[derive(Debug, Deserialize)]
struct BundleStatusRow {
    slot: u64,
    confirmation_status: Option<String>,
    /// `{"Ok": null}` on success
    #[serde(default)]
    err: serde_json::Value,
}

impl BundleStatusRow {
    fn succeeded(&self) -> bool {
        self.err.get("Ok").is_some() || self.err.is_null()
    }
}

/// Row of `getInflightBundleStatuses`
#[derive(Debug, Deserialize)]
struct InflightRow {
    status: String,
    landed_slot: Option<u64>,
}

/// Jito bundle status for bundles still in the auction
#[derive(Debug, Clone, PartialEq)]
enum InflightStatus {
    Pending,
    Landed(Option<u64>),
    Failed,
    Invalid,
    Unknown,
}

impl From<InflightRow> for InflightStatus {
    fn from(row: InflightRow) -> Self {
        match row.status.as_str() {
            "Pending" => InflightStatus::Pending,
            "Landed" => InflightStatus::Landed(row.landed_slot),
            "Failed" => InflightStatus::Failed,
            "Invalid" => InflightStatus::Invalid,
            _ => InflightStatus::Unknown,
        }
    }
}

/// What we remember about one submission
#[derive(Debug, Clone)]
struct SubmittedBundle {
    unit_id: Uuid,
    mint: Pubkey,
    bid: u64,
    /// Our own legs only; the target belongs to someone else
    signatures: Vec<Signature>,
}

/// Serialize the legs, slotting the target between them when known
fn encode_bundle(transactions: &[Transaction], target: Option<&[u8]>) -> Result<Vec<String>> {
    let mut encoded = transactions
        .iter()
        .map(|tx| {
            bincode::serialize(tx)
                .map(|bytes| STANDARD.encode(bytes))
                .map_err(|e| Error::Serialization(e.to_string()))
        })
        .collect::<Result<Vec<_>>>()?;

    if let (Some(target), 2) = (target, encoded.len()) {
        encoded.insert(1, STANDARD.encode(target));
    }

    if encoded.is_empty() || encoded.len() > MAX_BUNDLE_TRANSACTIONS {
        return Err(Error::BundleSubmission(format!(
            "Bundle must hold 1..={} transactions, got {}",
            MAX_BUNDLE_TRANSACTIONS,
            encoded.len()
        )));
    }
    Ok(encoded)
}

/// Operator token change across one transaction's balances
fn token_change(
    pre: &OptionSerializer<Vec<UiTransactionTokenBalance>>,
    post: &OptionSerializer<Vec<UiTransactionTokenBalance>>,
    owner: &str,
    mint: &str,
) -> i128 {
    let sum = |balances: &OptionSerializer<Vec<UiTransactionTokenBalance>>| -> i128 {
        let Some(balances) = Option::<&Vec<UiTransactionTokenBalance>>::from(balances.as_ref())
        else {
            return 0;
        };
        balances
            .iter()
            .filter(|b| b.mint == mint)
            .filter(|b| Option::<&String>::from(b.owner.as_ref()).map(String::as_str) == Some(owner))
            .filter_map(|b| b.ui_token_amount.amount.parse::<i128>().ok())
            .sum()
    };
    sum(post) - sum(pre)
}

/// Live venue: Jito block engine plus Solana RPC
pub struct JitoVenue {
    config: JitoConfig,
    http: reqwest::Client,
    rpc: RpcClient,
    keypair: Keypair,
    encoder: UnitEncoder,
    lending_reserve: Pubkey,
    tip_accounts: Vec<Pubkey>,
    bundles: DashMap<String, SubmittedBundle>,
}

impl JitoVenue {
    pub fn new(config: &Config, keypair: Keypair) -> Result<Self> {
        let tip_accounts = TIP_ACCOUNTS
            .iter()
            .map(|s| Pubkey::from_str(s))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(format!("Invalid tip account: {}", e)))?;

        let lending_reserve = Pubkey::from_str(&config.venue.lending_reserve)
            .map_err(|e| Error::Config(format!("Invalid lending reserve: {}", e)))?;

        let timeout = Duration::from_millis(config.rpc.timeout_ms);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;

        let rpc = RpcClient::new_with_timeout_and_commitment(
            config.rpc.endpoint.clone(),
            timeout,
            CommitmentConfig::confirmed(),
        );

        info!("Jito venue initialized for {}", config.jito.block_engine_url);

        Ok(Self {
            config: config.jito.clone(),
            http,
            rpc,
            keypair,
            encoder: UnitEncoder::new(&config.venue)?,
            lending_reserve,
            tip_accounts,
            bundles: DashMap::new(),
        })
    }

    /// Get a random tip account
    fn tip_account(&self) -> Pubkey {
        use rand::Rng;
        let idx = rand::thread_rng().gen_range(0..self.tip_accounts.len());
        self.tip_accounts[idx]
    }

    /// One JSON-RPC call against the block engine
    async fn block_engine_call<T: DeserializeOwned>(
        &self,
        path: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}{}", self.config.block_engine_url.trim_end_matches('/'), path);
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::BundleSubmission(format!("{} request failed: {}", method, e)))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Error::BundleSubmission(format!("{} returned {}", method, status)));
        }

        let envelope: RpcEnvelope<T> = response
            .json()
            .await
            .map_err(|e| Error::Deserialization(format!("{} response: {}", method, e)))?;

        if let Some(err) = envelope.error {
            return Err(Error::BundleRejected(format!("{} ({})", err.message, err.code)));
        }
        envelope
            .result
            .ok_or_else(|| Error::Deserialization(format!("{} returned no result", method)))
    }

    /// Submit a bundle with retry logic
    async fn send_bundle(&self, encoded: &[String]) -> Result<String> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.retry_base_delay_ms),
            max_interval: Duration::from_millis(self.config.retry_base_delay_ms * 4),
            max_elapsed_time: Some(Duration::from_millis(
                self.config.retry_base_delay_ms * self.config.retry_attempts.max(1) as u64 * 4,
            )),
            ..Default::default()
        };

        retry(backoff, || async {
            match self
                .block_engine_call::<String>(
                    "/api/v1/bundles",
                    "sendBundle",
                    json!([encoded, { "encoding": "base64" }]),
                )
                .await
            {
                Ok(bundle_id) => Ok(bundle_id),
                Err(e) if e.is_retryable() => {
                    warn!("Retryable Jito error: {}", e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => {
                    error!("Permanent Jito error: {}", e);
                    Err(backoff::Error::permanent(e))
                }
            }
        })
        .await
    }

    async fn landed_status(&self, bundle_id: &str) -> Result<Option<BundleStatusRow>> {
        let statuses: ContextValue<BundleStatusRow> = self
            .block_engine_call("/api/v1/bundles", "getBundleStatuses", json!([[bundle_id]]))
            .await?;
        Ok(statuses.value.into_iter().flatten().next())
    }

    async fn inflight_status(&self, bundle_id: &str) -> Result<InflightStatus> {
        let statuses: ContextValue<InflightRow> = self
            .block_engine_call(
                "/api/v1/getInflightBundleStatuses",
                "getInflightBundleStatuses",
                json!([[bundle_id]]),
            )
            .await?;
        Ok(statuses
            .value
            .into_iter()
            .flatten()
            .next()
            .map(InflightStatus::from)
            .unwrap_or(InflightStatus::Unknown))
    }

    /// Read a submission's effects from confirmed chain state
    async fn read_chain(&self, bundle: &SubmittedBundle) -> Result<Option<UnitOutcome>> {
        let statuses = self.rpc.get_signature_statuses(&bundle.signatures).await?.value;
        if statuses.iter().all(Option::is_none) {
            return Ok(None);
        }

        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        let owner = self.keypair.pubkey().to_string();
        let mint = bundle.mint.to_string();

        let mut landed = LandedUnit {
            slot: 0,
            sol_delta: 0,
            token_delta: 0,
            fee_paid: 0,
        };
        let mut reverted = false;

        for (signature, status) in bundle.signatures.iter().zip(&statuses) {
            if status.is_none() {
                continue;
            }
            let tx = self.rpc.get_transaction_with_config(signature, config).await?;
            let Some(meta) = tx.transaction.meta else {
                return Ok(None);
            };
            landed.slot = landed.slot.max(tx.slot);
            landed.fee_paid += meta.fee;
            if meta.err.is_some() {
                reverted = true;
                continue;
            }
            // The operator pays fees, so it is account 0
            if let (Some(pre), Some(post)) = (meta.pre_balances.first(), meta.post_balances.first()) {
                landed.sol_delta += *post as i128 - *pre as i128;
            }
            landed.token_delta += token_change(
                &meta.pre_token_balances,
                &meta.post_token_balances,
                &owner,
                &mint,
            );
        }

        if reverted {
            return Ok(Some(UnitOutcome::Reverted {
                fee_paid: landed.fee_paid,
            }));
        }
        // Only part of the bundle visible yet
        if statuses.iter().any(Option::is_none) {
            return Ok(None);
        }
        landed.fee_paid += bundle.bid;
        Ok(Some(UnitOutcome::Committed(landed)))
    }
}

#[async_trait]
impl ExecutionVenue for JitoVenue {
    fn name(&self) -> &str {
        "jito"
    }

    fn operator(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    async fn current_slot(&self) -> Result<u64> {
        Ok(self.rpc.get_slot().await?)
    }

    async fn operator_balance(&self) -> Result<u64> {
        Ok(self.rpc.get_balance(&self.keypair.pubkey()).await?)
    }

    async fn loan_capacity(&self) -> Result<u64> {
        Ok(self.rpc.get_balance(&self.lending_reserve).await?)
    }

    async fn submit(&self, unit: &AtomicUnit, bid: u64) -> Result<String> {
        let blockhash = self.rpc.get_latest_blockhash().await?;
        let legs = self.encoder.encode(unit, bid, &self.tip_account())?;
        let transactions = legs.into_transactions(&self.keypair, blockhash);
        let signatures: Vec<Signature> = transactions
            .iter()
            .filter_map(|tx| tx.signatures.first().copied())
            .collect();

        let encoded = encode_bundle(&transactions, unit.target_transaction())?;
        info!(unit = %unit.id(), bid, txs = encoded.len(), "Submitting bundle");

        let bundle_id = self.send_bundle(&encoded).await?;
        self.bundles.insert(
            bundle_id.clone(),
            SubmittedBundle {
                unit_id: unit.id(),
                mint: *unit.mint(),
                bid,
                signatures,
            },
        );
        Ok(bundle_id)
    }

    async fn unit_status(&self, submission_id: &str) -> Result<UnitStatus> {
        let Some(bundle) = self.bundles.get(submission_id).map(|b| b.value().clone()) else {
            return Ok(UnitStatus::Unknown);
        };

        if let Some(row) = self.landed_status(submission_id).await? {
            debug!(bundle = submission_id, slot = row.slot, status = ?row.confirmation_status, "Bundle status");
            if !row.succeeded() {
                return Ok(UnitStatus::Reverted {
                    fee_paid: 0,
                    reason: row.err.to_string(),
                });
            }
            return Ok(match self.read_chain(&bundle).await? {
                Some(UnitOutcome::Committed(landed)) => UnitStatus::Landed(landed),
                Some(UnitOutcome::Reverted { fee_paid }) => UnitStatus::Reverted {
                    fee_paid,
                    reason: "transaction error".to_string(),
                },
                _ => UnitStatus::Unknown,
            });
        }

        Ok(match self.inflight_status(submission_id).await? {
            InflightStatus::Pending => UnitStatus::Pending,
            InflightStatus::Failed | InflightStatus::Invalid => UnitStatus::Dropped,
            // Landed but not yet visible through getBundleStatuses
            InflightStatus::Landed(_) | InflightStatus::Unknown => UnitStatus::Unknown,
        })
    }

    fn release(&self, unit: &AtomicUnit) {
        let id = unit.id();
        self.bundles.retain(|_, bundle| bundle.unit_id != id);
    }

    async fn authoritative_outcome(
        &self,
        unit: &AtomicUnit,
        submissions: &[String],
    ) -> Result<UnitOutcome> {
        for submission in submissions {
            let Some(bundle) = self.bundles.get(submission).map(|b| b.value().clone()) else {
                continue;
            };
            if bundle.unit_id != unit.id() {
                continue;
            }
            if let Some(outcome) = self.read_chain(&bundle).await? {
                return Ok(outcome);
            }
        }
        Ok(UnitOutcome::NotLanded)
    }

    async fn token_balance(&self, mint: &Pubkey) -> Result<u64> {
        let ata = derive_ata(&self.keypair.pubkey(), mint);
        let account = self
            .rpc
            .get_account_with_commitment(&ata, CommitmentConfig::confirmed())
            .await?
            .value;
        match account {
            None => Ok(0),
            Some(account) => spl_token::state::Account::unpack(&account.data)
                .map(|token| token.amount)
                .map_err(|e| Error::Deserialization(format!("Token account {}: {}", ata, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::hash::Hash;
    use solana_sdk::system_instruction;

    fn transfer(payer: &Keypair) -> Transaction {
        Transaction::new_signed_with_payer(
            &[system_instruction::transfer(&payer.pubkey(), &Pubkey::new_unique(), 1)],
            Some(&payer.pubkey()),
            &[payer],
            Hash::default(),
        )
    }

    #[test]
    fn test_jito_venue_creation() {
        let venue = JitoVenue::new(&Config::default(), Keypair::new()).unwrap();
        assert_eq!(venue.tip_accounts.len(), 8);
        assert!(venue.tip_accounts.contains(&venue.tip_account()));
    }

    #[tokio::test]
    async fn test_release_drops_bundle_records() {
        use crate::trading::orchestrator::tests::{execution_params, opportunity};

        let venue = JitoVenue::new(&Config::default(), Keypair::new()).unwrap();
        let unit = AtomicUnit::sandwich(&opportunity(), venue.operator(), 0, &execution_params())
            .unwrap();
        let other = Uuid::new_v4();
        for (bundle_id, unit_id) in [("a", unit.id()), ("b", unit.id()), ("c", other)] {
            venue.bundles.insert(
                bundle_id.to_string(),
                SubmittedBundle {
                    unit_id,
                    mint: *unit.mint(),
                    bid: 10_000,
                    signatures: vec![],
                },
            );
        }

        venue.release(&unit);

        assert_eq!(venue.bundles.len(), 1);
        assert!(venue.bundles.contains_key("c"));
        assert_eq!(venue.unit_status("a").await.unwrap(), UnitStatus::Unknown);
    }

    #[test]
    fn test_target_goes_between_legs() {
        let payer = Keypair::new();
        let legs = vec![transfer(&payer), transfer(&payer)];
        let encoded = encode_bundle(&legs, Some(b"target")).unwrap();
        assert_eq!(encoded.len(), 3);
        assert_eq!(encoded[1], STANDARD.encode(b"target"));
    }

    #[test]
    fn test_single_leg_ignores_target() {
        let payer = Keypair::new();
        let encoded = encode_bundle(&[transfer(&payer)], Some(b"target")).unwrap();
        assert_eq!(encoded.len(), 1);
        assert!(encode_bundle(&[], None).is_err());
    }

    #[test]
    fn test_parse_bundle_statuses() {
        let body = r#"{"jsonrpc":"2.0","result":{"context":{"slot":242806119},
            "value":[{"bundle_id":"abc","transactions":["x"],"slot":242804011,
            "confirmation_status":"confirmed","err":{"Ok":null}}]},"id":1}"#;
        let envelope: RpcEnvelope<ContextValue<BundleStatusRow>> =
            serde_json::from_str(body).unwrap();
        let row = envelope.result.unwrap().value.into_iter().flatten().next().unwrap();
        assert_eq!(row.slot, 242804011);
        assert!(row.succeeded());
    }

    #[test]
    fn test_parse_inflight_status() {
        let body = r#"{"jsonrpc":"2.0","result":{"context":{"slot":280999028},
            "value":[{"bundle_id":"abc","status":"Failed","landed_slot":null}]},"id":1}"#;
        let envelope: RpcEnvelope<ContextValue<InflightRow>> = serde_json::from_str(body).unwrap();
        let row = envelope.result.unwrap().value.into_iter().flatten().next().unwrap();
        assert_eq!(InflightStatus::from(row), InflightStatus::Failed);
    }

    #[test]
    fn test_parse_rpc_error() {
        let body = r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"bundle contains an expired blockhash"},"id":1}"#;
        let envelope: RpcEnvelope<String> = serde_json::from_str(body).unwrap();
        assert!(envelope.result.is_none());
        assert_eq!(envelope.error.unwrap().code, -32602);
    }
}
