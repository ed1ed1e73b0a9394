//! Error types for the sandwich engine
//!
//! Evaluation-time rejections never show up here: the evaluator yields no
//! opportunity instead. A reverted bundle is an outcome, not an error.

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used for logging and operator alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Expected during normal operation; logged, no operator alert
    Recoverable,
    /// Rejected before submission and surfaced to the operator
    Configuration,
    /// Local state diverged from confirmed chain state
    Integrity,
}

/// Main error type for the sandwich engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid keypair: {0}")]
    InvalidKeypair(String),

    #[error("Priority fee ceiling {ceiling} is below the minimum viable bid {minimum}")]
    CeilingBelowMinimumBid { ceiling: u64, minimum: u64 },

    #[error("Insufficient collateral: {available} lamports available, {required} required")]
    InsufficientCollateral { available: u64, required: u64 },

    // RPC errors
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    // Feed errors
    #[error("Feed connection failed: {0}")]
    FeedConnection(String),

    // Pump.fun protocol errors
    #[error("Invalid pump.fun instruction: {0}")]
    InvalidInstruction(String),

    #[error("Bonding curve decode failed: {0}")]
    BondingCurveDecode(String),

    #[error("Price calculation overflow")]
    PriceOverflow,

    // Execution errors
    #[error("Flashloan unavailable: requested {requested} lamports, venue capacity {capacity}")]
    LoanUnavailable { requested: u64, capacity: u64 },

    #[error("Opportunity {id} expired at slot {expiry_slot} (current slot {current_slot})")]
    OpportunityExpired {
        id: String,
        expiry_slot: u64,
        current_slot: u64,
    },

    #[error("Atomic unit rejected at build time: {0}")]
    UnitConstruction(String),

    #[error("Transaction build failed: {0}")]
    TransactionBuild(String),

    #[error("Bundle submission failed: {0}")]
    BundleSubmission(String),

    #[error("Bundle rejected by block engine: {0}")]
    BundleRejected(String),

    // Position and settlement errors
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Invalid position transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Settlement diverged from chain for {id}: {detail}")]
    SettlementDivergence { id: String, detail: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_)
                | Error::RpcTimeout(_)
                | Error::FeedConnection(_)
                | Error::BundleSubmission(_)
        )
    }

    /// Classify the error for logging and alerting
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_)
            | Error::InvalidKeypair(_)
            | Error::CeilingBelowMinimumBid { .. }
            | Error::InsufficientCollateral { .. }
            | Error::UnitConstruction(_) => ErrorCategory::Configuration,
            Error::InvalidTransition { .. } | Error::SettlementDivergence { .. } => {
                ErrorCategory::Integrity
            }
            _ => ErrorCategory::Recoverable,
        }
    }

    /// Whether the operator should be told about this error
    pub fn requires_operator_attention(&self) -> bool {
        self.category() != ErrorCategory::Recoverable
    }
}

// Conversion from solana_client errors
impl From<solana_client::client_error::ClientError> for Error {
    fn from(e: solana_client::client_error::ClientError) -> Self {
        Error::Rpc(e.to_string())
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::FeedConnection("reset".into()).category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            Error::InsufficientCollateral {
                available: 1,
                required: 2
            }
            .category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            Error::SettlementDivergence {
                id: "p".into(),
                detail: "x".into()
            }
            .category(),
            ErrorCategory::Integrity
        );
        assert!(!Error::LoanUnavailable {
            requested: 10,
            capacity: 1
        }
        .requires_operator_attention());
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Rpc("timeout".into()).is_retryable());
        assert!(!Error::BundleRejected("bad".into()).is_retryable());
    }
}
