//! Opportunity evaluation
//!
//! - `types` - Intents, opportunities and their cost breakdown
//! - `pool_book` - Per-pool reserve snapshots fed by the listener
//! - `evaluator` - Sandwich simulation and front-run sizing

pub mod evaluator;
pub mod pool_book;
pub mod types;

pub use evaluator::{EvaluatorParams, OpportunityEvaluator, Rejection};
pub use pool_book::{PoolBook, PoolState};
pub use types::*;
