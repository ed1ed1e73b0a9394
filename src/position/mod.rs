//! Position tracking and settlement
//!
//! - `book` - Position state machine and exit triggers
//! - `ledger` - Session profit ledger
//! - `settlement` - Applies attempt outcomes to positions and the ledger

pub mod book;
pub mod ledger;
pub mod settlement;

pub use book::{ExitRules, ExitTrigger, Position, PositionBook, PositionStatus};
pub use ledger::{ProfitLedger, SessionStats};
pub use settlement::{AttemptRecord, Observation, Settlement, SettlementGuard, SettlementParams};
