//! Trading module - unit construction, bidding and venues
//!
//! - `orchestrator` - Atomic units and collateralized preparation
//! - `flashloan` - Loan terms and the collateral pool
//! - `bribe` - Bid escalation within a slot window
//! - `tips` - Tip floor tracking
//! - `transaction` - Unit encoding into signed legs
//! - `venue` - Execution venue trait and the dry-run venue
//! - `jito` - Live venue over the Jito block engine

pub mod bribe;
pub mod flashloan;
pub mod jito;
pub mod orchestrator;
pub mod tips;
pub mod transaction;
pub mod venue;

pub use bribe::{BribeAction, BribeController, BribePhase, BribeState};
pub use flashloan::{CollateralPool, CollateralReservation, LoanRequest};
pub use jito::JitoVenue;
pub use orchestrator::{
    AtomicUnit, ExecutionParams, ExitOrder, FlashloanOrchestrator, PreparedAttempt, UnitKind,
    UnitStep,
};
pub use tips::TipManager;
pub use venue::{
    DryRunScript, DryRunVenue, ExecutionVenue, LandedUnit, SlotClock, UnitOutcome, UnitStatus,
};
