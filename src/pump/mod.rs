//! Pump.fun protocol module
//!
//! # WARNING: Protocol Instability
//! Pump.fun has historically changed program behavior without notice.
//! The constants and structures in this module may break silently.

pub mod accounts;
pub mod instruction;
pub mod price;
pub mod program;

// Re-export commonly used types
pub use accounts::BondingCurve;
pub use instruction::{BuyInstruction, CreateInstruction, PumpInstruction, SellInstruction};
pub use price::{Reserves, SwapOutcome};
pub use program::{ProgramOp, PUMP_PROGRAM_ID};
