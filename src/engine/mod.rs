//! Engine wiring and control surface
//!
//! - `runner` - Intake loop and per-attempt tasks
//! - `attempt` - Bribe loop for one unit
//! - `lifecycle` - Start/stop control
//! - `status` - Read-only status stream

pub mod attempt;
pub mod lifecycle;
pub mod runner;
pub mod status;

pub use attempt::{AttemptReport, AttemptSettings, BribeLoop};
pub use lifecycle::{EngineState, Lifecycle};
pub use runner::SandwichEngine;
pub use status::{StatusBus, StatusUpdate};
