//! Pump.fun Sandwich Engine Library
//!
//! Flashloan-funded front-run/back-run pairs around pending pump.fun buys,
//! executed as all-or-nothing Jito bundles.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod position;
pub mod pump;
pub mod strategy;
pub mod stream;
pub mod trading;
pub mod wallet;

// Re-export commonly used types
pub use config::Config;
pub use engine::SandwichEngine;
pub use error::{Error, Result};
