//! Wallet module - operator credentials

pub mod credentials;

pub use credentials::load_keypair;
