//! Stream module - venue feed ingestion
//!
//! - `listener` - Session management, dedup and the intent queue
//! - `decoder` - Raw records to intents and reserve updates
//! - `backpressure` - Bounded queue with a drop policy
//! - `pumpportal` - PumpPortal WebSocket feed

pub mod backpressure;
pub mod decoder;
pub mod listener;
pub mod pumpportal;

pub use backpressure::BackpressureChannel;
pub use decoder::{Decoded, PumpDecoder, RawInstruction, RawRecord};
pub use listener::{EventListener, IntentStream, ListenerSettings, TrailingIdCache, VenueFeed};
pub use pumpportal::PumpPortalFeed;
