//! tabsync Bus - at-most-once fact delivery across contexts
//!
//! This crate provides:
//! - Bounded dedup window over (topic, signature)
//! - Transport abstraction
//! - In-process broadcast hub (BroadcastChannel equivalent)
//! - Storage-pulse transport riding on device storage change events
//! - FanoutBus: publishes on every transport, delivers each fact once

pub mod dedup;
pub mod transport;
pub mod broadcast;
pub mod pulse;
pub mod fanout;

pub use dedup::*;
pub use transport::*;
pub use broadcast::*;
pub use pulse::*;
pub use fanout::*;
