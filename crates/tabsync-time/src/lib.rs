//! tabsync Time - clocks and temporal control
//!
//! This crate implements the time-based policies of the engine:
//! - Wall clocks (system and manually driven)
//! - The conflict-suppression window
//! - Per-key debouncing
//! - Capped exponential backoff with per-key tracking

pub mod clock;
pub mod window;
pub mod backoff;

pub use clock::*;
pub use window::*;
pub use backoff::*;
