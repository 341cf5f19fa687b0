//! tabsync State - optimistic per-item state
//!
//! This crate implements:
//! - IntentCache: like flags and counts, asserted locally and merged with
//!   external facts under a conflict window
//! - VoteBook: the single-choice vote machine on the same pattern
//! - Merge outcomes shared by both

pub mod merge;
pub mod intent;
pub mod vote;

pub use merge::*;
pub use intent::*;
pub use vote::*;
