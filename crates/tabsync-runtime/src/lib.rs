//! tabsync Runtime - one engine per execution context
//!
//! This crate implements:
//! - Engine configuration and presets
//! - The remote service contract
//! - IntentHub: like/vote state shared by the engine and the client
//! - ReconciliationClient: debounced, single-flight fetches, mutations
//!   and backoff retries
//! - Engine: lifecycle, stores, fact routing, auth transitions
//! - Tracing subscriber setup

pub mod config;
pub mod clock;
pub mod logging;
pub mod remote;
pub mod hub;
pub mod client;
pub mod engine;

pub use config::*;
pub use clock::*;
pub use logging::*;
pub use remote::*;
pub use hub::*;
pub use client::*;
pub use engine::*;
