//! tabsync Test Harness - simulated devices and hostile transports
//!
//! This crate provides:
//! - A simulated device (shared storage, broadcast hub, auth, remote service)
//!   on which engine contexts are opened
//! - A scripted authoritative service with latency and failure injection
//! - A chaos transport that drops and duplicates facts

pub mod chaos;
pub mod service;
pub mod harness;

pub use chaos::*;
pub use service::*;
pub use harness::*;
