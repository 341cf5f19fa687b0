//! tabsync Core - Fundamental types and capabilities
//!
//! This crate defines the types shared by every tabsync layer:
//! - Identifiers (ContextId, ActorId, ItemId, Identity, Namespace)
//! - Wall-clock timestamps
//! - Closed value vocabularies (Domain)
//! - Sync facts and the FactBus capability
//! - The authentication capability
//! - Engine events and local listeners

pub mod id;
pub mod time;
pub mod domain;
pub mod fact;
pub mod bus;
pub mod auth;
pub mod event;
pub mod error;

pub use id::*;
pub use time::*;
pub use domain::*;
pub use fact::*;
pub use bus::*;
pub use auth::*;
pub use event::*;
pub use error::*;
