//! tabsync Storage - partitioned planes and the stores built on them
//!
//! This crate implements:
//! - Key-value planes (context-local memory, device-shared store with
//!   change notification)
//! - Storage key layout
//! - Namespace and plane resolution from the auth capability
//! - CollectionStore and SelectionStore
//! - Boot-time legacy migration and logout purging

pub mod kv;
pub mod device;
pub mod keys;
pub mod namespace;
pub mod context;
pub mod collection;
pub mod selection;
pub mod migrate;

#[cfg(test)]
pub(crate) mod testing;

pub use kv::*;
pub use device::*;
pub use namespace::*;
pub use context::*;
pub use collection::*;
pub use selection::*;
pub use migrate::*;
