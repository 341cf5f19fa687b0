//! Identity types for tabsync
//!
//! Contexts are numbered per device; everything that crosses a storage key
//! or a fact payload is a string newtype so it serializes transparently.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Execution context identity (one per engine instance, e.g. a browser tab)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl ContextId {
    pub const ZERO: ContextId = ContextId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        ContextId(id)
    }

    /// Actor identity that facts from this context carry
    pub fn actor(self) -> ActorId {
        ActorId(format!("ctx-{:08x}", self.0))
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({:08x})", self.0)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

string_id!(
    /// Author of a fact. Confirmation logic trusts this value as given.
    ActorId,
    "Actor"
);

string_id!(
    /// Content item that can be liked or voted on
    ItemId,
    "Item"
);

string_id!(
    /// Authenticated user identity as reported by the auth capability
    Identity,
    "Identity"
);

string_id!(
    /// Storage partition key
    Namespace,
    "Ns"
);

impl Namespace {
    /// Partition used whenever nobody is authenticated
    pub const DEFAULT: &'static str = "default";

    pub fn default_partition() -> Self {
        Namespace(Self::DEFAULT.to_string())
    }

    /// Namespace derived from an authenticated identity
    pub fn for_identity(identity: &Identity) -> Self {
        Namespace(format!("user-{}", identity.0))
    }

    pub fn is_default(&self) -> bool {
        self.0 == Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_actor_is_stable() {
        let ctx = ContextId::new(0xBEEF);
        assert_eq!(ctx.actor(), ctx.actor());
        assert_ne!(ctx.actor(), ContextId::new(0xBEF0).actor());
    }

    #[test]
    fn test_namespace_derivation() {
        let ns = Namespace::for_identity(&Identity::new("alice"));
        assert_eq!(ns.as_str(), "user-alice");
        assert!(!ns.is_default());
        assert!(Namespace::default_partition().is_default());
    }

    #[test]
    fn test_string_ids_serialize_transparently() {
        let item = ItemId::new("post-7");
        assert_eq!(serde_json::to_string(&item).unwrap(), "\"post-7\"");
    }
}
