//! Namespace and plane resolution
//!
//! Both are recomputed on every call from the auth capability: another
//! context may sign in or out at any moment, so nothing here is cached.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tabsync_core::{AuthStateProvider, Namespace};

use crate::KeyValueStore;

/// Durability tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plane {
    /// Context-local, gone when the context ends
    Ephemeral,
    /// Shared by every context of the device
    Persistent,
}

/// Namespace and plane resolved together from one auth reading
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Scope {
    pub namespace: Namespace,
    pub plane: Plane,
}

impl Scope {
    pub fn new(namespace: Namespace, plane: Plane) -> Self {
        Scope { namespace, plane }
    }

    /// The anonymous scope: default partition, ephemeral plane
    pub fn guest() -> Self {
        Scope::new(Namespace::default_partition(), Plane::Ephemeral)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:?}", self.namespace, self.plane)
    }
}

#[derive(Clone)]
pub struct NamespaceResolver {
    auth: Arc<dyn AuthStateProvider>,
}

impl NamespaceResolver {
    pub fn new(auth: Arc<dyn AuthStateProvider>) -> Self {
        NamespaceResolver { auth }
    }

    pub fn auth(&self) -> &Arc<dyn AuthStateProvider> {
        &self.auth
    }

    pub fn namespace(&self) -> Namespace {
        self.scope().namespace
    }

    pub fn plane(&self) -> Plane {
        self.scope().plane
    }

    pub fn scope(&self) -> Scope {
        let identity = if self.auth.is_authenticated() {
            self.auth.current_identity()
        } else {
            None
        };
        match identity {
            Some(identity) => Scope::new(Namespace::for_identity(&identity), Plane::Persistent),
            None => Scope::guest(),
        }
    }
}

impl fmt::Debug for NamespaceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NamespaceResolver({})", self.scope())
    }
}

/// The two storage planes of one context
#[derive(Clone)]
pub struct Planes {
    ephemeral: Arc<dyn KeyValueStore>,
    persistent: Arc<dyn KeyValueStore>,
}

impl Planes {
    pub fn new(ephemeral: Arc<dyn KeyValueStore>, persistent: Arc<dyn KeyValueStore>) -> Self {
        Planes {
            ephemeral,
            persistent,
        }
    }

    pub fn get(&self, plane: Plane) -> &dyn KeyValueStore {
        match plane {
            Plane::Ephemeral => self.ephemeral.as_ref(),
            Plane::Persistent => self.persistent.as_ref(),
        }
    }

    pub fn ephemeral(&self) -> &dyn KeyValueStore {
        self.ephemeral.as_ref()
    }

    pub fn persistent(&self) -> &dyn KeyValueStore {
        self.persistent.as_ref()
    }
}

impl fmt::Debug for Planes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Planes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_core::{Identity, SessionAuth};

    #[test]
    fn test_scope_follows_auth_at_call_time() {
        let auth = Arc::new(SessionAuth::anonymous());
        let resolver = NamespaceResolver::new(auth.clone());

        assert_eq!(resolver.scope(), Scope::guest());

        auth.login(Identity::new("dee"));
        assert_eq!(resolver.namespace().as_str(), "user-dee");
        assert_eq!(resolver.plane(), Plane::Persistent);

        auth.logout();
        assert_eq!(resolver.plane(), Plane::Ephemeral);
        assert!(resolver.namespace().is_default());
    }
}
