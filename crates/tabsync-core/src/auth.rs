//! Authentication capability
//!
//! The engine never reads a global session object. It asks an injected
//! [`AuthStateProvider`] at call time, every time.

use parking_lot::RwLock;

use crate::{Identity, Namespace};

pub trait AuthStateProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;

    fn current_identity(&self) -> Option<Identity>;
}

/// Mutable auth state shared by the contexts of one device.
/// Logging in from any context is visible to all of them immediately.
#[derive(Debug, Default)]
pub struct SessionAuth {
    identity: RwLock<Option<Identity>>,
}

impl SessionAuth {
    pub fn anonymous() -> Self {
        SessionAuth::default()
    }

    pub fn signed_in(identity: Identity) -> Self {
        SessionAuth {
            identity: RwLock::new(Some(identity)),
        }
    }

    pub fn login(&self, identity: Identity) {
        *self.identity.write() = Some(identity);
    }

    /// Returns the identity that was signed in, if any
    pub fn logout(&self) -> Option<Identity> {
        self.identity.write().take()
    }
}

impl AuthStateProvider for SessionAuth {
    fn is_authenticated(&self) -> bool {
        self.identity.read().is_some()
    }

    fn current_identity(&self) -> Option<Identity> {
        self.identity.read().clone()
    }
}

/// Namespace a provider resolves to right now
pub fn namespace_of(auth: &dyn AuthStateProvider) -> Namespace {
    match auth.current_identity() {
        Some(identity) if auth.is_authenticated() => Namespace::for_identity(&identity),
        _ => Namespace::default_partition(),
    }
}
