//! Selection store
//!
//! One optional value from a domain per namespace. While signed in, every
//! write also refreshes a device-wide mirror record so a fresh context can
//! restore the selection before any fact reaches it.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tabsync_core::{Domain, EngineEvent, Namespace, SyncError, SyncFact, SyncResult, Timestamp};
use tracing::{debug, warn};

use crate::keys::{mirror_key, selection_key};
use crate::{Plane, Scope, StoreContext};

/// `{domain}:mirror` record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub value: Option<String>,
    pub t: Timestamp,
    pub ns: Namespace,
}

#[derive(Clone, Debug)]
struct CachedValue {
    value: Option<String>,
    persisted: bool,
    updated_at: Timestamp,
}

pub struct SelectionStore {
    domain: Domain,
    ctx: StoreContext,
    cache: Mutex<HashMap<Scope, CachedValue>>,
}

impl SelectionStore {
    pub fn new(domain: Domain, ctx: StoreContext) -> Self {
        SelectionStore {
            domain,
            ctx,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn select(&self, value: &str) {
        if !self.domain.contains(value) {
            return;
        }
        self.write(Some(value.to_string()));
    }

    pub fn clear(&self) {
        self.write(None);
    }

    pub fn get(&self) -> Option<String> {
        self.load(&self.ctx.resolver.scope())
    }

    pub fn is(&self, value: &str) -> bool {
        self.get().as_deref() == Some(value)
    }

    /// Merge a selection published by another context, last writer wins.
    pub fn apply_remote(&self, value: Option<&str>, at: Timestamp) -> bool {
        let value = match value {
            Some(v) if !self.domain.contains(v) => return false,
            other => other.map(str::to_string),
        };
        let scope = self.ctx.resolver.scope();
        // Compare against what this context last saw; the sender has
        // usually written the shared key already.
        let previous = self.cache.lock().get(&scope).cloned();
        if let Some(cached) = &previous {
            if cached.updated_at > at {
                debug!(domain = self.domain.name(), %at, "stale selection fact ignored");
                return false;
            }
        }

        let persisted = match scope.plane {
            Plane::Persistent => matches!(self.read(&scope), Ok(ref stored) if *stored == value),
            Plane::Ephemeral => self.persist(&scope, value.as_deref()),
        };
        self.cache.lock().insert(
            scope,
            CachedValue {
                value: value.clone(),
                persisted,
                updated_at: at,
            },
        );

        if previous.is_some_and(|c| c.value == value) {
            return false;
        }
        self.ctx.listeners.emit(&EngineEvent::SelectionChanged {
            domain: self.domain.name().to_string(),
            value,
        });
        true
    }

    /// Restore a missing persistent selection from the device mirror.
    /// Only a mirror written under the active namespace is trusted.
    pub fn hydrate(&self) -> Option<String> {
        let scope = self.ctx.resolver.scope();
        if scope.plane != Plane::Persistent {
            return self.load(&scope);
        }
        if let Ok(Some(current)) = self.read(&scope) {
            return Some(current);
        }

        let mirror = match self.read_mirror() {
            Ok(Some(mirror)) => mirror,
            Ok(None) => return self.load(&scope),
            Err(e) => {
                debug!(domain = self.domain.name(), error = %e, "mirror unreadable");
                return self.load(&scope);
            }
        };
        let restorable = mirror.ns == scope.namespace
            && mirror.value.as_deref().is_some_and(|v| self.domain.contains(v));
        if !restorable {
            return self.load(&scope);
        }

        if self.persist(&scope, mirror.value.as_deref()) {
            debug!(domain = self.domain.name(), ns = %scope.namespace, "selection restored from mirror");
            self.cache.lock().remove(&scope);
        }
        self.load(&scope)
    }

    fn write(&self, value: Option<String>) {
        let scope = self.ctx.resolver.scope();
        if self.load(&scope) == value {
            return;
        }

        let previous = self.cache.lock().get(&scope).map(|c| c.updated_at);
        let now = self.ctx.stamp_after(previous);
        let persisted = self.persist(&scope, value.as_deref());
        if scope.plane == Plane::Persistent {
            self.write_mirror(&scope.namespace, value.clone(), now);
        }
        self.cache.lock().insert(
            scope.clone(),
            CachedValue {
                value: value.clone(),
                persisted,
                updated_at: now,
            },
        );

        self.ctx.listeners.emit(&EngineEvent::SelectionChanged {
            domain: self.domain.name().to_string(),
            value: value.clone(),
        });
        self.ctx
            .publish(&scope, &SyncFact::selection(self.domain.name(), value, now));
    }

    fn load(&self, scope: &Scope) -> Option<String> {
        let cached = self.cache.lock().get(scope).cloned();
        if let Some(cached) = &cached {
            if !cached.persisted {
                return cached.value.clone();
            }
        }
        match self.read(scope) {
            Ok(value) => {
                let updated_at = cached.map(|c| c.updated_at).unwrap_or(Timestamp::ZERO);
                self.cache.lock().insert(
                    scope.clone(),
                    CachedValue {
                        value: value.clone(),
                        persisted: true,
                        updated_at,
                    },
                );
                value
            }
            Err(e) => {
                debug!(domain = self.domain.name(), scope = %scope, error = %e, "selection read fell back to memory");
                cached.and_then(|c| c.value)
            }
        }
    }

    fn read(&self, scope: &Scope) -> SyncResult<Option<String>> {
        let key = selection_key(self.domain.name(), &scope.namespace);
        let Some(raw) = self.ctx.planes.get(scope.plane).get(&key)? else {
            return Ok(None);
        };
        let value: String =
            serde_json::from_str(&raw).map_err(|e| SyncError::MalformedFact(e.to_string()))?;
        Ok(Some(value).filter(|v| self.domain.contains(v)))
    }

    fn persist(&self, scope: &Scope, value: Option<&str>) -> bool {
        let key = selection_key(self.domain.name(), &scope.namespace);
        let store = self.ctx.planes.get(scope.plane);
        let result = match value {
            Some(v) => serde_json::to_string(v)
                .map_err(SyncError::from)
                .and_then(|raw| store.set(&key, &raw)),
            None => store.remove(&key),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "persistence skipped");
                false
            }
        }
    }

    fn read_mirror(&self) -> SyncResult<Option<MirrorRecord>> {
        let key = mirror_key(self.domain.name());
        match self.ctx.planes.persistent().get(&key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_mirror(&self, ns: &Namespace, value: Option<String>, t: Timestamp) {
        let key = mirror_key(self.domain.name());
        let record = MirrorRecord {
            value,
            t,
            ns: ns.clone(),
        };
        let result = serde_json::to_string(&record)
            .map_err(SyncError::from)
            .and_then(|raw| self.ctx.planes.persistent().set(&key, &raw));
        if let Err(e) = result {
            warn!(key = %key, error = %e, "mirror not refreshed");
        }
    }
}

impl std::fmt::Debug for SelectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SelectionStore({:?})", self.domain)
    }
}
