//! Collection store
//!
//! A bounded set of values from one domain, scoped by namespace and plane.
//! Mutations persist, notify local listeners, then publish. A failed write
//! only skips persistence; the in-memory effect and notifications still
//! happen.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use tabsync_core::{Domain, EngineEvent, SyncError, SyncFact, SyncResult, Timestamp};
use tracing::{debug, warn};

use crate::keys::collection_key;
use crate::{Plane, Scope, StoreContext};

#[derive(Clone, Debug)]
struct CachedSet {
    members: BTreeSet<String>,
    /// Last write reached storage, so storage is authoritative for reads
    persisted: bool,
    updated_at: Timestamp,
}

pub struct CollectionStore {
    domain: Domain,
    ctx: StoreContext,
    cache: Mutex<HashMap<Scope, CachedSet>>,
}

impl CollectionStore {
    pub fn new(domain: Domain, ctx: StoreContext) -> Self {
        CollectionStore {
            domain,
            ctx,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn add(&self, value: &str) {
        if !self.domain.contains(value) {
            return;
        }
        self.mutate(|members| members.insert(value.to_string()));
    }

    pub fn remove(&self, value: &str) {
        if !self.domain.contains(value) {
            return;
        }
        self.mutate(|members| members.remove(value));
    }

    /// Flip membership; returns whether `value` is a member afterwards
    pub fn toggle(&self, value: &str) -> bool {
        if !self.domain.contains(value) {
            return false;
        }
        let members = self.mutate(|members| {
            if !members.remove(value) {
                members.insert(value.to_string());
            }
            true
        });
        members.contains(value)
    }

    pub fn clear(&self) {
        self.mutate(|members| {
            let changed = !members.is_empty();
            members.clear();
            changed
        });
    }

    pub fn get_all(&self) -> BTreeSet<String> {
        self.load(&self.ctx.resolver.scope())
    }

    pub fn has(&self, value: &str) -> bool {
        self.domain.contains(value) && self.get_all().contains(value)
    }

    /// Members stored under an explicit scope, regardless of auth state
    pub fn get_in(&self, scope: &Scope) -> BTreeSet<String> {
        self.load(scope)
    }

    /// Merge a set published by another context. Last writer wins by fact
    /// timestamp. Returns whether the local view changed.
    pub fn apply_remote(&self, members: &[String], at: Timestamp) -> bool {
        let scope = self.ctx.resolver.scope();
        let incoming = self.domain.filter(members);

        // Compare against what this context last saw; the sender has
        // usually written the shared key already.
        let previous = self.cache.lock().get(&scope).cloned();
        if let Some(cached) = &previous {
            if cached.updated_at > at {
                debug!(domain = self.domain.name(), %at, "stale collection fact ignored");
                return false;
            }
        }

        // Never rewrite the shared plane on behalf of the sender; unless it
        // already holds this set, the cache stays authoritative.
        let persisted = match scope.plane {
            Plane::Persistent => matches!(self.read(&scope), Ok(Some(ref stored)) if *stored == incoming),
            Plane::Ephemeral => self.persist(&scope, &incoming),
        };
        self.cache.lock().insert(
            scope,
            CachedSet {
                members: incoming.clone(),
                persisted,
                updated_at: at,
            },
        );

        if previous.is_some_and(|c| c.members == incoming) {
            return false;
        }
        self.ctx.listeners.emit(&EngineEvent::CollectionChanged {
            domain: self.domain.name().to_string(),
            members: incoming,
        });
        true
    }

    /// Explicit guest-to-account step: union the anonymous ephemeral set
    /// into the current persistent set. No-op while signed out.
    pub fn adopt_guest(&self) -> BTreeSet<String> {
        let scope = self.ctx.resolver.scope();
        if scope.plane != Plane::Persistent {
            return self.load(&scope);
        }
        let guest = self.load(&Scope::guest());
        self.mutate(|members| {
            let before = members.len();
            members.extend(guest);
            members.len() != before
        })
    }

    fn mutate(&self, op: impl FnOnce(&mut BTreeSet<String>) -> bool) -> BTreeSet<String> {
        let scope = self.ctx.resolver.scope();
        let mut members = self.load(&scope);
        if !op(&mut members) {
            return members;
        }

        let previous = self.cache.lock().get(&scope).map(|c| c.updated_at);
        let now = self.ctx.stamp_after(previous);
        let persisted = self.persist(&scope, &members);
        self.cache.lock().insert(
            scope.clone(),
            CachedSet {
                members: members.clone(),
                persisted,
                updated_at: now,
            },
        );

        self.ctx.listeners.emit(&EngineEvent::CollectionChanged {
            domain: self.domain.name().to_string(),
            members: members.clone(),
        });
        self.ctx.publish(
            &scope,
            &SyncFact::members(self.domain.name(), members.iter().cloned(), now),
        );
        members
    }

    fn load(&self, scope: &Scope) -> BTreeSet<String> {
        let cached = self.cache.lock().get(scope).cloned();
        if let Some(cached) = &cached {
            if !cached.persisted {
                return cached.members.clone();
            }
        }

        match self.read(scope) {
            Ok(stored) => {
                let members = stored.unwrap_or_default();
                let updated_at = cached.map(|c| c.updated_at).unwrap_or(Timestamp::ZERO);
                self.cache.lock().insert(
                    scope.clone(),
                    CachedSet {
                        members: members.clone(),
                        persisted: true,
                        updated_at,
                    },
                );
                members
            }
            Err(e) => {
                debug!(domain = self.domain.name(), scope = %scope, error = %e, "collection read fell back to memory");
                cached.map(|c| c.members).unwrap_or_default()
            }
        }
    }

    fn read(&self, scope: &Scope) -> SyncResult<Option<BTreeSet<String>>> {
        let key = collection_key(self.domain.name(), &scope.namespace);
        let Some(raw) = self.ctx.planes.get(scope.plane).get(&key)? else {
            return Ok(None);
        };
        let stored: Vec<String> =
            serde_json::from_str(&raw).map_err(|e| SyncError::MalformedFact(e.to_string()))?;
        Ok(Some(self.domain.filter(stored)))
    }

    fn persist(&self, scope: &Scope, members: &BTreeSet<String>) -> bool {
        let key = collection_key(self.domain.name(), &scope.namespace);
        let result = serde_json::to_string(&members.iter().collect::<Vec<_>>())
            .map_err(SyncError::from)
            .and_then(|raw| self.ctx.planes.get(scope.plane).set(&key, &raw));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "persistence skipped");
                false
            }
        }
    }
}

impl std::fmt::Debug for CollectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollectionStore({:?})", self.domain)
    }
}
