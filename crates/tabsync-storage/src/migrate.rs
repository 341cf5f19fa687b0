//! Boot migration and logout housekeeping

use tabsync_core::{Domain, Namespace};
use tracing::{debug, info, warn};

use crate::keys::{
    collection_key, is_pulse_key_for, legacy_collection_key, legacy_selection_key, selection_key,
};
use crate::{KeyValueStore, MirrorRecord, Plane, Planes, Scope};

const MIRROR_SUFFIX: &str = ":mirror";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Legacy keys whose value moved into the active scope
    pub moved: Vec<String>,
    /// Legacy keys dropped because the target already held a value
    pub discarded: Vec<String>,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty() && self.discarded.is_empty()
    }
}

/// Move un-namespaced keys into `scope`. Idempotent: a second run finds
/// no legacy keys left. An ephemeral scope only drains the ephemeral plane;
/// device-wide legacy keys wait for a persistent boot.
pub fn migrate_legacy(
    planes: &Planes,
    scope: &Scope,
    selections: &[Domain],
    collections: &[Domain],
) -> MigrationReport {
    let mut report = MigrationReport::default();
    let pairs = selections
        .iter()
        .map(|d| {
            (
                legacy_selection_key(d.name()),
                selection_key(d.name(), &scope.namespace),
            )
        })
        .chain(collections.iter().map(|d| {
            (
                legacy_collection_key(d.name()),
                collection_key(d.name(), &scope.namespace),
            )
        }));

    let sources: &[Plane] = match scope.plane {
        Plane::Persistent => &[Plane::Persistent, Plane::Ephemeral],
        Plane::Ephemeral => &[Plane::Ephemeral],
    };
    let target = planes.get(scope.plane);
    for (legacy, key) in pairs {
        for &plane in sources {
            let source = planes.get(plane);
            let Ok(Some(value)) = source.get(&legacy) else {
                continue;
            };
            let target_empty = matches!(target.get(&key), Ok(None));
            if target_empty {
                if let Err(e) = target.set(&key, &value) {
                    warn!(key = %key, error = %e, "legacy value not migrated");
                    continue;
                }
                report.moved.push(legacy.clone());
            } else {
                report.discarded.push(legacy.clone());
            }
            if let Err(e) = source.remove(&legacy) {
                warn!(key = %legacy, error = %e, "legacy key not removed");
            }
        }
    }

    if !report.is_empty() {
        info!(
            moved = report.moved.len(),
            discarded = report.discarded.len(),
            scope = %scope,
            "legacy storage migrated"
        );
    }
    report
}

/// Remove device state that would leak `prior`'s session to the next
/// identity: selection mirrors written under it and its pulse keys.
/// Unparsable mirrors are dropped too.
pub fn purge_on_logout(planes: &Planes, prior: &Namespace) -> usize {
    let store = planes.persistent();
    let keys = match store.keys() {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "logout purge skipped");
            return 0;
        }
    };

    let mut removed = 0;
    for key in keys {
        let doomed = if key.ends_with(MIRROR_SUFFIX) {
            match store.get(&key) {
                Ok(Some(raw)) => serde_json::from_str::<MirrorRecord>(&raw)
                    .map(|m| m.ns == *prior)
                    .unwrap_or(true),
                _ => false,
            }
        } else {
            is_pulse_key_for(&key, prior)
        };
        if doomed && remove_logged(store, &key) {
            removed += 1;
        }
    }
    debug!(ns = %prior, removed, "logout purge finished");
    removed
}

/// Drop the anonymous partition of the ephemeral plane
pub fn clear_ephemeral(planes: &Planes) -> usize {
    let store = planes.ephemeral();
    let suffix = format!(":{}", Namespace::DEFAULT);
    let keys = match store.keys() {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "guest data not cleared");
            return 0;
        }
    };
    keys.iter()
        .filter(|k| {
            (k.starts_with("selection:") || k.starts_with("collected:")) && k.ends_with(&suffix)
        })
        .filter(|k| remove_logged(store, k))
        .count()
}

fn remove_logged(store: &dyn KeyValueStore, key: &str) -> bool {
    match store.remove(key) {
        Ok(()) => true,
        Err(e) => {
            warn!(key, error = %e, "key not removed");
            false
        }
    }
}
