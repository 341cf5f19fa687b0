//! Storage key layout
//!
//! - selection:  `selection:{domain}:{ns}` -> JSON string
//! - collection: `collected:{domain}:{ns}` -> JSON array
//! - pulse:      `sync:{scope}:{ns}`       -> pulse record
//! - mirror:     `{domain}:mirror`         -> `{value, t, ns}`
//!
//! The un-namespaced `selection:{domain}` and `collected:{domain}` keys are
//! legacy and only read by the boot migration.

use tabsync_core::Namespace;

pub const PULSE_PREFIX: &str = "sync:";

pub fn selection_key(domain: &str, ns: &Namespace) -> String {
    format!("selection:{}:{}", domain, ns)
}

pub fn collection_key(domain: &str, ns: &Namespace) -> String {
    format!("collected:{}:{}", domain, ns)
}

pub fn pulse_key(scope: &str, ns: &Namespace) -> String {
    format!("{}{}:{}", PULSE_PREFIX, scope, ns)
}

pub fn mirror_key(domain: &str) -> String {
    format!("{}:mirror", domain)
}

pub fn legacy_selection_key(domain: &str) -> String {
    format!("selection:{}", domain)
}

pub fn legacy_collection_key(domain: &str) -> String {
    format!("collected:{}", domain)
}

/// Whether `key` is a pulse key for namespace `ns`
pub fn is_pulse_key_for(key: &str, ns: &Namespace) -> bool {
    key.starts_with(PULSE_PREFIX)
        && key
            .strip_suffix(ns.as_str())
            .is_some_and(|rest| rest.ends_with(':') && rest.len() > PULSE_PREFIX.len())
}
