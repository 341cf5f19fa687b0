//! Closed value vocabularies
//!
//! Every selection and collection is scoped to a [`Domain`]: a name (the
//! collection type that appears in storage keys) plus the closed set of
//! values it may hold. Values outside the vocabulary are ignored, never
//! reported as errors.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Named closed enumeration of allowed values
#[derive(Clone, PartialEq, Eq)]
pub struct Domain {
    name: Arc<str>,
    allowed: Arc<BTreeSet<String>>,
}

impl Domain {
    pub fn new<I, S>(name: &str, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Domain {
            name: Arc::from(name),
            allowed: Arc::new(allowed.into_iter().map(Into::into).collect()),
        }
    }

    /// Collection type, as used in storage keys
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn contains(&self, value: &str) -> bool {
        self.allowed.contains(value)
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    /// Keep only in-vocabulary values
    pub fn filter<I, S>(&self, values: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        values
            .into_iter()
            .filter(|v| self.contains(v.as_ref()))
            .map(|v| v.as_ref().to_string())
            .collect()
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Domain({}: {} values)", self.name, self.allowed.len())
    }
}
