//! Sync facts
//!
//! A fact is the unit every context publishes after a local change and the
//! unit every transport carries. Facts have no identity of their own;
//! receivers recognise duplicates by the signature of their content.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::{ActorId, ItemId, SyncError, SyncResult, Timestamp};

/// What the fact is about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    Selection,
    Collection,
    Like,
    Vote,
}

/// What happened
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactOp {
    /// Full replacement of a scalar or set
    Set,
    /// Scalar cleared
    Clear,
    /// Optimistic local assertion
    Assert,
    /// Authoritative service result
    Confirm,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactData {
    Members {
        domain: String,
        members: Vec<String>,
    },
    Selection {
        domain: String,
        value: Option<String>,
    },
    Like {
        item: ItemId,
        liked: Option<bool>,
        count: Option<u64>,
        actor: Option<ActorId>,
    },
    Vote {
        item: ItemId,
        counts: BTreeMap<String, u64>,
        my_choice: Option<String>,
        actor: Option<ActorId>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FactPayload {
    #[serde(rename = "type")]
    pub op: FactOp,
    pub data: FactData,
    pub timestamp: Timestamp,
}

/// `{kind, payload:{type, data, timestamp}}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncFact {
    pub kind: FactKind,
    pub payload: FactPayload,
}

/// Pulse scope shared by like and vote facts
pub const INTENT_SCOPE: &str = "intent";

impl SyncFact {
    pub fn members<I, S>(domain: &str, members: I, at: Timestamp) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SyncFact {
            kind: FactKind::Collection,
            payload: FactPayload {
                op: FactOp::Set,
                data: FactData::Members {
                    domain: domain.to_string(),
                    members: members.into_iter().map(Into::into).collect(),
                },
                timestamp: at,
            },
        }
    }

    pub fn selection(domain: &str, value: Option<String>, at: Timestamp) -> Self {
        let op = if value.is_some() {
            FactOp::Set
        } else {
            FactOp::Clear
        };
        SyncFact {
            kind: FactKind::Selection,
            payload: FactPayload {
                op,
                data: FactData::Selection {
                    domain: domain.to_string(),
                    value,
                },
                timestamp: at,
            },
        }
    }

    pub fn like(
        op: FactOp,
        item: ItemId,
        liked: Option<bool>,
        count: Option<u64>,
        actor: ActorId,
        at: Timestamp,
    ) -> Self {
        SyncFact {
            kind: FactKind::Like,
            payload: FactPayload {
                op,
                data: FactData::Like {
                    item,
                    liked,
                    count,
                    actor: Some(actor),
                },
                timestamp: at,
            },
        }
    }

    pub fn vote(
        op: FactOp,
        item: ItemId,
        counts: BTreeMap<String, u64>,
        my_choice: Option<String>,
        actor: ActorId,
        at: Timestamp,
    ) -> Self {
        SyncFact {
            kind: FactKind::Vote,
            payload: FactPayload {
                op,
                data: FactData::Vote {
                    item,
                    counts,
                    my_choice,
                    actor: Some(actor),
                },
                timestamp: at,
            },
        }
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.payload.timestamp
    }

    /// Domain name for selection/collection facts, [`INTENT_SCOPE`] otherwise
    pub fn scope(&self) -> &str {
        match &self.payload.data {
            FactData::Members { domain, .. } | FactData::Selection { domain, .. } => domain,
            FactData::Like { .. } | FactData::Vote { .. } => INTENT_SCOPE,
        }
    }

    /// Kind and data agree with each other
    pub fn is_consistent(&self) -> bool {
        matches!(
            (self.kind, &self.payload.data),
            (FactKind::Collection, FactData::Members { .. })
                | (FactKind::Selection, FactData::Selection { .. })
                | (FactKind::Like, FactData::Like { .. })
                | (FactKind::Vote, FactData::Vote { .. })
        )
    }

    /// Content signature used for cross-transport deduplication
    pub fn signature(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        match serde_json::to_string(self) {
            Ok(canonical) => canonical.hash(&mut hasher),
            Err(_) => format!("{:?}", self).hash(&mut hasher),
        }
        hasher.finish()
    }

    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a fact received from a transport. Anything unparsable or
    /// internally inconsistent is a [`SyncError::MalformedFact`].
    pub fn decode(raw: &str) -> SyncResult<Self> {
        let fact: SyncFact =
            serde_json::from_str(raw).map_err(|e| SyncError::MalformedFact(e.to_string()))?;
        if !fact.is_consistent() {
            return Err(SyncError::MalformedFact(format!(
                "kind {:?} does not match payload",
                fact.kind
            )));
        }
        Ok(fact)
    }
}
