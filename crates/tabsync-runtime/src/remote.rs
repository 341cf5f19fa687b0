//! Authoritative service contract

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tabsync_core::{ItemId, Namespace, SyncResult};
use tabsync_state::{LikeUpdate, VoteUpdate};

/// `{liked?, likes?, votes?:{label:count}, myChoice?}`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub votes: Option<BTreeMap<String, u64>>,
    /// Absent: unknown. `null`: no choice.
    #[serde(
        rename = "myChoice",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub my_choice: Option<Option<String>>,
}

fn present<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(d).map(Some)
}

impl Snapshot {
    pub fn like(liked: bool, likes: u64) -> Self {
        Snapshot {
            liked: Some(liked),
            likes: Some(likes),
            ..Snapshot::default()
        }
    }

    pub fn vote(votes: BTreeMap<String, u64>, my_choice: Option<String>) -> Self {
        Snapshot {
            votes: Some(votes),
            my_choice: Some(my_choice),
            ..Snapshot::default()
        }
    }

    pub fn has_like(&self) -> bool {
        self.liked.is_some() || self.likes.is_some()
    }

    pub fn has_vote(&self) -> bool {
        self.votes.is_some() || self.my_choice.is_some()
    }

    pub fn like_update(&self) -> LikeUpdate {
        LikeUpdate::new(self.liked, self.likes)
    }

    pub fn vote_update(&self) -> VoteUpdate {
        VoteUpdate {
            counts: self.votes.clone(),
            my_choice: self.my_choice.clone(),
        }
    }
}

/// Service holding the authoritative like and vote state
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn snapshot(&self, item: &ItemId, ns: &Namespace) -> SyncResult<Snapshot>;

    async fn mutate_like(&self, item: &ItemId, ns: &Namespace, liked: bool) -> SyncResult<Snapshot>;

    /// `None` withdraws the vote
    async fn mutate_vote(
        &self,
        item: &ItemId,
        ns: &Namespace,
        choice: Option<String>,
    ) -> SyncResult<Snapshot>;
}
