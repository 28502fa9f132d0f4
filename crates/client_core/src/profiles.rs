use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use shared::{domain::Table, domain::UserId, protocol::Profile};
use tokio::sync::RwLock;
use tracing::warn;

use crate::backend::{select_as, Query, RowStore};

pub const UNKNOWN_USERNAME: &str = "Unknown";

pub struct ProfileCache {
    store: Arc<dyn RowStore>,
    profiles: RwLock<HashMap<UserId, Profile>>,
}

impl ProfileCache {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self {
            store,
            profiles: RwLock::new(HashMap::new()),
        }
    }

    /// Fetches the ids not cached yet in one batched lookup and returns the
    /// whole merged cache. Lookup failures leave those ids missing.
    pub async fn ensure<I>(&self, ids: I) -> HashMap<UserId, Profile>
    where
        I: IntoIterator<Item = UserId>,
    {
        let missing: Vec<UserId> = {
            let cached = self.profiles.read().await;
            let mut seen = HashSet::new();
            ids.into_iter()
                .filter(|id| !cached.contains_key(id) && seen.insert(*id))
                .collect()
        };

        if !missing.is_empty() {
            let query = Query::new(Table::Profiles).any_of("id", &missing);
            match select_as::<Profile>(self.store.as_ref(), query).await {
                Ok(fetched) => {
                    let mut cached = self.profiles.write().await;
                    for profile in fetched {
                        cached.insert(profile.id, profile);
                    }
                }
                Err(err) => {
                    warn!(missing = missing.len(), "profiles: batched lookup failed: {err:#}");
                }
            }
        }

        self.profiles.read().await.clone()
    }

    pub async fn get(&self, id: UserId) -> Option<Profile> {
        self.profiles.read().await.get(&id).cloned()
    }

    pub async fn contains(&self, id: UserId) -> bool {
        self.profiles.read().await.contains_key(&id)
    }

    pub async fn insert(&self, profile: Profile) {
        self.profiles.write().await.insert(profile.id, profile);
    }

    pub async fn insert_many(&self, profiles: impl IntoIterator<Item = Profile>) {
        let mut cached = self.profiles.write().await;
        for profile in profiles {
            cached.insert(profile.id, profile);
        }
    }

    pub async fn username(&self, id: UserId) -> String {
        self.get(id)
            .await
            .map(|p| p.username)
            .unwrap_or_else(|| UNKNOWN_USERNAME.to_string())
    }

    pub async fn record_last_seen(&self, id: UserId, at: DateTime<Utc>) {
        if let Some(profile) = self.profiles.write().await.get_mut(&id) {
            profile.last_seen = Some(at);
        }
    }

    pub async fn snapshot(&self) -> HashMap<UserId, Profile> {
        self.profiles.read().await.clone()
    }
}

#[cfg(test)]
#[path = "tests/profiles_tests.rs"]
mod tests;
