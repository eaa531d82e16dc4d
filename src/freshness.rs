//! Cache freshness policy.
//!
//! Decides whether cached store contents can be trusted or a remote
//! refetch is due, from a last-fetched timestamp per entity kind and owner.

use std::time::Duration;

use chrono::Utc;

use crate::models::EntityKind;
use crate::store::LocalStore;

/// Identifies one cached listing: an entity kind, optionally scoped to a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: EntityKind,
    pub owner: Option<String>,
}

impl CacheKey {
    pub fn new(kind: EntityKind, owner: Option<&str>) -> Self {
        Self {
            kind,
            owner: owner.map(str::to_string),
        }
    }

    /// Text form stored in the fetch log: `tasks` or `tasks:<owner>`.
    pub fn as_string(&self) -> String {
        match &self.owner {
            Some(owner) => format!("{}:{}", self.kind.store_name(), owner),
            None => self.kind.store_name().to_string(),
        }
    }
}

/// Freshness policy backed by the store's fetch log.
#[derive(Clone)]
pub struct CacheFreshness {
    store: LocalStore,
}

impl CacheFreshness {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Whether the listing was fetched within `max_age`. A missing timestamp,
    /// an unreadable store, or a timestamp in the future all force a refetch.
    pub async fn is_fresh(&self, key: &CacheKey, max_age: Duration) -> bool {
        let fetched_at = match self.store.fetched_at(&key.as_string()).await {
            Ok(Some(at)) => at,
            Ok(None) => return false,
            Err(e) => {
                tracing::debug!("Freshness lookup failed for {}: {}", key.as_string(), e);
                return false;
            }
        };

        let age = Utc::now().timestamp_millis() - fetched_at;
        age >= 0 && (age as u128) < max_age.as_millis()
    }

    /// Record a successful remote fetch.
    pub async fn mark_fetched(&self, key: &CacheKey) {
        let now = Utc::now().timestamp_millis();
        if let Err(e) = self.store.mark_fetched(&key.as_string(), now).await {
            tracing::warn!("Failed to record fetch time for {}: {}", key.as_string(), e);
        }
    }

    /// Re-stamp every cached listing of a kind, for all owners.
    pub async fn refresh_kind(&self, kind: EntityKind) {
        let now = Utc::now().timestamp_millis();
        if let Err(e) = self.store.touch_fetched(kind.store_name(), now).await {
            tracing::warn!("Failed to refresh fetch times for {}: {}", kind, e);
        }
    }

    /// Force the next load of this listing to go to the server.
    pub async fn invalidate(&self, key: &CacheKey) {
        if let Err(e) = self.store.forget_fetched(&key.as_string()).await {
            tracing::warn!("Failed to invalidate {}: {}", key.as_string(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::init_database;
    use tempfile::TempDir;

    async fn policy() -> (CacheFreshness, LocalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let pool = init_database(&temp_dir.path().join("fresh.sqlite"))
            .await
            .unwrap();
        let store = LocalStore::new(pool);
        (CacheFreshness::new(store.clone()), store, temp_dir)
    }

    #[test]
    fn test_cache_key_text() {
        assert_eq!(CacheKey::new(EntityKind::Course, None).as_string(), "courses");
        assert_eq!(
            CacheKey::new(EntityKind::Task, Some("u1")).as_string(),
            "tasks:u1"
        );
    }

    #[tokio::test]
    async fn test_missing_timestamp_is_stale() {
        let (freshness, _store, _dir) = policy().await;
        let key = CacheKey::new(EntityKind::Task, Some("u1"));
        assert!(!freshness.is_fresh(&key, Duration::from_secs(60)).await);

        freshness.mark_fetched(&key).await;
        assert!(freshness.is_fresh(&key, Duration::from_secs(60)).await);
        assert!(!freshness.is_fresh(&key, Duration::ZERO).await);

        freshness.invalidate(&key).await;
        assert!(!freshness.is_fresh(&key, Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn test_old_timestamp_is_stale() {
        let (freshness, store, _dir) = policy().await;
        let key = CacheKey::new(EntityKind::Teacher, None);
        let an_hour_ago = Utc::now().timestamp_millis() - 3_600_000;
        store.mark_fetched(&key.as_string(), an_hour_ago).await.unwrap();

        assert!(!freshness.is_fresh(&key, Duration::from_secs(1800)).await);
        freshness.refresh_kind(EntityKind::Teacher).await;
        assert!(freshness.is_fresh(&key, Duration::from_secs(1800)).await);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_never_fresh() {
        let freshness = CacheFreshness::new(LocalStore::unavailable());
        let key = CacheKey::new(EntityKind::Routine, None);
        freshness.mark_fetched(&key).await;
        assert!(!freshness.is_fresh(&key, Duration::from_secs(600)).await);
    }
}
