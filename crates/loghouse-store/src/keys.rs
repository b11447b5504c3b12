//! Project Key Cache
//!
//! API-key lookups sit on the ingest hot path, so resolutions are cached by
//! key value. The cache is explicit injected state owned by the server's
//! app state - not a module-level map - and anything that rotates keys or
//! edits referrer lists is expected to hold a handle and call
//! [`ProjectKeyCache::invalidate`] (or [`ProjectKeyCache::clear`]).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::types::ProjectKeyInfo;
use crate::EventStore;

pub struct ProjectKeyCache {
    store: Arc<dyn EventStore>,
    cache: RwLock<HashMap<String, ProjectKeyInfo>>,
}

impl ProjectKeyCache {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve an API key, consulting the store on a miss.
    ///
    /// Unknown keys are not negatively cached: a key created moments ago
    /// must work on the next request without an invalidation.
    pub async fn lookup(&self, api_key: &str) -> Result<Option<ProjectKeyInfo>> {
        if let Some(info) = self.cache.read().await.get(api_key) {
            return Ok(Some(info.clone()));
        }

        let info = self.store.find_project_key(api_key).await?;
        if let Some(ref info) = info {
            self.cache
                .write()
                .await
                .insert(api_key.to_string(), info.clone());
        }
        Ok(info)
    }

    /// Drop one cached key (key rotation, referrer list edit).
    pub async fn invalidate(&self, api_key: &str) {
        self.cache.write().await.remove(api_key);
    }

    /// Drop every cached entry for a project (project deletion).
    pub async fn invalidate_project(&self, project_id: &str) {
        self.cache
            .write()
            .await
            .retain(|_, info| info.project_id != project_id);
    }

    /// Drop everything.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use loghouse_core::{EventRow, GroupDelta, LogRow, Source};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::types::Table;

    #[derive(Default)]
    struct KeyStore {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl EventStore for KeyStore {
        async fn insert_logs(&self, _rows: &[LogRow]) -> Result<()> {
            Ok(())
        }
        async fn insert_events(&self, _rows: &[EventRow]) -> Result<()> {
            Ok(())
        }
        async fn upsert_groups(&self, _deltas: &[GroupDelta]) -> Result<()> {
            Ok(())
        }
        async fn find_project_key(&self, api_key: &str) -> Result<Option<ProjectKeyInfo>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(match api_key {
                "sk-live" => Some(ProjectKeyInfo {
                    project_id: "p1".into(),
                    kind: Source::Server,
                    allowed_referrers: vec![],
                }),
                _ => None,
            })
        }
        async fn project_exists(&self, _project_id: &str) -> Result<bool> {
            Ok(true)
        }
        async fn delete_rows_older_than(&self, _t: Table, _c: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
        async fn delete_oldest_rows(&self, _t: Table, _l: i64) -> Result<u64> {
            Ok(0)
        }
        async fn database_size_bytes(&self) -> Result<i64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn hits_are_served_from_cache() {
        let store = Arc::new(KeyStore::default());
        let cache = ProjectKeyCache::new(store.clone());

        assert!(cache.lookup("sk-live").await.unwrap().is_some());
        assert!(cache.lookup("sk-live").await.unwrap().is_some());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_keys_are_not_negatively_cached() {
        let store = Arc::new(KeyStore::default());
        let cache = ProjectKeyCache::new(store.clone());

        assert!(cache.lookup("sk-missing").await.unwrap().is_none());
        assert!(cache.lookup("sk-missing").await.unwrap().is_none());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidation_forces_a_fresh_lookup() {
        let store = Arc::new(KeyStore::default());
        let cache = ProjectKeyCache::new(store.clone());

        cache.lookup("sk-live").await.unwrap();
        cache.invalidate("sk-live").await;
        cache.lookup("sk-live").await.unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn project_invalidation_sweeps_all_its_keys() {
        let store = Arc::new(KeyStore::default());
        let cache = ProjectKeyCache::new(store.clone());

        cache.lookup("sk-live").await.unwrap();
        cache.invalidate_project("p1").await;
        cache.lookup("sk-live").await.unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }
}
