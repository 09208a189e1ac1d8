use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::errors::GatewayError;
use crate::models::cache::{CacheEntry, CacheStats};
use crate::proxy::signature::RequestSignature;

/// Storage behind the response cache. Implementations must make `upsert`
/// atomic per key; nothing above them takes a lock.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Point lookup, regardless of expiry or active flag.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, GatewayError>;

    /// Insert, or overwrite payload/status/expiry and reactivate. Hit
    /// accounting of an existing entry is kept. Returns the stored row.
    async fn upsert(&self, entry: CacheEntry) -> Result<CacheEntry, GatewayError>;

    /// Best-effort hit accounting.
    async fn record_hit(&self, key: &str, at: DateTime<Utc>) -> Result<(), GatewayError>;

    /// Permanently remove every entry whose expiry is at or before `now`.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, GatewayError>;

    async fn stats(&self) -> Result<CacheStats, GatewayError>;

    fn backend(&self) -> &'static str;
}

/// Content-addressed response cache. Keys come from `RequestSignature`;
/// expiry is judged against the injected clock.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// A hit only while the entry is active and unexpired. Counts the hit.
    pub async fn lookup(
        &self,
        signature: &RequestSignature,
    ) -> Result<Option<CacheEntry>, GatewayError> {
        let now = self.clock.now();
        let Some(mut entry) = self.store.get(signature.key()).await? else {
            return Ok(None);
        };
        if !entry.is_servable(now) {
            tracing::debug!(cache_key = %signature.key(), "cache entry present but not servable");
            return Ok(None);
        }

        if let Err(e) = self.store.record_hit(signature.key(), now).await {
            tracing::warn!(cache_key = %signature.key(), "failed to record cache hit: {}", e);
        } else {
            entry.hit_count += 1;
            entry.last_hit_at = Some(now);
        }
        Ok(Some(entry))
    }

    /// `ttl = None` stores an entry that never expires.
    pub async fn store(
        &self,
        signature: &RequestSignature,
        response: serde_json::Value,
        status: u16,
        ttl: Option<Duration>,
    ) -> Result<CacheEntry, GatewayError> {
        let now = self.clock.now();
        let expires_at = match ttl {
            Some(ttl) => Some(
                now + chrono::Duration::from_std(ttl)
                    .map_err(|e| GatewayError::Cache(format!("invalid ttl: {}", e)))?,
            ),
            None => None,
        };

        let entry = CacheEntry {
            cache_key: signature.key().to_string(),
            signature: signature.canonical().to_string(),
            response,
            status,
            hit_count: 0,
            last_hit_at: None,
            expires_at,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        let stored = self.store.upsert(entry).await?;
        tracing::debug!(cache_key = %stored.cache_key, expires_at = ?stored.expires_at, "cache entry stored");
        Ok(stored)
    }

    pub async fn sweep(&self) -> Result<u64, GatewayError> {
        let removed = self.store.delete_expired(self.clock.now()).await?;
        if removed > 0 {
            tracing::info!(removed, backend = self.store.backend(), "swept expired cache entries");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats, GatewayError> {
        self.store.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::forward::ForwardedRequest;
    use crate::models::target::CacheScope;
    use crate::store::memory::MemoryStore;
    use axum::http::Method;
    use serde_json::json;

    fn setup() -> (ResponseCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = ResponseCache::new(Arc::new(MemoryStore::new()), clock.clone());
        (cache, clock)
    }

    fn sig(path: &str) -> RequestSignature {
        RequestSignature::from_request(
            &ForwardedRequest::new("kb", Method::GET, path),
            CacheScope::Shared,
        )
    }

    #[tokio::test]
    async fn test_lookup_counts_hits() {
        let (cache, _) = setup();
        let s = sig("/a");
        assert!(cache.lookup(&s).await.unwrap().is_none());

        cache.store(&s, json!({"x": 1}), 200, Some(Duration::from_secs(60))).await.unwrap();
        let first = cache.lookup(&s).await.unwrap().unwrap();
        let second = cache.lookup(&s).await.unwrap().unwrap();
        assert_eq!(first.hit_count, 1);
        assert_eq!(second.hit_count, 2);
        assert_eq!(second.response, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_expired_entry_is_never_served() {
        let (cache, clock) = setup();
        let s = sig("/a");
        cache.store(&s, json!(1), 200, Some(Duration::from_secs(60))).await.unwrap();

        clock.advance(chrono::Duration::seconds(59));
        assert!(cache.lookup(&s).await.unwrap().is_some());
        clock.advance(chrono::Duration::seconds(1));
        assert!(cache.lookup(&s).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (cache, clock) = setup();
        cache.store(&sig("/short"), json!(1), 200, Some(Duration::from_secs(10))).await.unwrap();
        cache.store(&sig("/long"), json!(2), 200, Some(Duration::from_secs(1000))).await.unwrap();
        cache.store(&sig("/forever"), json!(3), 200, None).await.unwrap();

        clock.advance(chrono::Duration::seconds(11));
        assert_eq!(cache.sweep().await.unwrap(), 1);
        assert_eq!(cache.stats().await.unwrap().total_entries, 2);

        clock.advance(chrono::Duration::days(365));
        assert_eq!(cache.sweep().await.unwrap(), 1);
        assert!(cache.lookup(&sig("/forever")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_overwrites_and_reactivates() {
        let (cache, clock) = setup();
        let s = sig("/a");
        cache.store(&s, json!("old"), 200, Some(Duration::from_secs(5))).await.unwrap();
        cache.lookup(&s).await.unwrap();

        clock.advance(chrono::Duration::seconds(10));
        assert!(cache.lookup(&s).await.unwrap().is_none());

        let stored = cache.store(&s, json!("new"), 200, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(stored.hit_count, 1);
        let hit = cache.lookup(&s).await.unwrap().unwrap();
        assert_eq!(hit.response, json!("new"));
        assert_eq!(cache.stats().await.unwrap().total_entries, 1);
    }
}
