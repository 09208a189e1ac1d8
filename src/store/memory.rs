//! In-process cache store. The default backend; state lives and dies with
//! the worker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::cache::CacheStore;
use crate::errors::GatewayError;
use crate::models::cache::{CacheEntry, CacheStats};

#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, GatewayError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn upsert(&self, entry: CacheEntry) -> Result<CacheEntry, GatewayError> {
        // the shard lock held by `entry()` makes read-modify-write atomic per key
        let stored = match self.entries.entry(entry.cache_key.clone()) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                existing.signature = entry.signature;
                existing.response = entry.response;
                existing.status = entry.status;
                existing.expires_at = entry.expires_at;
                existing.is_active = true;
                existing.updated_at = entry.updated_at;
                existing.clone()
            }
            Entry::Vacant(slot) => slot.insert(entry).value().clone(),
        };
        Ok(stored)
    }

    async fn record_hit(&self, key: &str, at: DateTime<Utc>) -> Result<(), GatewayError> {
        if let Some(mut e) = self.entries.get_mut(key) {
            e.hit_count += 1;
            e.last_hit_at = Some(at);
        }
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, GatewayError> {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn stats(&self) -> Result<CacheStats, GatewayError> {
        let (mut total, mut active, mut hits) = (0i64, 0i64, 0i64);
        for e in self.entries.iter() {
            total += 1;
            if e.is_active {
                active += 1;
            }
            hits += e.hit_count;
        }
        Ok(CacheStats::new(total, active, hits))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &str, expires_at: Option<DateTime<Utc>>) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            cache_key: key.into(),
            signature: format!("sig-{}", key),
            response: json!({"k": key}),
            status: 200,
            hit_count: 0,
            last_hit_at: None,
            expires_at,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_per_key() {
        let store = MemoryStore::new();
        store.upsert(entry("a", None)).await.unwrap();
        store.record_hit("a", Utc::now()).await.unwrap();

        let mut again = entry("a", None);
        again.response = json!("replaced");
        again.is_active = false;
        let stored = store.upsert(again).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(stored.response, json!("replaced"));
        assert!(stored.is_active);
        assert_eq!(stored.hit_count, 1);
    }

    #[tokio::test]
    async fn test_stats_counts_hits_and_active() {
        let store = MemoryStore::new();
        store.upsert(entry("a", None)).await.unwrap();
        store.upsert(entry("b", None)).await.unwrap();
        for _ in 0..3 {
            store.record_hit("a", Utc::now()).await.unwrap();
        }
        if let Some(mut b) = store.entries.get_mut("b") {
            b.is_active = false;
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.active_entries, 1);
        assert_eq!(stats.total_hits, 3);
        assert_eq!(stats.average_hits_per_entry, 1.5);
    }

    #[tokio::test]
    async fn test_record_hit_on_missing_key_is_noop() {
        let store = MemoryStore::new();
        store.record_hit("ghost", Utc::now()).await.unwrap();
        assert!(store.is_empty());
    }
}
