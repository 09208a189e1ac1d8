//! Background job: sweep expired response-cache entries.
//!
//! Runs every `interval`. A failed sweep is logged and retried on the next
//! tick; nothing on the request path waits for it.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::cache::ResponseCache;

/// Spawn the background sweep task. Call this once at startup.
pub fn spawn(cache: ResponseCache, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // the first tick completes immediately; skip it so startup stays quiet
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_once(&cache).await;
        }
    })
}

async fn run_once(cache: &ResponseCache) -> u64 {
    match cache.sweep().await {
        Ok(0) => {
            tracing::debug!(backend = cache.backend(), "cache sweep: nothing expired");
            0
        }
        Ok(removed) => {
            tracing::info!(backend = cache.backend(), removed, "expired cache entries removed");
            removed
        }
        Err(e) => {
            tracing::error!("cache sweep failed: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::models::forward::ForwardedRequest;
    use crate::models::target::CacheScope;
    use crate::proxy::signature::RequestSignature;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn test_run_once_removes_only_expired() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        let cache = ResponseCache::new(Arc::new(MemoryStore::new()), clock.clone());

        let short = RequestSignature::from_request(
            &ForwardedRequest::new("kb", axum::http::Method::GET, "a"),
            CacheScope::Shared,
        );
        let forever = RequestSignature::from_request(
            &ForwardedRequest::new("kb", axum::http::Method::GET, "b"),
            CacheScope::Shared,
        );
        cache.store(&short, json!(1), 200, Some(Duration::from_secs(60))).await.unwrap();
        cache.store(&forever, json!(2), 200, None).await.unwrap();

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(run_once(&cache).await, 1);
        assert_eq!(run_once(&cache).await, 0);
        assert!(cache.lookup(&forever).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_job_sweeps_on_interval() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::new(store.clone(), clock.clone());
        let sig = RequestSignature::from_request(
            &ForwardedRequest::new("kb", axum::http::Method::GET, "a"),
            CacheScope::Shared,
        );
        cache.store(&sig, json!(1), 200, Some(Duration::from_secs(1))).await.unwrap();
        clock.advance(chrono::Duration::seconds(5));

        let handle = spawn(cache, Duration::from_secs(10));
        time::sleep(Duration::from_secs(11)).await;
        assert!(store.is_empty());
        handle.abort();
    }
}
