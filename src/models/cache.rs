use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One cached downstream response, keyed by the hash of its request signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    /// The canonical signature the key was derived from (kept for debugging).
    pub signature: String,
    pub response: serde_json::Value,
    pub status: u16,
    pub hit_count: i64,
    pub last_hit_at: Option<DateTime<Utc>>,
    /// `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether a lookup at `now` may return this entry.
    pub fn is_servable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |exp| exp > now)
    }

    /// Whether a sweep at `now` must remove this entry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |exp| exp <= now)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: i64,
    pub active_entries: i64,
    pub total_hits: i64,
    pub average_hits_per_entry: f64,
}

impl CacheStats {
    pub fn new(total_entries: i64, active_entries: i64, total_hits: i64) -> Self {
        let avg = total_hits as f64 / total_entries.max(1) as f64;
        Self {
            total_entries,
            active_entries,
            total_hits,
            average_hits_per_entry: (avg * 100.0).round() / 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(expires_at: Option<DateTime<Utc>>, active: bool) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            cache_key: "k".into(),
            signature: "{}".into(),
            response: serde_json::json!({}),
            status: 200,
            hit_count: 0,
            last_hit_at: None,
            expires_at,
            is_active: active,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_past_expiry_not_servable_even_when_active() {
        let now = Utc::now();
        let e = entry(Some(now - Duration::seconds(1)), true);
        assert!(!e.is_servable(now));
        assert!(e.is_expired(now));
    }

    #[test]
    fn test_never_expiring_entry() {
        let now = Utc::now();
        let e = entry(None, true);
        assert!(e.is_servable(now));
        assert!(!e.is_expired(now + Duration::days(3650)));
        assert!(!entry(None, false).is_servable(now));
    }

    #[test]
    fn test_stats_average_rounds_to_two_places() {
        let s = CacheStats::new(3, 2, 10);
        assert_eq!(s.average_hits_per_entry, 3.33);
        assert_eq!(CacheStats::new(0, 0, 0).average_hits_per_entry, 0.0);
    }
}
