//! Redis-backed cache store, shared by every gateway instance pointed at
//! the same Redis.
//!
//! Layout: one hash per entry under `{prefix}:entry:{key}`, a set of all
//! keys under `{prefix}:keys`, and a sorted set `{prefix}:expiry` scoring
//! expiring keys by their expiry in epoch milliseconds.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::cache::CacheStore;
use crate::errors::GatewayError;
use crate::models::cache::{CacheEntry, CacheStats};

const DEFAULT_PREFIX: &str = "authgate:cache";

/// Insert-or-overwrite in one round trip. Hit count and creation time of an
/// existing entry survive.
const UPSERT_SCRIPT: &str = r#"
local entry = KEYS[1]
if redis.call("EXISTS", entry) == 0 then
    redis.call("HSET", entry, "hit_count", 0, "last_hit_at", "", "created_at", ARGV[6])
end
redis.call("HSET", entry,
    "signature", ARGV[1],
    "response", ARGV[2],
    "status", ARGV[3],
    "expires_at", ARGV[4],
    "is_active", "1",
    "updated_at", ARGV[5])
redis.call("SADD", KEYS[2], ARGV[7])
if ARGV[4] == "" then
    redis.call("ZREM", KEYS[3], ARGV[7])
else
    redis.call("ZADD", KEYS[3], ARGV[4], ARGV[7])
end
return redis.call("HGETALL", entry)
"#;

const HIT_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    redis.call("HINCRBY", KEYS[1], "hit_count", 1)
    redis.call("HSET", KEYS[1], "last_hit_at", ARGV[1])
end
return 0
"#;

/// Range read and deletes run as one script, so an upsert cannot refresh a
/// key between them. Returns the number of entries removed.
const SWEEP_SCRIPT: &str = r#"
local expired = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
for _, key in ipairs(expired) do
    redis.call("DEL", ARGV[2] .. key)
    redis.call("ZREM", KEYS[1], key)
    redis.call("SREM", KEYS[2], key)
end
return #expired
"#;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn entry_key(&self, key: &str) -> String {
        Self::entry_key_for(&self.prefix, key)
    }

    fn entry_key_for(prefix: &str, key: &str) -> String {
        format!("{}:entry:{}", prefix, key)
    }

    fn keys_set(&self) -> String {
        format!("{}:keys", self.prefix)
    }

    fn expiry_index(&self) -> String {
        format!("{}:expiry", self.prefix)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, GatewayError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.entry_key(key)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_entry(key, &fields).map(Some)
    }

    async fn upsert(&self, entry: CacheEntry) -> Result<CacheEntry, GatewayError> {
        let mut conn = self.conn.clone();
        let response = serde_json::to_string(&entry.response)
            .map_err(|e| GatewayError::Cache(format!("failed to encode cached response: {}", e)))?;
        let expires_at = entry
            .expires_at
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_default();

        let fields: HashMap<String, String> = redis::Script::new(UPSERT_SCRIPT)
            .key(self.entry_key(&entry.cache_key))
            .key(self.keys_set())
            .key(self.expiry_index())
            .arg(&entry.signature)
            .arg(response)
            .arg(entry.status)
            .arg(expires_at)
            .arg(entry.updated_at.timestamp_millis())
            .arg(entry.created_at.timestamp_millis())
            .arg(&entry.cache_key)
            .invoke_async(&mut conn)
            .await?;

        decode_entry(&entry.cache_key, &fields)
    }

    async fn record_hit(&self, key: &str, at: DateTime<Utc>) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(HIT_SCRIPT)
            .key(self.entry_key(key))
            .arg(at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, GatewayError> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::Script::new(SWEEP_SCRIPT)
            .key(self.expiry_index())
            .key(self.keys_set())
            .arg(now.timestamp_millis())
            .arg(self.entry_key(""))
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats, GatewayError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.smembers(self.keys_set()).await?;
        if keys.is_empty() {
            return Ok(CacheStats::new(0, 0, 0));
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hget(self.entry_key(key), &["is_active", "hit_count"]);
        }
        let rows: Vec<(Option<String>, Option<String>)> = pipe.query_async(&mut conn).await?;

        let (mut total, mut active, mut hits) = (0i64, 0i64, 0i64);
        for (is_active, hit_count) in rows {
            // index may briefly outlive an entry deleted by another sweep
            let Some(is_active) = is_active else { continue };
            total += 1;
            if is_active == "1" {
                active += 1;
            }
            hits += hit_count.and_then(|h| h.parse::<i64>().ok()).unwrap_or(0);
        }
        Ok(CacheStats::new(total, active, hits))
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

fn decode_entry(key: &str, fields: &HashMap<String, String>) -> Result<CacheEntry, GatewayError> {
    let field = |name: &str| fields.get(name).map(String::as_str).unwrap_or("");
    let corrupt = |name: &str| GatewayError::Cache(format!("cache entry {} has a bad '{}' field", key, name));

    let response = serde_json::from_str(field("response")).map_err(|_| corrupt("response"))?;
    let status = field("status").parse::<u16>().map_err(|_| corrupt("status"))?;
    let created_at = millis(field("created_at")).ok_or_else(|| corrupt("created_at"))?;
    let updated_at = millis(field("updated_at")).unwrap_or(created_at);

    Ok(CacheEntry {
        cache_key: key.to_string(),
        signature: field("signature").to_string(),
        response,
        status,
        hit_count: field("hit_count").parse().unwrap_or(0),
        last_hit_at: millis(field("last_hit_at")),
        expires_at: millis(field("expires_at")),
        is_active: field("is_active") == "1",
        created_at,
        updated_at,
    })
}

/// Empty string means "not set".
fn millis(raw: &str) -> Option<DateTime<Utc>> {
    let ms = raw.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(ms).single()
}
