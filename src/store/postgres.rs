use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::cache::CacheStore;
use crate::errors::GatewayError;
use crate::models::audit::{ForwardRecord, UsageStats};
use crate::models::cache::{CacheEntry, CacheStats};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- Forward Log Operations --

    pub async fn insert_forward_log(&self, record: &ForwardRecord) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO forward_logs (
                id, created_at, target, method, path, query, caller_id, caller_role,
                response_status, outcome, processing_ms, cache_hit, cache_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.request_id)
        .bind(record.timestamp)
        .bind(&record.target)
        .bind(&record.method)
        .bind(&record.path)
        .bind(&record.query)
        .bind(&record.caller_id)
        .bind(&record.caller_role)
        .bind(record.status.map(|s| s as i16))
        .bind(record.outcome.label())
        .bind(record.processing_ms.min(i32::MAX as u64) as i32)
        .bind(record.cache_hit)
        .bind(&record.cache_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Request counts over the last `days`, optionally for one caller.
    pub async fn usage_stats(
        &self,
        days: i64,
        caller_id: Option<&str>,
    ) -> Result<UsageStats, GatewayError> {
        let since = Utc::now() - chrono::Duration::days(days);

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM forward_logs WHERE created_at >= $1 AND ($2::TEXT IS NULL OR caller_id = $2)",
        )
        .bind(since)
        .bind(caller_id)
        .fetch_one(&self.pool)
        .await?;

        let methods = sqlx::query_as::<_, (String, i64)>(
            r#"SELECT method, COUNT(*) FROM forward_logs
               WHERE created_at >= $1 AND ($2::TEXT IS NULL OR caller_id = $2)
               GROUP BY method"#,
        )
        .bind(since)
        .bind(caller_id)
        .fetch_all(&self.pool)
        .await?;

        let statuses = sqlx::query_as::<_, (Option<i16>, i64)>(
            r#"SELECT response_status, COUNT(*) FROM forward_logs
               WHERE created_at >= $1 AND ($2::TEXT IS NULL OR caller_id = $2)
               GROUP BY response_status"#,
        )
        .bind(since)
        .bind(caller_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(UsageStats {
            total_requests: total,
            period_days: days,
            method_breakdown: methods.into_iter().collect(),
            status_breakdown: statuses
                .into_iter()
                .map(|(s, n)| (s.map_or_else(|| "none".to_string(), |s| s.to_string()), n))
                .collect(),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CacheRow {
    cache_key: String,
    request_signature: String,
    cached_response: serde_json::Value,
    response_status: i32,
    hit_count: i64,
    last_hit_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CacheRow> for CacheEntry {
    fn from(row: CacheRow) -> Self {
        CacheEntry {
            cache_key: row.cache_key,
            signature: row.request_signature,
            response: row.cached_response,
            status: row.response_status.clamp(0, u16::MAX as i32) as u16,
            hit_count: row.hit_count,
            last_hit_at: row.last_hit_at,
            expires_at: row.expires_at,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const CACHE_COLUMNS: &str = "cache_key, request_signature, cached_response, response_status, \
     hit_count, last_hit_at, expires_at, is_active, created_at, updated_at";

#[async_trait]
impl CacheStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, GatewayError> {
        let row = sqlx::query_as::<_, CacheRow>(&format!(
            "SELECT {} FROM response_cache WHERE cache_key = $1",
            CACHE_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(CacheEntry::from))
    }

    async fn upsert(&self, entry: CacheEntry) -> Result<CacheEntry, GatewayError> {
        let row = sqlx::query_as::<_, CacheRow>(&format!(
            r#"
            INSERT INTO response_cache (
                cache_key, request_signature, cached_response, response_status,
                expires_at, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, TRUE, $6, $6)
            ON CONFLICT (cache_key) DO UPDATE SET
                request_signature = EXCLUDED.request_signature,
                cached_response = EXCLUDED.cached_response,
                response_status = EXCLUDED.response_status,
                expires_at = EXCLUDED.expires_at,
                is_active = TRUE,
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            CACHE_COLUMNS
        ))
        .bind(&entry.cache_key)
        .bind(&entry.signature)
        .bind(&entry.response)
        .bind(entry.status as i32)
        .bind(entry.expires_at)
        .bind(entry.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn record_hit(&self, key: &str, at: DateTime<Utc>) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE response_cache SET hit_count = hit_count + 1, last_hit_at = $2 WHERE cache_key = $1",
        )
        .bind(key)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, GatewayError> {
        let result = sqlx::query(
            "DELETE FROM response_cache WHERE expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<CacheStats, GatewayError> {
        let (total, active, hits) = sqlx::query_as::<_, (i64, i64, i64)>(
            r#"SELECT COUNT(*),
                      COUNT(*) FILTER (WHERE is_active),
                      COALESCE(SUM(hit_count), 0)::BIGINT
               FROM response_cache"#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(CacheStats::new(total, active, hits))
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
