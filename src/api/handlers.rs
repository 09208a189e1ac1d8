use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::GatewayError;
use crate::models::audit::UsageStats;
use crate::models::cache::CacheStats;
use crate::models::target::{AuthScheme, CacheScope, PaginationStyle};
use crate::proxy::engine::ProbeReport;
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Serialize)]
pub struct CacheStatsResponse {
    pub backend: &'static str,
    #[serde(flatten)]
    pub stats: CacheStats,
}

#[derive(Serialize)]
pub struct TargetSummary {
    pub name: String,
    pub base_url: String,
    pub path_prefix: String,
    /// `none` or `password_grant`.
    pub auth: &'static str,
    pub pagination: PaginationStyle,
    pub cache_scope: CacheScope,
    pub cache_ttl_secs: Option<u64>,
    pub max_connections: usize,
    pub holds_token: bool,
    pub token_expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Deserialize)]
pub struct UsageQuery {
    #[serde(default = "default_usage_days")]
    pub days: i64,
    pub caller_id: Option<String>,
}

fn default_usage_days() -> i64 {
    30
}

// ── Cache ────────────────────────────────────────────────────

/// GET /api/v1/cache/stats
pub async fn get_cache_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CacheStatsResponse>, GatewayError> {
    let cache = state.engine.cache();
    let stats = cache.stats().await?;
    Ok(Json(CacheStatsResponse {
        backend: cache.backend(),
        stats,
    }))
}

/// POST /api/v1/cache/sweep: remove expired entries now
pub async fn sweep_cache(State(state): State<Arc<AppState>>) -> Result<Json<Value>, GatewayError> {
    let removed = state.engine.cache().sweep().await?;
    tracing::info!(removed, "manual cache sweep");
    Ok(Json(json!({ "removed": removed })))
}

// ── Targets ──────────────────────────────────────────────────

/// GET /api/v1/targets
pub async fn list_targets(State(state): State<Arc<AppState>>) -> Json<Vec<TargetSummary>> {
    let registry = state.engine.registry();
    let summaries = registry
        .targets()
        .map(|t| {
            let lease = registry.get(&t.name).ok().and_then(|c| c.tokens.lease());
            TargetSummary {
                name: t.name.clone(),
                base_url: t.base_url.clone(),
                path_prefix: t.path_prefix.clone(),
                auth: match t.auth {
                    AuthScheme::None => "none",
                    AuthScheme::PasswordGrant { .. } => "password_grant",
                },
                pagination: t.pagination,
                cache_scope: t.cache_scope,
                cache_ttl_secs: t.cache_ttl.map(|d| d.as_secs()),
                max_connections: t.max_connections,
                holds_token: lease.is_some(),
                token_expires_at: lease.map(|l| l.expires_at),
            }
        })
        .collect();
    Json(summaries)
}

/// POST /api/v1/targets/:name/invalidate: drop the held token
pub async fn invalidate_target(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, GatewayError> {
    let client = state.engine.registry().get(&name)?;
    client.tokens.invalidate();
    tracing::info!(backend = %name, "token lease invalidated by admin");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/targets/:name/probe
pub async fn probe_target(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ProbeReport>, GatewayError> {
    let report = state.engine.probe(&name).await?;
    Ok(Json(report))
}

// ── Usage ────────────────────────────────────────────────────

/// GET /api/v1/usage: forward counts from the persisted log
pub async fn get_usage_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UsageQuery>,
) -> Result<Json<UsageStats>, StatusCode> {
    let db = state.db.as_ref().ok_or_else(|| {
        tracing::warn!("usage stats requested but no database is configured");
        StatusCode::NOT_IMPLEMENTED
    })?;
    if !(1..=366).contains(&params.days) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let stats = db
        .usage_stats(params.days, params.caller_id.as_deref())
        .await
        .map_err(|e| {
            tracing::error!("usage_stats failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(stats))
}
