//! Reverse-proxy surface: `/proxy/:target/*path` and `/proxy/status`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::errors::GatewayError;
use crate::middleware::identity::Caller;
use crate::models::forward::ForwardedRequest;
use crate::models::identity::CallerIdentity;
use crate::proxy::engine::CachePolicy;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ProxyStatus {
    pub enabled: bool,
    pub targets: Vec<TargetStatus>,
}

#[derive(Debug, Serialize)]
pub struct TargetStatus {
    pub name: String,
    pub target_url: String,
    pub target_path_prefix: String,
    pub timeout: f64,
    pub connect_timeout: f64,
    pub authenticated: bool,
    pub cache_ttl_secs: Option<u64>,
    /// When the current token stops being handed out, if one is held.
    pub token_refresh_at: Option<chrono::DateTime<chrono::Utc>>,
    pub available_connections: usize,
}

/// `GET /proxy/status`. Public; never includes credentials.
pub async fn proxy_status(State(state): State<Arc<AppState>>) -> Json<ProxyStatus> {
    let registry = state.engine.registry();
    let mut targets = Vec::with_capacity(registry.len());
    for target in registry.targets() {
        let Ok(client) = registry.get(&target.name) else {
            continue;
        };
        targets.push(TargetStatus {
            name: target.name.clone(),
            target_url: target.base_url.clone(),
            target_path_prefix: target.path_prefix.clone(),
            timeout: target.timeout.as_secs_f64(),
            connect_timeout: target.connect_timeout.as_secs_f64(),
            authenticated: target.auth.requires_token(),
            cache_ttl_secs: target.cache_ttl.map(|t| t.as_secs()),
            token_refresh_at: client.tokens.lease().map(|l| l.refresh_at),
            available_connections: client.available_slots(),
        });
    }
    Json(ProxyStatus {
        enabled: !targets.is_empty(),
        targets,
    })
}

/// `/proxy/:target/*path`
pub async fn proxy_path(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path((target, path)): Path<(String, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    forward(&state, caller, target, path, method, query, headers, body).await
}

/// `/proxy/:target`, the target's prefix root.
pub async fn proxy_root(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(target): Path<String>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    forward(&state, caller, target, String::new(), method, query, headers, body).await
}

#[allow(clippy::too_many_arguments)]
async fn forward(
    state: &AppState,
    caller: CallerIdentity,
    target: String,
    path: String,
    method: Method,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let engine = &state.engine;
    let policy = CachePolicy::for_target(&engine.registry().get(&target)?.target);
    let skip_cache = should_skip_cache(&headers);

    let req = ForwardedRequest::new(target, method, path)
        .query(query.unwrap_or_default())
        .headers(headers)
        .body(body)
        .caller(caller);

    let resp = match policy {
        Some(policy) if !skip_cache => engine.forward_cached(&req, &policy).await?,
        _ => engine.forward(&req).await?,
    };
    Ok(resp.into_response())
}

/// Caller opted out of cached answers.
pub fn should_skip_cache(headers: &HeaderMap) -> bool {
    if headers
        .get("x-authgate-no-cache")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
    {
        return true;
    }

    headers
        .get_all(axum::http::header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|cc| {
            let lower = cc.to_ascii_lowercase();
            lower.contains("no-cache") || lower.contains("no-store")
        })
}
