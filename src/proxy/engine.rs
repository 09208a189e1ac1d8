//! The forwarding engine: one generic client for every backend target.
//!
//! A call resolves its target in the registry, attaches the target's bearer
//! token, rebuilds headers, dispatches through the target's pool, and maps
//! the outcome exactly once. A downstream 401 drops the rejected token and
//! replays the request while the retry budget lasts; nothing else retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap, Method, StatusCode};
use bytes::Bytes;
use serde::Serialize;

use crate::cache::ResponseCache;
use crate::errors::GatewayError;
use crate::middleware::audit::AuditLog;
use crate::middleware::metrics::GatewayMetrics;
use crate::models::audit::{ForwardOutcome, ForwardRecord};
use crate::models::forward::{DownstreamResponse, ForwardedRequest, ResponseBody};
use crate::models::target::{BackendTarget, CacheScope};
use crate::proxy::headers;
use crate::proxy::registry::{BackendClient, BackendRegistry};
use crate::proxy::signature::RequestSignature;
use crate::proxy::upstream;

/// Bytes of an unparseable JSON body kept in the log line.
const BODY_PREVIEW_BYTES: usize = 512;

/// How a cache-enabled call may use the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// `None` stores entries that never expire.
    pub ttl: Option<Duration>,
    pub scope: CacheScope,
}

impl CachePolicy {
    pub fn new(ttl: Option<Duration>, scope: CacheScope) -> Self {
        Self { ttl, scope }
    }

    /// The target's configured policy, if it caches at all.
    pub fn for_target(target: &BackendTarget) -> Option<Self> {
        target.cache_ttl.map(|ttl| Self::new(Some(ttl), target.cache_scope))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub target: String,
    pub status: u16,
    pub latency_ms: u64,
    pub authenticated: bool,
}

/// What came back on the wire, before classification.
struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

pub struct ForwardingEngine {
    registry: Arc<BackendRegistry>,
    cache: ResponseCache,
    metrics: Arc<GatewayMetrics>,
    audit: AuditLog,
}

impl ForwardingEngine {
    pub fn new(
        registry: Arc<BackendRegistry>,
        cache: ResponseCache,
        metrics: Arc<GatewayMetrics>,
        audit: AuditLog,
    ) -> Self {
        Self {
            registry,
            cache,
            metrics,
            audit,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Forward one call. Any downstream status comes back as `Ok`; `Err` is
    /// reserved for failures the gateway itself has to report.
    pub async fn forward(&self, req: &ForwardedRequest) -> Result<DownstreamResponse, GatewayError> {
        let started = Instant::now();
        let result = self.dispatch(req).await;
        self.finish(req, &result, started, None);
        result
    }

    /// Read-through variant: GETs are answered from the cache when possible,
    /// and successful JSON answers are stored. Other methods go straight
    /// through `forward`.
    pub async fn forward_cached(
        &self,
        req: &ForwardedRequest,
        policy: &CachePolicy,
    ) -> Result<DownstreamResponse, GatewayError> {
        if req.method != Method::GET {
            return self.forward(req).await;
        }

        let started = Instant::now();
        let signature = RequestSignature::from_request(req, policy.scope);

        match self.cache.lookup(&signature).await {
            Ok(Some(entry)) => {
                self.metrics.record_cache_lookup(true);
                let response = DownstreamResponse {
                    status: StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
                    headers: HeaderMap::new(),
                    body: ResponseBody::Json(entry.response),
                    cache_hit: Some(true),
                };
                let result = Ok(response);
                self.finish(req, &result, started, Some(&signature));
                return result;
            }
            Ok(None) => self.metrics.record_cache_lookup(false),
            // a broken cache degrades to an uncached call
            Err(e) => {
                self.metrics.record_cache_lookup(false);
                tracing::warn!(cache_key = %signature.key(), "cache lookup failed: {}", e);
            }
        }

        let mut result = self.dispatch(req).await;
        if let Ok(resp) = result.as_mut() {
            resp.cache_hit = Some(false);
            if resp.is_success() {
                if let ResponseBody::Json(value) = &resp.body {
                    if let Err(e) = self
                        .cache
                        .store(&signature, value.clone(), resp.status.as_u16(), policy.ttl)
                        .await
                    {
                        tracing::warn!(cache_key = %signature.key(), "cache store failed: {}", e);
                    }
                }
            }
        }
        self.finish(req, &result, started, Some(&signature));
        result
    }

    /// One authenticated GET against the target root.
    pub async fn probe(&self, target: &str) -> Result<ProbeReport, GatewayError> {
        let client = self.registry.get(target)?;
        let started = Instant::now();
        let req = ForwardedRequest::new(target, Method::GET, "");
        let resp = self.forward(&req).await?;
        Ok(ProbeReport {
            target: target.to_string(),
            status: resp.status.as_u16(),
            latency_ms: started.elapsed().as_millis() as u64,
            authenticated: client.target.auth.requires_token(),
        })
    }

    async fn dispatch(&self, req: &ForwardedRequest) -> Result<DownstreamResponse, GatewayError> {
        let client = self.registry.get(&req.target)?;
        let mut budget = req.retry_budget;

        loop {
            let token = client.tokens.get_valid_token().await?;
            let raw = self.send(&client, req, token.as_deref()).await?;

            if raw.status == StatusCode::UNAUTHORIZED {
                if let Some(rejected) = token.as_deref() {
                    if budget > 0 {
                        budget -= 1;
                        client.tokens.invalidate_if(rejected);
                        tracing::warn!(
                            backend = %client.target.name,
                            path = %req.path,
                            "downstream rejected token, re-authenticating"
                        );
                        continue;
                    }
                }
            }

            return classify_response(&client.target.name, raw);
        }
    }

    async fn send(
        &self,
        client: &BackendClient,
        req: &ForwardedRequest,
        token: Option<&str>,
    ) -> Result<RawResponse, GatewayError> {
        let target = &client.target;
        let mut url = target.url_for(&req.path);
        if let Some(q) = req.query.as_deref() {
            url.push('?');
            url.push_str(q);
        }
        let outbound = headers::outbound(target, &req.headers, req.caller.as_ref(), token);

        let _slot = client.acquire_slot().await?;
        tracing::debug!(backend = %target.name, method = %req.method, url = %url, "dispatching");

        let resp = client
            .http
            .request(req.method.clone(), &url)
            .headers(outbound)
            .body(req.body.clone())
            .send()
            .await
            .map_err(|e| upstream::classify(&target.name, &e))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|e| upstream::classify(&target.name, &e))?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    fn finish(
        &self,
        req: &ForwardedRequest,
        result: &Result<DownstreamResponse, GatewayError>,
        started: Instant,
        signature: Option<&RequestSignature>,
    ) {
        let elapsed = started.elapsed();
        let (status, outcome, cache_hit) = match result {
            Ok(resp) if resp.cache_hit == Some(true) => {
                (Some(resp.status.as_u16()), ForwardOutcome::Cached, true)
            }
            Ok(resp) => (Some(resp.status.as_u16()), ForwardOutcome::Relayed, false),
            Err(e) => (None, ForwardOutcome::Failed(e.kind().to_string()), false),
        };

        let status_label = status.map_or_else(|| outcome.label().to_string(), |s| s.to_string());
        self.metrics
            .record_forward(&req.target, &status_label, elapsed.as_secs_f64());

        self.audit.record(ForwardRecord {
            request_id: uuid::Uuid::new_v4(),
            target: req.target.clone(),
            method: req.method.to_string(),
            path: req.path.clone(),
            query: req.query.clone(),
            caller_id: req.caller.as_ref().map(|c| c.id.clone()),
            caller_role: req.caller.as_ref().map(|c| c.role.clone()),
            status,
            outcome,
            processing_ms: elapsed.as_millis() as u64,
            cache_hit,
            cache_key: signature.map(|s| s.key().to_string()),
            timestamp: chrono::Utc::now(),
        });
    }
}

/// Map a wire response to what the caller sees. JSON is parsed so it can be
/// re-serialized; everything else is relayed as opaque bytes. A 2xx that
/// claims JSON but does not parse is the gateway's problem; a non-2xx one
/// is relayed untouched.
fn classify_response(target: &str, raw: RawResponse) -> Result<DownstreamResponse, GatewayError> {
    let content_type = raw
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mut headers = headers::response(&raw.headers);
    headers.remove(header::CONTENT_TYPE);

    let is_json = content_type.as_deref().map_or(false, is_json_type);

    let body = if is_json && raw.body.is_empty() {
        ResponseBody::Json(serde_json::Value::Null)
    } else if is_json {
        match serde_json::from_slice(&raw.body) {
            Ok(value) => ResponseBody::Json(value),
            Err(e) if raw.status.is_success() => {
                let preview = &raw.body[..raw.body.len().min(BODY_PREVIEW_BYTES)];
                tracing::error!(
                    backend = %target,
                    status = raw.status.as_u16(),
                    body = %String::from_utf8_lossy(preview),
                    "downstream sent malformed JSON: {}",
                    e
                );
                return Err(GatewayError::Serialization {
                    target: target.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => ResponseBody::Raw {
                content_type: content_type.unwrap_or_default(),
                bytes: raw.body,
            },
        }
    } else {
        ResponseBody::Raw {
            content_type: content_type.unwrap_or_else(|| {
                if raw.body.is_empty() {
                    String::new()
                } else {
                    "application/octet-stream".to_string()
                }
            }),
            bytes: raw.body,
        }
    };

    Ok(DownstreamResponse {
        status: raw.status,
        headers,
        body,
        cache_hit: None,
    })
}

fn is_json_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}
