//! Shared state and the HTTP router.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api;
use crate::cache::{CacheStore, ResponseCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheBackend, Config};
use crate::middleware::audit::AuditLog;
use crate::middleware::identity::{IdentityProvider, JwtIdentityProvider};
use crate::middleware::metrics::{metrics_handler, GatewayMetrics};
use crate::proxy;
use crate::proxy::engine::ForwardingEngine;
use crate::proxy::registry::BackendRegistry;
use crate::store::memory::MemoryStore;
use crate::store::postgres::PgStore;
use crate::store::redis::RedisStore;

/// Inbound bodies above this size are rejected with 413.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: Config,
    pub engine: Arc<ForwardingEngine>,
    pub metrics: Arc<GatewayMetrics>,
    pub identity: Arc<dyn IdentityProvider>,
    /// Present when `DATABASE_URL` is configured.
    pub db: Option<PgStore>,
}

impl AppState {
    /// Connect the configured stores and build the engine.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let db = match &config.database_url {
            Some(url) => {
                tracing::info!("Connecting to database...");
                let db = PgStore::connect(url).await?;
                tracing::info!("Running migrations...");
                db.migrate().await?;
                Some(db)
            }
            None => None,
        };

        let store: Arc<dyn CacheStore> = match config.cache_backend {
            CacheBackend::Memory => Arc::new(MemoryStore::new()),
            CacheBackend::Postgres => Arc::new(
                db.clone()
                    .context("postgres cache backend selected without DATABASE_URL")?,
            ),
            CacheBackend::Redis => {
                tracing::info!("Connecting to Redis...");
                Arc::new(RedisStore::connect(&config.redis_url).await?)
            }
        };

        let identity = Arc::new(JwtIdentityProvider::hs256(
            config.jwt_secret.expose().as_bytes(),
        ));
        Self::assemble(config, store, Arc::new(SystemClock), identity, db)
    }

    /// Wire state from already-built parts.
    pub fn assemble(
        config: Config,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        identity: Arc<dyn IdentityProvider>,
        db: Option<PgStore>,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(GatewayMetrics::new());
        let registry = BackendRegistry::from_targets(
            config.targets.clone(),
            clock.clone(),
            config.token_safety_margin,
            metrics.clone(),
        )?;
        tracing::info!(
            targets = registry.len(),
            cache_backend = store.backend(),
            "backend registry ready"
        );

        let engine = ForwardingEngine::new(
            Arc::new(registry),
            ResponseCache::new(store, clock),
            metrics.clone(),
            AuditLog::new(db.clone()),
        );

        Ok(Self {
            config,
            engine: Arc::new(engine),
            metrics,
            identity,
            db,
        })
    }
}

/// The full HTTP surface: health, metrics, reverse proxy and the admin API.
pub fn router(state: Arc<AppState>) -> Router {
    let forward = get(proxy::handler::proxy_path)
        .post(proxy::handler::proxy_path)
        .put(proxy::handler::proxy_path)
        .patch(proxy::handler::proxy_path)
        .delete(proxy::handler::proxy_path);
    let forward_root = get(proxy::handler::proxy_root)
        .post(proxy::handler::proxy_root)
        .put(proxy::handler::proxy_root)
        .patch(proxy::handler::proxy_root)
        .delete(proxy::handler::proxy_root);

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler))
        .route("/proxy/status", get(proxy::handler::proxy_status))
        .route("/proxy/:target", forward_root)
        .route("/proxy/:target/*path", forward)
        .nest("/api/v1", api::api_router(state.clone()))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(axum::middleware::from_fn(security_headers_middleware))
}

fn cors_layer() -> CorsLayer {
    let allowed_origin = std::env::var("AUTHGATE_CORS_ORIGIN")
        .unwrap_or_else(|_| "http://localhost:3000".to_string());
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            origin_str == allowed_origin
                || origin_str.starts_with("http://localhost:")
                || origin_str.starts_with("http://127.0.0.1:")
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            HeaderName::from_static("content-type"),
            HeaderName::from_static("authorization"),
            HeaderName::from_static("cache-control"),
            HeaderName::from_static("x-admin-key"),
            HeaderName::from_static("x-request-id"),
        ])
        .allow_credentials(true)
}

/// Middleware: echoes the caller's X-Request-Id or mints one, so errors can
/// be correlated with gateway logs.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: hardening headers on every response.
async fn security_headers_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    // downstream cache directives win
    headers
        .entry(axum::http::header::CACHE_CONTROL)
        .or_insert(HeaderValue::from_static("no-store"));
    headers.remove(axum::http::header::SERVER);

    resp
}
