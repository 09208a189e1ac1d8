use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use subtle::ConstantTimeEq;

use crate::AppState;

pub mod handlers;

/// Build the admin API router.
/// All routes are relative; the caller mounts this under `/api/v1`.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/cache/stats", get(handlers::get_cache_stats))
        .route("/cache/sweep", post(handlers::sweep_cache))
        .route("/targets", get(handlers::list_targets))
        .route("/targets/:name/invalidate", post(handlers::invalidate_target))
        .route("/targets/:name/probe", post(handlers::probe_target))
        .route("/usage", get(handlers::get_usage_stats))
        .layer(middleware::from_fn_with_state(state, admin_auth))
        .fallback(fallback_404)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Middleware: validates `X-Admin-Key` against the configured admin key.
/// Returns 401 if missing/invalid, 503 when no admin key is configured.
async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.config.admin_key.as_ref() else {
        tracing::error!("AUTHGATE_ADMIN_KEY is not set; admin API disabled");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let provided_key = req
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok());

    match provided_key {
        Some(k) if bool::from(k.as_bytes().ct_eq(expected.expose().as_bytes())) => {
            Ok(next.run(req).await)
        }
        Some(k) => {
            tracing::warn!(
                "admin API: invalid key (provided: '{}')",
                crate::proxy::token::mask(k)
            );
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("admin API: missing X-Admin-Key header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}
