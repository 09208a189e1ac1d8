use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown backend target '{0}'")]
    UnknownTarget(String),

    #[error("missing or invalid caller identity")]
    Unauthenticated,

    #[error("authentication against '{target}' failed: {reason}")]
    AuthenticationFailure { target: String, reason: String },

    #[error("downstream '{target}' timed out")]
    DownstreamTimeout { target: String },

    #[error("downstream '{target}' unreachable: {reason}")]
    DownstreamUnreachable { target: String, reason: String },

    #[error("downstream transport error: {0}")]
    Transport(String),

    /// A non-2xx downstream answer, handed back to the caller untouched.
    #[error("downstream returned {status}")]
    Downstream {
        status: StatusCode,
        content_type: Option<String>,
        body: Bytes,
    },

    #[error("downstream '{target}' sent an unparseable JSON body: {reason}")]
    Serialization { target: String, reason: String },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// The HTTP status this error is surfaced with.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::UnknownTarget(_) => StatusCode::NOT_FOUND,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::AuthenticationFailure { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::DownstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::DownstreamUnreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Downstream { status, .. } => *status,
            GatewayError::Serialization { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Cache(_)
            | GatewayError::Database(_)
            | GatewayError::Redis(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label for metrics and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::UnknownTarget(_) => "unknown_target",
            GatewayError::Unauthenticated => "unauthenticated",
            GatewayError::AuthenticationFailure { .. } => "authentication_failure",
            GatewayError::DownstreamTimeout { .. } => "downstream_timeout",
            GatewayError::DownstreamUnreachable { .. } => "downstream_unreachable",
            GatewayError::Transport(_) => "transport",
            GatewayError::Downstream { .. } => "downstream_error",
            GatewayError::Serialization { .. } => "serialization_failure",
            GatewayError::Cache(_) => "cache",
            GatewayError::Database(_) => "database",
            GatewayError::Redis(_) => "redis",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_type, code, msg) = match self {
            GatewayError::Downstream {
                status,
                content_type,
                body,
            } => {
                // passthrough: the caller sees the backend's own status and body
                let mut response = (status, body).into_response();
                if let Some(v) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
                    response
                        .headers_mut()
                        .insert(axum::http::header::CONTENT_TYPE, v);
                }
                return response;
            }
            GatewayError::UnknownTarget(name) => (
                "invalid_request_error",
                "unknown_target",
                format!("no backend target named '{}'", name),
            ),
            GatewayError::Unauthenticated => (
                "authentication_error",
                "unauthenticated",
                "missing or invalid caller credentials".to_string(),
            ),
            GatewayError::AuthenticationFailure { target, reason } => {
                tracing::error!(backend = %target, "backend authentication failed: {}", reason);
                (
                    "authentication_error",
                    "backend_authentication_failed",
                    format!("gateway could not authenticate against '{}'", target),
                )
            }
            GatewayError::DownstreamTimeout { target } => (
                "timeout_error",
                "downstream_timeout",
                format!("backend '{}' timed out", target),
            ),
            GatewayError::DownstreamUnreachable { target, .. } => (
                "unavailable_error",
                "downstream_unreachable",
                format!("backend '{}' is unavailable", target),
            ),
            GatewayError::Transport(e) => {
                tracing::warn!("downstream transport error: {}", e);
                ("upstream_error", "transport_failed", "downstream transport error".to_string())
            }
            GatewayError::Serialization { target, .. } => (
                "upstream_error",
                "serialization_failure",
                format!("backend '{}' returned malformed JSON", target),
            ),
            GatewayError::Cache(e) => {
                tracing::error!("Cache error: {}", e);
                internal()
            }
            GatewayError::Database(e) => {
                tracing::error!("Database error: {}", e);
                internal()
            }
            GatewayError::Redis(e) => {
                tracing::error!("Redis error: {}", e);
                internal()
            }
            GatewayError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                internal()
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}

fn internal() -> (&'static str, &'static str, String) {
    (
        "internal_error",
        "internal_server_error",
        "internal server error".to_string(),
    )
}
