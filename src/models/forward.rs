//! Values that flow through the forwarding engine.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use super::identity::CallerIdentity;

/// One inbound call, addressed to a named backend target. Never persisted.
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    pub target: String,
    pub method: Method,
    /// Path relative to the target's prefix.
    pub path: String,
    /// Raw query string without the leading `?`, forwarded verbatim.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub caller: Option<CallerIdentity>,
    /// Re-authentication retries allowed after a downstream 401.
    pub retry_budget: u8,
}

impl ForwardedRequest {
    pub fn new(target: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            caller: None,
            retry_budget: 1,
        }
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        let q = query.into();
        self.query = if q.is_empty() { None } else { Some(q) };
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json_body(mut self, value: &serde_json::Value) -> Self {
        self.body = Bytes::from(value.to_string());
        self.headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self
    }

    pub fn caller(mut self, caller: CallerIdentity) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn retry_budget(mut self, budget: u8) -> Self {
        self.retry_budget = budget;
        self
    }
}

/// A downstream body after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Parsed JSON; re-serialized on the way out.
    Json(serde_json::Value),
    /// Opaque bytes with the downstream's content type.
    Raw { content_type: String, bytes: Bytes },
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            ResponseBody::Raw { .. } => None,
        }
    }

    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            ResponseBody::Raw { .. } => None,
        }
    }
}

/// Downstream response as surfaced to the caller. Any status, including
/// business errors, is carried here unchanged.
#[derive(Debug, Clone)]
pub struct DownstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// Set by the cache-enabled path.
    pub cache_hit: Option<bool>,
}

impl DownstreamResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The response as a passthrough error, body and content type intact.
    pub fn into_error(self) -> crate::errors::GatewayError {
        let (content_type, body) = match self.body {
            ResponseBody::Json(value) => (
                Some("application/json".to_string()),
                Bytes::from(value.to_string()),
            ),
            ResponseBody::Raw {
                content_type,
                bytes,
            } => ((!content_type.is_empty()).then_some(content_type), bytes),
        };
        crate::errors::GatewayError::Downstream {
            status: self.status,
            content_type,
            body,
        }
    }
}

impl IntoResponse for DownstreamResponse {
    fn into_response(self) -> Response {
        let mut headers = self.headers;
        let body = match self.body {
            ResponseBody::Json(value) => {
                headers.insert(
                    axum::http::header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                Body::from(value.to_string())
            }
            ResponseBody::Raw {
                content_type,
                bytes,
            } => {
                if !content_type.is_empty() {
                    if let Ok(v) = HeaderValue::from_str(&content_type) {
                        headers.insert(axum::http::header::CONTENT_TYPE, v);
                    }
                }
                Body::from(bytes)
            }
        };
        if let Some(hit) = self.cache_hit {
            headers.insert(
                "x-authgate-cache",
                HeaderValue::from_static(if hit { "hit" } else { "miss" }),
            );
        }

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }
}
