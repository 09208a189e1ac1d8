//! End-to-end forwarding scenarios against mock backends.
//!
//! Each test builds a real `ForwardingEngine` over an in-memory cache and
//! points it at a wiremock server that plays both the auth endpoint and the
//! business API, so call counts on the wire can be asserted exactly.

use std::sync::Arc;
use std::time::Duration;

use authgate::cache::ResponseCache;
use authgate::clock::SystemClock;
use authgate::errors::GatewayError;
use authgate::middleware::audit::AuditLog;
use authgate::middleware::metrics::GatewayMetrics;
use authgate::models::forward::{ForwardedRequest, ResponseBody};
use authgate::models::identity::CallerIdentity;
use authgate::models::target::{BackendTarget, CacheScope, PaginationStyle};
use authgate::proxy::adapter::{PageRequest, ResourceAdapter};
use authgate::proxy::engine::{CachePolicy, ForwardingEngine};
use authgate::proxy::registry::BackendRegistry;
use authgate::store::memory::MemoryStore;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use base64::Engine as _;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN_PATH: &str = "/api/v1/authentications/token";

struct Harness {
    engine: Arc<ForwardingEngine>,
    store: Arc<MemoryStore>,
}

fn harness(targets: Vec<BackendTarget>) -> Harness {
    let metrics = Arc::new(GatewayMetrics::new());
    let clock = Arc::new(SystemClock);
    let registry = BackendRegistry::from_targets(
        targets,
        clock.clone(),
        chrono::Duration::seconds(300),
        metrics.clone(),
    )
    .unwrap();
    let store = Arc::new(MemoryStore::new());
    let engine = ForwardingEngine::new(
        Arc::new(registry),
        ResponseCache::new(store.clone(), clock),
        metrics,
        AuditLog::default(),
    );
    Harness {
        engine: Arc::new(engine),
        store,
    }
}

fn kb_target(base: &str) -> BackendTarget {
    BackendTarget::new("kb", base)
        .with_path_prefix("/api/v1")
        .with_password_grant(TOKEN_PATH, "svc", "pw")
        .with_cache(Duration::from_secs(300), CacheScope::Caller)
}

fn member() -> CallerIdentity {
    CallerIdentity::new("member-7", "user", "Jürgen Müller").with_email("jm@example.com")
}

async fn mount_auth(server: &MockServer, token: &str, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": token, "expires_in": 1800})),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

// ═══════════════════════════════════════════════════════════════════
//  Cache
// ═══════════════════════════════════════════════════════════════════

/// Cold cache: one auth call, one downstream call, one cache write.
/// Warm cache: zero downstream calls and the hit count goes up by one.
#[tokio::test]
async fn test_cold_then_warm_cache() {
    let server = MockServer::start().await;
    mount_auth(&server, "tok-1", 1).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/knowledge-bases"))
        .and(query_param("page", "1"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": [{"id": 1}, {"id": 2}], "remaining_count": 0})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(vec![kb_target(&server.uri())]);
    let policy = CachePolicy::new(Some(Duration::from_secs(300)), CacheScope::Caller);
    let req = ForwardedRequest::new("kb", Method::GET, "knowledge-bases")
        .query("page=1")
        .caller(member());

    let cold = h.engine.forward_cached(&req, &policy).await.unwrap();
    assert_eq!(cold.status, StatusCode::OK);
    assert_eq!(cold.cache_hit, Some(false));
    assert_eq!(h.store.len(), 1);

    let warm = h.engine.forward_cached(&req, &policy).await.unwrap();
    assert_eq!(warm.cache_hit, Some(true));
    assert_eq!(warm.body, cold.body);

    let stats = h.engine.cache().stats().await.unwrap();
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.total_hits, 1);
}

/// Callers never see each other's cached answers when the scope is per caller.
#[tokio::test]
async fn test_caller_scoped_cache_is_partitioned() {
    let server = MockServer::start().await;
    mount_auth(&server, "tok-1", 1).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/datasets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&server)
        .await;

    let h = harness(vec![kb_target(&server.uri())]);
    let policy = CachePolicy::new(None, CacheScope::Caller);
    let as_member = ForwardedRequest::new("kb", Method::GET, "datasets").caller(member());
    let as_other = ForwardedRequest::new("kb", Method::GET, "datasets")
        .caller(CallerIdentity::new("member-8", "user", "Ana"));

    h.engine.forward_cached(&as_member, &policy).await.unwrap();
    let other = h.engine.forward_cached(&as_other, &policy).await.unwrap();
    assert_eq!(other.cache_hit, Some(false));
    assert_eq!(h.store.len(), 2);
}

// ═══════════════════════════════════════════════════════════════════
//  Failure classification
// ═══════════════════════════════════════════════════════════════════

/// Connection refused surfaces as unreachable: no retry, nothing cached.
#[tokio::test]
async fn test_unreachable_backend_is_not_retried_or_cached() {
    let target = BackendTarget::new("dead", "http://127.0.0.1:1")
        .with_timeouts(Duration::from_secs(2), Duration::from_secs(1));
    let h = harness(vec![target]);
    let policy = CachePolicy::new(Some(Duration::from_secs(60)), CacheScope::Shared);

    let err = h
        .engine
        .forward_cached(&ForwardedRequest::new("dead", Method::GET, "items"), &policy)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::DownstreamUnreachable { .. }), "got {:?}", err);
    assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(h.store.is_empty());
}

/// A slow backend is cut off by the target timeout and reported as 504.
#[tokio::test]
async fn test_slow_backend_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
        .expect(1)
        .mount(&server)
        .await;

    let target = BackendTarget::new("lite", server.uri())
        .with_timeouts(Duration::from_millis(200), Duration::from_secs(1));
    let h = harness(vec![target]);

    let err = h
        .engine
        .forward(&ForwardedRequest::new("lite", Method::GET, "slow"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::DownstreamTimeout { .. }), "got {:?}", err);
    assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
}

/// Business errors come back with the downstream status and body untouched.
#[tokio::test]
async fn test_business_error_passes_through() {
    let server = MockServer::start().await;
    mount_auth(&server, "tok-1", 1).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/pipelines"))
        .respond_with(
            ResponseTemplate::new(409).set_body_json(json!({"detail": "name already exists"})),
        )
        .mount(&server)
        .await;

    let h = harness(vec![kb_target(&server.uri())]);
    let resp = h
        .engine
        .forward(
            &ForwardedRequest::new("kb", Method::POST, "pipelines")
                .json_body(&json!({"name": "p1"}))
                .caller(member()),
        )
        .await
        .unwrap();
    assert_eq!(resp.status, StatusCode::CONFLICT);
    assert_eq!(resp.body, ResponseBody::Json(json!({"detail": "name already exists"})));
}

// ═══════════════════════════════════════════════════════════════════
//  Header safety
// ═══════════════════════════════════════════════════════════════════

/// The caller's own credentials and identity headers never reach the backend;
/// the gateway's token and the verified identity do.
#[tokio::test]
async fn test_inbound_credentials_and_identity_are_replaced() {
    let server = MockServer::start().await;
    mount_auth(&server, "tok-1", 1).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/models"))
        .and(header("authorization", "Bearer tok-1"))
        .and(header("x-user-id", "member-7"))
        .and(header("x-user-role", "user"))
        .and(header("x-user-email", "jm@example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let mut inbound = HeaderMap::new();
    inbound.insert("authorization", HeaderValue::from_static("Bearer caller-jwt"));
    inbound.insert("x-user-id", HeaderValue::from_static("admin"));
    inbound.insert("x-user-role", HeaderValue::from_static("superuser"));
    inbound.insert("x-trace", HeaderValue::from_static("abc"));

    let h = harness(vec![kb_target(&server.uri())]);
    let resp = h
        .engine
        .forward(
            &ForwardedRequest::new("kb", Method::GET, "models")
                .headers(inbound)
                .caller(member()),
        )
        .await
        .unwrap();
    assert_eq!(resp.status, StatusCode::OK);

    let received = server.received_requests().await.unwrap();
    let call = received
        .iter()
        .find(|r| r.url.path() == "/api/v1/models")
        .unwrap();
    let expected_name = base64::engine::general_purpose::STANDARD.encode("Jürgen Müller");
    assert_eq!(
        call.headers.get("x-user-name-b64").map(|v| v.to_str().unwrap().to_string()),
        Some(expected_name)
    );
    assert_eq!(
        call.headers.get("x-trace").map(|v| v.to_str().unwrap().to_string()),
        Some("abc".to_string())
    );
}

// ═══════════════════════════════════════════════════════════════════
//  Resource adapters
// ═══════════════════════════════════════════════════════════════════

/// Page translation and envelope decoding for a skip/limit backend.
#[tokio::test]
async fn test_adapter_lists_with_translated_pagination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .and(query_param("skip", "20"))
        .and(query_param("limit", "10"))
        .and(query_param("tag", "prod"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"items": [{"id": "s-21"}], "total": 21})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let target = BackendTarget::new("hub", server.uri()).with_pagination(PaginationStyle::SkipLimit);
    let h = harness(vec![target]);
    let services = ResourceAdapter::new(h.engine.clone(), "hub", "services");

    let page = services
        .list(Some(PageRequest::new(3, 10)), &[("tag", "prod")], Some(&member()))
        .await
        .unwrap();
    assert_eq!(page.total(), 21);
    assert_eq!(page.items(), &[json!({"id": "s-21"})]);
}
