//! Per-target bearer token lifecycle.
//!
//! Each backend target owns one `TokenManager`. A valid lease is read
//! without touching the refresh lock; when the lease is missing or stale,
//! callers queue on a per-target async mutex so that exactly one auth call
//! is in flight and everyone else picks up its result.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::clock::Clock;
use crate::errors::GatewayError;
use crate::middleware::metrics::GatewayMetrics;
use crate::models::target::{AuthScheme, BackendTarget};
use crate::proxy::upstream;

/// Default time subtracted from a token's lifetime to renew it early.
pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 300;

/// Longest lifetime honoured from an auth response (one year).
pub const MAX_TOKEN_LIFETIME_SECS: u64 = 365 * 24 * 3600;

#[derive(Clone, PartialEq, Eq)]
pub struct TokenLease {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    /// When the backend will stop accepting the token.
    pub expires_at: DateTime<Utc>,
    /// When the gateway stops handing it out.
    pub refresh_at: DateTime<Utc>,
}

impl TokenLease {
    /// Build a lease for a token that lives `expires_in` seconds from `now`.
    /// A margin that would eat the whole lifetime is cut to half of it, and
    /// lifetimes are capped at `MAX_TOKEN_LIFETIME_SECS`.
    pub fn new(token: String, now: DateTime<Utc>, expires_in: u64, margin: Duration) -> Self {
        let lifetime = Duration::seconds(expires_in.min(MAX_TOKEN_LIFETIME_SECS) as i64);
        let margin = if margin >= lifetime { lifetime / 2 } else { margin };
        let expires_at = now.checked_add_signed(lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let refresh_at = expires_at.checked_sub_signed(margin).unwrap_or(now);
        Self {
            token,
            issued_at: now,
            expires_at,
            refresh_at,
        }
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.refresh_at
    }
}

impl std::fmt::Debug for TokenLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLease")
            .field("token", &mask(&self.token))
            .field("expires_at", &self.expires_at)
            .field("refresh_at", &self.refresh_at)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<serde_json::Value>,
}

pub struct TokenManager {
    target: Arc<BackendTarget>,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    margin: Duration,
    metrics: Arc<GatewayMetrics>,
    lease: RwLock<Option<TokenLease>>,
    refresh: tokio::sync::Mutex<()>,
}

impl TokenManager {
    pub fn new(
        target: Arc<BackendTarget>,
        http: reqwest::Client,
        clock: Arc<dyn Clock>,
        margin: Duration,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            target,
            http,
            clock,
            margin,
            metrics,
            lease: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// A token that is valid right now, acquiring a new one if needed.
    /// Targets without authentication yield `None`.
    pub async fn get_valid_token(&self) -> Result<Option<String>, GatewayError> {
        if !self.target.auth.requires_token() {
            return Ok(None);
        }

        if let Some(token) = self.current() {
            return Ok(Some(token));
        }

        let _singleflight = self.refresh.lock().await;

        // Whoever held the lock before us may already have refreshed.
        if let Some(token) = self.current() {
            return Ok(Some(token));
        }

        let lease = self.acquire().await?;
        let token = lease.token.clone();
        *self.lease.write().unwrap_or_else(|p| p.into_inner()) = Some(lease);
        Ok(Some(token))
    }

    /// Drop the current lease so the next call re-authenticates.
    pub fn invalidate(&self) {
        tracing::debug!(backend = %self.target.name, "token lease invalidated");
        *self.lease.write().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Drop the lease only if it still holds `rejected`. A lease that was
    /// already replaced by a concurrent refresh is kept.
    pub fn invalidate_if(&self, rejected: &str) -> bool {
        let mut guard = self.lease.write().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(lease) if lease.token == rejected => {
                tracing::debug!(backend = %self.target.name, "rejected token invalidated");
                *guard = None;
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the current lease, valid or not.
    pub fn lease(&self) -> Option<TokenLease> {
        self.lease
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn current(&self) -> Option<String> {
        let now = self.clock.now();
        self.lease
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .filter(|lease| lease.is_valid(now))
            .map(|lease| lease.token.clone())
    }

    async fn acquire(&self) -> Result<TokenLease, GatewayError> {
        let result = self.request_token().await;
        self.metrics
            .record_token_refresh(&self.target.name, result.is_ok());
        result
    }

    async fn request_token(&self) -> Result<TokenLease, GatewayError> {
        let (username, password, extra_form, default_expires_in) = match &self.target.auth {
            AuthScheme::PasswordGrant {
                username,
                password,
                extra_form,
                default_expires_in,
                ..
            } => (username, password, extra_form, *default_expires_in),
            AuthScheme::None => {
                return Err(GatewayError::Internal(anyhow::anyhow!(
                    "target '{}' has no auth scheme",
                    self.target.name
                )))
            }
        };
        let url = self.target.token_url().unwrap_or_default();
        let name = self.target.name.as_str();

        let mut form: Vec<(&str, &str)> = vec![
            ("username", username.as_str()),
            ("password", password.expose()),
        ];
        form.extend(extra_form.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        tracing::info!(backend = %name, url = %url, "acquiring backend token");

        let resp = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| upstream::classify(name, &e))?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| upstream::classify(name, &e))?;

        if !status.is_success() {
            let preview = String::from_utf8_lossy(&body[..body.len().min(200)]).into_owned();
            return Err(GatewayError::AuthenticationFailure {
                target: name.to_string(),
                reason: format!("auth endpoint returned {}: {}", status, preview),
            });
        }

        let parsed: TokenResponse =
            serde_json::from_slice(&body).map_err(|e| GatewayError::AuthenticationFailure {
                target: name.to_string(),
                reason: format!("malformed auth response: {}", e),
            })?;

        let token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::AuthenticationFailure {
                target: name.to_string(),
                reason: "auth response has no access_token".to_string(),
            })?;
        let expires_in = parsed
            .expires_in
            .as_ref()
            .and_then(parse_expires_in)
            .unwrap_or(default_expires_in);

        let lease = TokenLease::new(token, self.clock.now(), expires_in, self.margin);
        tracing::info!(
            backend = %name,
            expires_in,
            refresh_at = %lease.refresh_at,
            "backend token acquired"
        );
        Ok(lease)
    }
}

/// `expires_in` arrives as an integer, a float, or a numeric string depending
/// on the backend.
fn parse_expires_in(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `abcd…wxyz` for logging.
pub fn mask(secret: &str) -> String {
    if secret.len() > 8 && secret.is_ascii() {
        format!("{}…{}", &secret[..4], &secret[secret.len() - 4..])
    } else {
        "****".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager(target: BackendTarget, clock: Arc<dyn Clock>) -> Arc<TokenManager> {
        let http = upstream::build_client(&target).unwrap();
        Arc::new(TokenManager::new(
            Arc::new(target),
            http,
            clock,
            Duration::seconds(DEFAULT_SAFETY_MARGIN_SECS),
            Arc::new(GatewayMetrics::new()),
        ))
    }

    fn grant_target(uri: &str) -> BackendTarget {
        BackendTarget::new("kb", uri)
            .with_path_prefix("/api/v1")
            .with_password_grant("/api/v1/authentications/token", "svc", "s3cret")
    }

    fn token_body(token: &str, expires_in: u64) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .set_body_json(json!({"access_token": token, "expires_in": expires_in}))
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_auth_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/authentications/token"))
            .and(body_string_contains("username=svc"))
            .and(body_string_contains("password=s3cret"))
            .respond_with(token_body("tok-1", 3600).set_delay(std::time::Duration::from_millis(200)))
            .expect(1)
            .mount(&server)
            .await;

        let tm = manager(grant_target(&server.uri()), Arc::new(SystemClock));
        let calls = (0..25).map(|_| {
            let tm = tm.clone();
            tokio::spawn(async move { tm.get_valid_token().await })
        });
        let results = futures::future::join_all(calls).await;

        for r in results {
            assert_eq!(r.unwrap().unwrap().as_deref(), Some("tok-1"));
        }
    }

    #[tokio::test]
    async fn test_expiry_boundary_with_manual_clock() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(token_body("first", 3600))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(token_body("second", 3600))
            .expect(1)
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tm = manager(grant_target(&server.uri()), clock.clone());

        assert_eq!(tm.get_valid_token().await.unwrap().as_deref(), Some("first"));

        // 3600 - 300 = 3300s of reuse; one second before that is still cached
        clock.advance(Duration::seconds(3299));
        assert_eq!(tm.get_valid_token().await.unwrap().as_deref(), Some("first"));

        clock.advance(Duration::seconds(1));
        assert_eq!(tm.get_valid_token().await.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_reacquire() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(token_body("t", 3600))
            .expect(2)
            .mount(&server)
            .await;

        let tm = manager(grant_target(&server.uri()), Arc::new(SystemClock));
        tm.get_valid_token().await.unwrap();
        tm.get_valid_token().await.unwrap();
        tm.invalidate();
        tm.get_valid_token().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_if_ignores_replaced_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(token_body("current", 3600))
            .mount(&server)
            .await;

        let tm = manager(grant_target(&server.uri()), Arc::new(SystemClock));
        tm.get_valid_token().await.unwrap();
        assert!(!tm.invalidate_if("stale"));
        assert!(tm.lease().is_some());
        assert!(tm.invalidate_if("current"));
        assert!(tm.lease().is_none());
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_authentication_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
            .mount(&server)
            .await;

        let tm = manager(grant_target(&server.uri()), Arc::new(SystemClock));
        let err = tm.get_valid_token().await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthenticationFailure { .. }));
        assert!(tm.lease().is_none());
    }

    #[tokio::test]
    async fn test_missing_access_token_is_authentication_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token_type": "bearer"})))
            .mount(&server)
            .await;

        let tm = manager(grant_target(&server.uri()), Arc::new(SystemClock));
        assert!(matches!(
            tm.get_valid_token().await,
            Err(GatewayError::AuthenticationFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_auth_timeout_is_downstream_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(token_body("late", 3600).set_delay(std::time::Duration::from_millis(500)))
            .mount(&server)
            .await;

        let target = grant_target(&server.uri()).with_timeouts(
            std::time::Duration::from_millis(100),
            std::time::Duration::from_millis(100),
        );
        let tm = manager(target, Arc::new(SystemClock));
        assert!(matches!(
            tm.get_valid_token().await,
            Err(GatewayError::DownstreamTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_unauthenticated_target_has_no_token() {
        let tm = manager(BackendTarget::new("lite", "http://127.0.0.1:9"), Arc::new(SystemClock));
        assert_eq!(tm.get_valid_token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_expires_in_uses_target_default() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "x"})))
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tm = manager(grant_target(&server.uri()), clock.clone());
        tm.get_valid_token().await.unwrap();
        let lease = tm.lease().unwrap();
        assert_eq!(lease.expires_at - lease.issued_at, Duration::seconds(1800));
        assert_eq!(lease.refresh_at - lease.issued_at, Duration::seconds(1500));
    }

    #[test]
    fn test_short_lived_token_keeps_half_its_lifetime() {
        let now = Utc::now();
        let lease = TokenLease::new("t".into(), now, 120, Duration::seconds(300));
        assert_eq!(lease.refresh_at, now + Duration::seconds(60));
        assert!(lease.is_valid(now + Duration::seconds(59)));
        assert!(!lease.is_valid(now + Duration::seconds(60)));
    }

    #[test]
    fn test_huge_lifetime_is_capped() {
        let now = Utc::now();
        let cap = Duration::seconds(MAX_TOKEN_LIFETIME_SECS as i64);
        for expires_in in [10_000_000_000_000, u64::MAX] {
            let lease = TokenLease::new("t".into(), now, expires_in, Duration::seconds(300));
            assert_eq!(lease.expires_at, now + cap);
            assert_eq!(lease.refresh_at, now + cap - Duration::seconds(300));
            assert!(lease.is_valid(now));
        }
    }

    #[tokio::test]
    async fn test_huge_expires_in_from_backend_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "t", "expires_in": 10_000_000_000_000u64})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let tm = manager(grant_target(&server.uri()), Arc::new(SystemClock));
        let handle = {
            let tm = tm.clone();
            tokio::spawn(async move { tm.get_valid_token().await })
        };
        assert_eq!(handle.await.unwrap().unwrap().as_deref(), Some("t"));
        let lease = tm.lease().unwrap();
        assert_eq!(
            lease.expires_at - lease.issued_at,
            Duration::seconds(MAX_TOKEN_LIFETIME_SECS as i64)
        );
        // served from the lease, no second auth call
        assert_eq!(tm.get_valid_token().await.unwrap().as_deref(), Some("t"));
    }

    #[test]
    fn test_parse_expires_in_variants() {
        assert_eq!(parse_expires_in(&json!(3600)), Some(3600));
        assert_eq!(parse_expires_in(&json!(3600.7)), Some(3600));
        assert_eq!(parse_expires_in(&json!("1800")), Some(1800));
        assert_eq!(parse_expires_in(&json!(null)), None);
        assert_eq!(parse_expires_in(&json!(-5)), None);
    }

    #[test]
    fn test_mask_hides_middle() {
        assert_eq!(mask("eyJhbGciOiJIUzI1NiJ9"), "eyJh…NiJ9");
        assert_eq!(mask("short"), "****");
    }
}
