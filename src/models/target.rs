//! Static description of one downstream backend.
//!
//! Targets are built once at startup by `config::load` and never
//! mutated afterwards; the registry owns them behind an `Arc`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub const DEFAULT_TOKEN_PATH: &str = "/api/v1/authentications/token";
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 1800;
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 5.0;
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
pub const DEFAULT_MAX_KEEPALIVE: usize = 20;

/// A password that is wiped from memory on drop and never printed.
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        String::deserialize(d).map(Secret::new)
    }
}

/// How the gateway obtains a bearer token for a target.
#[derive(Debug, Clone)]
pub enum AuthScheme {
    /// The backend accepts unauthenticated calls from the gateway.
    None,
    /// Form-encoded password grant against `token_path` on the target's base URL.
    PasswordGrant {
        token_path: String,
        username: String,
        password: Secret,
        /// Additional form fields such as `grant_type`, `scope`, `client_id`.
        extra_form: BTreeMap<String, String>,
        /// Used when the auth response omits `expires_in`.
        default_expires_in: u64,
    },
}

impl AuthScheme {
    pub fn requires_token(&self) -> bool {
        matches!(self, AuthScheme::PasswordGrant { .. })
    }
}

/// The pagination vocabulary a backend understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationStyle {
    /// `skip` / `limit` offsets.
    SkipLimit,
    /// `page` / `page_size`.
    #[default]
    PagePageSize,
    /// `page_num` / `page_size`.
    PageNumPageSize,
    /// The backend returns everything; paging parameters are dropped.
    None,
}

/// Whether cached responses are partitioned per caller or shared by all callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    #[default]
    Caller,
    Shared,
}

#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub name: String,
    /// Scheme + host (+ port), without trailing slash.
    pub base_url: String,
    /// Prepended to every forwarded path, e.g. `/api/v1`.
    pub path_prefix: String,
    pub auth: AuthScheme,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_connections: usize,
    pub max_keepalive: usize,
    pub pagination: PaginationStyle,
    pub cache_scope: CacheScope,
    /// `None` disables caching on the reverse-proxy surface for this target.
    pub cache_ttl: Option<Duration>,
    pub default_headers: BTreeMap<String, String>,
}

impl BackendTarget {
    /// A target with default transport limits and no authentication.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            path_prefix: String::new(),
            auth: AuthScheme::None,
            timeout: Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs_f64(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_keepalive: DEFAULT_MAX_KEEPALIVE,
            pagination: PaginationStyle::default(),
            cache_scope: CacheScope::default(),
            cache_ttl: None,
            default_headers: BTreeMap::new(),
        }
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = normalize_prefix(&prefix.into());
        self
    }

    pub fn with_password_grant(
        mut self,
        token_path: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.auth = AuthScheme::PasswordGrant {
            token_path: token_path.into(),
            username: username.into(),
            password: Secret::new(password),
            extra_form: BTreeMap::new(),
            default_expires_in: DEFAULT_EXPIRES_IN_SECS,
        };
        self
    }

    pub fn with_timeouts(mut self, timeout: Duration, connect_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_pagination(mut self, style: PaginationStyle) -> Self {
        self.pagination = style;
        self
    }

    pub fn with_cache(mut self, ttl: Duration, scope: CacheScope) -> Self {
        self.cache_ttl = Some(ttl);
        self.cache_scope = scope;
        self
    }

    /// `base_url + path_prefix + path`. The query string is appended by the caller.
    pub fn url_for(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            format!("{}{}", self.base_url, self.path_prefix)
        } else {
            format!("{}{}/{}", self.base_url, self.path_prefix, path)
        }
    }

    /// Absolute URL of the auth endpoint, if the target uses one.
    pub fn token_url(&self) -> Option<String> {
        match &self.auth {
            AuthScheme::None => None,
            AuthScheme::PasswordGrant { token_path, .. } => Some(format!(
                "{}/{}",
                self.base_url,
                token_path.trim_start_matches('/')
            )),
        }
    }
}

/// `api/v1/` -> `/api/v1`, `/` -> ``.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}
