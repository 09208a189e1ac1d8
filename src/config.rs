use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::models::target::{
    normalize_prefix, AuthScheme, BackendTarget, CacheScope, PaginationStyle, Secret,
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_EXPIRES_IN_SECS, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_KEEPALIVE, DEFAULT_TIMEOUT_SECS, DEFAULT_TOKEN_PATH,
};

/// Name of the target built from the `PROXY_*` variables.
pub const LEGACY_TARGET_NAME: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackend {
    #[default]
    Memory,
    Postgres,
    Redis,
}

impl std::str::FromStr for CacheBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "memory" => Ok(CacheBackend::Memory),
            "postgres" | "postgresql" | "pg" => Ok(CacheBackend::Postgres),
            "redis" => Ok(CacheBackend::Redis),
            other => anyhow::bail!("unknown cache backend '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug)]
pub struct Config {
    pub port: u16,
    pub admin_key: Option<Secret>,
    pub jwt_secret: Secret,
    pub cache_backend: CacheBackend,
    /// Also enables the persisted forward log.
    pub database_url: Option<String>,
    pub redis_url: String,
    pub sweep_interval: Duration,
    pub token_safety_margin: chrono::Duration,
    pub log_format: LogFormat,
    pub targets: Vec<BackendTarget>,
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let jwt_secret = std::env::var("AUTHGATE_JWT_SECRET")
        .unwrap_or_else(|_| "CHANGE_ME_JWT_SECRET".into());

    if jwt_secret == "CHANGE_ME_JWT_SECRET" {
        let env_mode = std::env::var("AUTHGATE_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "AUTHGATE_JWT_SECRET is still the insecure placeholder. \
                 Set a real signing secret before running in production."
            );
        }
        eprintln!("⚠️  AUTHGATE_JWT_SECRET is not set, using insecure placeholder.");
    }

    let cache_backend: CacheBackend = std::env::var("AUTHGATE_CACHE_BACKEND")
        .unwrap_or_default()
        .parse()?;
    let database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());
    if cache_backend == CacheBackend::Postgres && database_url.is_none() {
        anyhow::bail!("AUTHGATE_CACHE_BACKEND=postgres requires DATABASE_URL");
    }

    let mut targets = match std::env::var("AUTHGATE_TARGETS_FILE").ok() {
        Some(path) => load_targets_file(Path::new(&path))?,
        None => Vec::new(),
    };
    if env_flag("PROXY_ENABLED") {
        targets.push(legacy_target_from_env()?);
    }
    validate_targets(&targets)?;

    Ok(Config {
        port: env_parse("AUTHGATE_PORT", 8080),
        admin_key: std::env::var("AUTHGATE_ADMIN_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(Secret::new),
        jwt_secret: Secret::new(jwt_secret),
        cache_backend,
        database_url,
        redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
        sweep_interval: Duration::from_secs(env_parse("AUTHGATE_SWEEP_INTERVAL_SECS", 3600).max(1)),
        token_safety_margin: chrono::Duration::seconds(env_parse(
            "AUTHGATE_TOKEN_SAFETY_MARGIN_SECS",
            crate::proxy::token::DEFAULT_SAFETY_MARGIN_SECS,
        )),
        log_format: match std::env::var("AUTHGATE_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        },
        targets,
    })
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// The single backend configured through `PROXY_*` / `EXTERNAL_API_*`.
fn legacy_target_from_env() -> anyhow::Result<BackendTarget> {
    let base_url = std::env::var("PROXY_TARGET_BASE_URL").unwrap_or_default();
    if base_url.is_empty() {
        anyhow::bail!("PROXY_TARGET_BASE_URL is required when PROXY_ENABLED is true");
    }
    let username = std::env::var("EXTERNAL_API_USERNAME").unwrap_or_default();
    let password = std::env::var("EXTERNAL_API_PASSWORD").unwrap_or_default();

    let mut target = BackendTarget::new(LEGACY_TARGET_NAME, base_url)
        .with_path_prefix(
            std::env::var("PROXY_TARGET_PATH_PREFIX").unwrap_or_else(|_| "/api/v1".into()),
        )
        .with_password_grant(DEFAULT_TOKEN_PATH, username, password)
        .with_timeouts(
            env_secs("PROXY_TIMEOUT", DEFAULT_TIMEOUT_SECS)?,
            env_secs("PROXY_CONNECT_TIMEOUT", DEFAULT_CONNECT_TIMEOUT_SECS)?,
        );
    target.max_connections = env_parse("PROXY_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS);
    target.max_keepalive = env_parse("PROXY_MAX_KEEPALIVE_CONNECTIONS", DEFAULT_MAX_KEEPALIVE);

    let ttl: u64 = env_parse("AUTHGATE_CACHE_TTL_SECS", 0);
    if ttl > 0 {
        target = target.with_cache(Duration::from_secs(ttl), CacheScope::Caller);
    }
    Ok(target)
}

// -- Targets file --

#[derive(Debug, Deserialize)]
struct TargetsFile {
    #[serde(default)]
    targets: Vec<TargetSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetSpec {
    name: String,
    base_url: String,
    #[serde(default)]
    path_prefix: String,
    #[serde(default)]
    auth: Option<AuthSpec>,
    timeout_secs: Option<f64>,
    connect_timeout_secs: Option<f64>,
    max_connections: Option<usize>,
    max_keepalive: Option<usize>,
    #[serde(default)]
    pagination: PaginationStyle,
    cache_ttl_secs: Option<u64>,
    #[serde(default)]
    cache_scope: CacheScope,
    #[serde(default)]
    default_headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
enum AuthSpec {
    None,
    PasswordGrant {
        #[serde(default = "default_token_path")]
        token_path: String,
        username: String,
        /// Literal password; prefer `password_env`.
        password: Option<Secret>,
        /// Name of the environment variable holding the password.
        password_env: Option<String>,
        #[serde(default)]
        extra_form: BTreeMap<String, String>,
        default_expires_in: Option<u64>,
    },
}

fn default_token_path() -> String {
    DEFAULT_TOKEN_PATH.to_string()
}

pub fn load_targets_file(path: &Path) -> anyhow::Result<Vec<BackendTarget>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read targets file {}", path.display()))?;
    parse_targets(&raw).with_context(|| format!("invalid targets file {}", path.display()))
}

pub fn parse_targets(yaml: &str) -> anyhow::Result<Vec<BackendTarget>> {
    let file: TargetsFile = serde_yaml::from_str(yaml)?;
    file.targets.into_iter().map(build_target).collect()
}

fn build_target(spec: TargetSpec) -> anyhow::Result<BackendTarget> {
    let auth = match spec.auth {
        None | Some(AuthSpec::None) => AuthScheme::None,
        Some(AuthSpec::PasswordGrant {
            token_path,
            username,
            password,
            password_env,
            extra_form,
            default_expires_in,
        }) => {
            let password = match (password, password_env) {
                (Some(p), _) => p,
                (None, Some(var)) => Secret::new(std::env::var(&var).with_context(|| {
                    format!("target '{}': env var {} is not set", spec.name, var)
                })?),
                (None, None) => Secret::new(""),
            };
            AuthScheme::PasswordGrant {
                token_path,
                username,
                password,
                extra_form,
                default_expires_in: default_expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS),
            }
        }
    };

    let mut target = BackendTarget::new(spec.name, spec.base_url)
        .with_path_prefix(spec.path_prefix)
        .with_timeouts(
            secs(spec.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))?,
            secs(spec.connect_timeout_secs.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS))?,
        )
        .with_pagination(spec.pagination);
    target.auth = auth;
    target.max_connections = spec.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
    target.max_keepalive = spec.max_keepalive.unwrap_or(DEFAULT_MAX_KEEPALIVE);
    target.cache_scope = spec.cache_scope;
    target.cache_ttl = spec.cache_ttl_secs.filter(|t| *t > 0).map(Duration::from_secs);
    target.default_headers = spec.default_headers;
    Ok(target)
}

fn secs(value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| anyhow::anyhow!("invalid duration {}", value))
}

fn env_secs(key: &str, default: f64) -> anyhow::Result<Duration> {
    secs(env_parse(key, default)).map_err(|e| anyhow::anyhow!("{}: {}", key, e))
}

/// Startup checks. Anything that fails here would otherwise fail on the
/// first forwarded request.
pub fn validate_targets(targets: &[BackendTarget]) -> anyhow::Result<()> {
    let mut seen = HashSet::new();
    for t in targets {
        if t.name.is_empty() || t.name.contains('/') {
            anyhow::bail!("invalid target name '{}'", t.name);
        }
        if !seen.insert(t.name.as_str()) {
            anyhow::bail!("duplicate target name '{}'", t.name);
        }
        let url = url::Url::parse(&t.base_url)
            .with_context(|| format!("target '{}': invalid base_url '{}'", t.name, t.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("target '{}': base_url must be http(s)", t.name);
        }
        if t.path_prefix != normalize_prefix(&t.path_prefix) {
            anyhow::bail!("target '{}': malformed path_prefix '{}'", t.name, t.path_prefix);
        }
        if t.max_connections == 0 {
            anyhow::bail!("target '{}': max_connections must be at least 1", t.name);
        }
        if t.timeout.is_zero() || t.connect_timeout.is_zero() {
            anyhow::bail!("target '{}': timeouts must be positive", t.name);
        }
        if let AuthScheme::PasswordGrant {
            username, password, ..
        } = &t.auth
        {
            if username.is_empty() || password.is_empty() {
                anyhow::bail!(
                    "target '{}': password_grant needs a username and a password",
                    t.name
                );
            }
        }
    }
    Ok(())
}
