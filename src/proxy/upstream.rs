//! HTTP client construction and transport-error classification for
//! downstream backends. One pooled client per target; no transparent retries.

use std::time::Duration;

use crate::errors::GatewayError;
use crate::models::target::BackendTarget;

/// How long an idle pooled connection is kept before being closed.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Build the pooled client for one target, honouring its timeouts and
/// keep-alive limit. The total connection cap is enforced separately by
/// the registry's semaphore.
pub fn build_client(target: &BackendTarget) -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .use_rustls_tls()
        .pool_max_idle_per_host(target.max_keepalive)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .timeout(target.timeout)
        .connect_timeout(target.connect_timeout)
        .user_agent(concat!("authgate/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| {
            GatewayError::Internal(anyhow::anyhow!(
                "failed to build HTTP client for '{}': {}",
                target.name,
                e
            ))
        })
}

/// Translate a reqwest failure into the gateway taxonomy. Called once, at the
/// point where the outbound call fails.
pub fn classify(target: &str, err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        tracing::warn!(backend = %target, "downstream timed out: {}", err);
        GatewayError::DownstreamTimeout {
            target: target.to_string(),
        }
    } else if err.is_connect() {
        tracing::warn!(backend = %target, "downstream unreachable: {}", err);
        GatewayError::DownstreamUnreachable {
            target: target.to_string(),
            reason: err.to_string(),
        }
    } else {
        tracing::warn!(backend = %target, "downstream request failed: {}", err);
        GatewayError::Transport(err.to_string())
    }
}
