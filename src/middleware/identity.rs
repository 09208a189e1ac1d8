//! Caller identity extraction.
//!
//! The gateway does not log anyone in. It trusts an identity provider to
//! turn the inbound credentials into a `CallerIdentity`; the bundled one
//! verifies an HS256 bearer JWT issued elsewhere.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::models::identity::CallerIdentity;
use crate::AppState;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn identify(&self, headers: &HeaderMap) -> Result<CallerIdentity, GatewayError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub sub: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: i64,
}

fn default_role() -> String {
    "user".to_string()
}

impl From<IdentityClaims> for CallerIdentity {
    fn from(c: IdentityClaims) -> Self {
        CallerIdentity {
            id: c.sub,
            role: c.role,
            name: c.name,
            email: c.email.filter(|e| !e.is_empty()),
        }
    }
}

pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityProvider {
    pub fn hs256(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<CallerIdentity, GatewayError> {
        decode::<IdentityClaims>(token, &self.key, &self.validation)
            .map(|data| data.claims.into())
            .map_err(|e| {
                tracing::debug!("caller token rejected: {}", e);
                GatewayError::Unauthenticated
            })
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn identify(&self, headers: &HeaderMap) -> Result<CallerIdentity, GatewayError> {
        let token = bearer_token(headers).ok_or(GatewayError::Unauthenticated)?;
        self.verify(token)
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Extractor for handlers that need an authenticated caller.
pub struct Caller(pub CallerIdentity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        state.identity.identify(&parts.headers).await.map(Caller)
    }
}
