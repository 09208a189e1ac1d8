//! Canonical request signatures for the response cache.
//!
//! Two logically identical requests must serialize to the same string no
//! matter how their query parameters or JSON bodies were assembled, so
//! every map in the signature is key-sorted before hashing.

use std::collections::BTreeMap;

use base64::Engine as _;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::models::forward::ForwardedRequest;
use crate::models::target::CacheScope;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSignature {
    canonical: String,
    key: String,
}

impl RequestSignature {
    /// Signature of `req`. The caller id only takes part when the target's
    /// cache is partitioned per caller.
    pub fn from_request(req: &ForwardedRequest, scope: CacheScope) -> Self {
        let caller = match scope {
            CacheScope::Caller => req.caller.as_ref().map(|c| c.id.as_str()).unwrap_or(""),
            CacheScope::Shared => "",
        };

        let value = json!({
            "body": canonical_body(&req.body),
            "caller": caller,
            "method": req.method.as_str().to_ascii_uppercase(),
            "params": canonical_params(req.query.as_deref()),
            "path": req.path.trim_matches('/'),
            "target": req.target,
        });

        Self::from_value(&value)
    }

    /// serde_json's default `Map` is ordered by key, so `to_string` is already
    /// canonical for any `Value` built from it.
    fn from_value(value: &Value) -> Self {
        let canonical = value.to_string();
        let key = hash(&canonical);
        Self { canonical, key }
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Hex SHA-256 of the canonical form.
    pub fn key(&self) -> &str {
        &self.key
    }
}

pub fn hash(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// `b=2&a=1&a=0` -> `{"a":["1","0"],"b":["2"]}`. Repeated values keep their order.
fn canonical_params(query: Option<&str>) -> BTreeMap<String, Vec<String>> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(q) = query {
        for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
            params.entry(k.into_owned()).or_default().push(v.into_owned());
        }
    }
    params
}

fn canonical_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(v) => v,
        Err(_) => Value::String(base64::engine::general_purpose::STANDARD.encode(body)),
    }
}
