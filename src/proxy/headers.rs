//! Outbound header rebuilding and inbound response header filtering.

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use base64::Engine as _;

use crate::models::identity::CallerIdentity;
use crate::models::target::BackendTarget;

pub const X_USER_ID: &str = "x-user-id";
pub const X_USER_ROLE: &str = "x-user-role";
pub const X_USER_EMAIL: &str = "x-user-email";
pub const X_USER_NAME_B64: &str = "x-user-name-b64";

/// Request headers that are regenerated per hop and never copied through.
const STRIPPED_REQUEST: &[&str] = &[
    "authorization",
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response headers whose values go stale once the body is re-serialized.
const STRIPPED_RESPONSE: &[&str] = &[
    "server",
    "date",
    "content-encoding",
    "transfer-encoding",
    "connection",
    "content-length",
];

/// Build the header set for one outbound call: target defaults, then the
/// sanitized inbound headers, then the caller identity and bearer token.
pub fn outbound(
    target: &BackendTarget,
    inbound: &HeaderMap,
    caller: Option<&CallerIdentity>,
    token: Option<&str>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
    for (name, value) in &target.default_headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&ascii_only(value)),
        ) {
            (Ok(n), Ok(v)) => {
                headers.insert(n, v);
            }
            _ => tracing::warn!(backend = %target.name, header = %name, "skipping invalid default header"),
        }
    }

    let mut overridden = Vec::new();
    for (name, value) in sanitize(inbound).iter() {
        // first inbound value replaces the default, later ones append
        if !overridden.contains(name) {
            headers.remove(name);
            overridden.push(name.clone());
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(caller) = caller {
        inject_identity(&mut headers, caller);
    }

    if let Some(token) = token {
        if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", token)) {
            headers.insert(header::AUTHORIZATION, v);
        }
    }

    headers
}

/// Drop hop-by-hop headers and any caller-supplied identity headers, and
/// strip non-ASCII bytes from what remains.
pub fn sanitize(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound.iter() {
        let n = name.as_str();
        if STRIPPED_REQUEST.contains(&n) || n.starts_with("x-user-") {
            continue;
        }
        let cleaned: Vec<u8> = value
            .as_bytes()
            .iter()
            .copied()
            .filter(u8::is_ascii)
            .collect();
        if let Ok(v) = HeaderValue::from_bytes(&cleaned) {
            out.append(name.clone(), v);
        }
    }
    out
}

/// Identity headers. The display name goes out base64-encoded so that
/// non-ASCII names never hit the wire as raw header bytes.
pub fn inject_identity(headers: &mut HeaderMap, caller: &CallerIdentity) {
    set_ascii(headers, X_USER_ID, &caller.id);
    set_ascii(headers, X_USER_ROLE, &caller.role);
    if let Some(email) = caller.email.as_deref() {
        set_ascii(headers, X_USER_EMAIL, email);
    }
    if !caller.name.is_empty() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(caller.name.as_bytes());
        if let Ok(v) = HeaderValue::from_str(&encoded) {
            headers.insert(HeaderName::from_static(X_USER_NAME_B64), v);
        }
    }
}

/// Copy downstream response headers, minus the ones that no longer hold.
pub fn response(downstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in downstream.iter() {
        if !STRIPPED_RESPONSE.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn set_ascii(headers: &mut HeaderMap, name: &'static str, value: &str) {
    let cleaned = ascii_only(value);
    if cleaned.is_empty() {
        return;
    }
    if let Ok(v) = HeaderValue::from_str(&cleaned) {
        headers.insert(HeaderName::from_static(name), v);
    }
}

/// Printable ASCII only; control characters would make the value invalid.
fn ascii_only(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer caller-jwt"));
        h.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        h.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        h.insert("x-user-id", HeaderValue::from_static("spoofed"));
        h.insert("x-trace", HeaderValue::from_static("abc"));
        h.insert(header::ACCEPT, HeaderValue::from_static("text/csv"));
        h
    }

    #[test]
    fn test_hop_by_hop_and_identity_headers_are_stripped() {
        let target = BackendTarget::new("kb", "http://kb");
        let out = outbound(&target, &inbound(), None, Some("svc-token"));

        assert_eq!(out["authorization"], "Bearer svc-token");
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONTENT_LENGTH).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get("x-user-id").is_none());
        assert_eq!(out["x-trace"], "abc");
        // inbound overrides the default Accept
        assert_eq!(out["accept"], "text/csv");
    }

    #[test]
    fn test_non_ascii_name_only_travels_base64() {
        let caller = CallerIdentity::new("42", "editor", "Zoë Ångström").with_email("zoë@example.com");
        let target = BackendTarget::new("kb", "http://kb");
        let out = outbound(&target, &HeaderMap::new(), Some(&caller), None);

        assert_eq!(out[X_USER_ID], "42");
        assert_eq!(out[X_USER_ROLE], "editor");
        assert_eq!(out[X_USER_EMAIL], "zo@example.com");
        let encoded = out[X_USER_NAME_B64].to_str().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "Zoë Ångström");

        for value in out.values() {
            assert!(value.as_bytes().is_ascii());
        }
        assert!(out.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_response_filter_drops_stale_transport_headers() {
        let mut h = HeaderMap::new();
        h.insert(header::SERVER, HeaderValue::from_static("uvicorn"));
        h.insert(header::DATE, HeaderValue::from_static("Mon, 01 Jan 2024 00:00:00 GMT"));
        h.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        h.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        h.insert("x-total-count", HeaderValue::from_static("7"));

        let out = response(&h);
        assert_eq!(out.len(), 1);
        assert_eq!(out["x-total-count"], "7");
    }

    #[test]
    fn test_default_headers_apply_first() {
        let mut target = BackendTarget::new("hub", "http://hub");
        target
            .default_headers
            .insert("x-api-version".into(), "2".into());
        let out = outbound(&target, &HeaderMap::new(), None, None);
        assert_eq!(out["x-api-version"], "2");
        assert_eq!(out["accept"], "application/json");
    }
}
