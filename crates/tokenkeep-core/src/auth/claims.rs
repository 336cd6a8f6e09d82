//! Unverified access-token inspection.
//!
//! The payload segment of a JWT is read without checking its signature.
//! The result is used only to decide *when* to renew a token this process
//! just received from the authentication service; it must never feed an
//! authorization decision.

use std::collections::BTreeSet;

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::Value;
use tracing::debug;

/// Tokens expiring within this many seconds count as near expiry.
pub const NEAR_EXPIRY_THRESHOLD_SECS: i64 = 300;

/// Claims decoded from an access token's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTokenClaims {
    pub expires_at: i64,
    pub issued_at: Option<i64>,
    pub subject: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub issuer: Option<String>,
    pub scope: Vec<String>,
    /// Realm roles plus client roles rendered as `client:role`, sorted.
    pub roles: Vec<String>,
}

impl AccessTokenClaims {
    /// Seconds until expiry; negative once expired
    pub fn expires_in(&self, now: i64) -> i64 {
        self.expires_at.saturating_sub(now)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_in(now) <= 0
    }

    pub fn is_near_expiry(&self, now: i64, threshold_secs: i64) -> bool {
        self.expires_in(now) < threshold_secs
    }
}

/// Epoch seconds from a numeric claim. Fractions are dropped and
/// out-of-range floats saturate.
fn as_epoch(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_u64().map(|_| i64::MAX))
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

/// A display claim as text; numbers are rendered, anything else ignored.
fn as_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `scope` is space-separated in most issuers and an array in some.
fn scope_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn role_names(access: Option<&Value>) -> impl Iterator<Item = &str> {
    access
        .and_then(|a| a.get("roles"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

fn decode_segment(segment: &str) -> Option<Vec<u8>> {
    let trimmed = segment.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .ok()
}

/// Decode the claims of `token`, or `None` when the token is not a
/// well-formed JWT with an `exp` claim.
///
/// `None` means "cannot schedule proactively", not an error. Display
/// claims of an unexpected type are skipped rather than rejecting the
/// token.
pub fn decode_claims(token: &str) -> Option<AccessTokenClaims> {
    let mut segments = token.split('.');
    let _header = segments.next()?;
    let payload = segments.next().filter(|p| !p.is_empty())?;

    let bytes = decode_segment(payload).or_else(|| {
        debug!("Access token payload is not valid base64url");
        None
    })?;
    let raw: Value = match serde_json::from_slice(&bytes) {
        Ok(raw @ Value::Object(_)) => raw,
        Ok(_) => {
            debug!("Access token payload is not a JSON object");
            return None;
        }
        Err(e) => {
            debug!(error = %e, "Access token payload is not JSON");
            return None;
        }
    };

    let expires_at = raw.get("exp").and_then(as_epoch)?;

    let mut roles: BTreeSet<String> = role_names(raw.get("realm_access"))
        .map(str::to_string)
        .collect();
    if let Some(clients) = raw.get("resource_access").and_then(Value::as_object) {
        for (client, access) in clients {
            roles.extend(role_names(Some(access)).map(|role| format!("{}:{}", client, role)));
        }
    }

    Some(AccessTokenClaims {
        expires_at,
        issued_at: raw.get("iat").and_then(as_epoch),
        subject: as_text(raw.get("sub")),
        username: as_text(raw.get("preferred_username")),
        email: as_text(raw.get("email")),
        issuer: as_text(raw.get("iss")),
        scope: scope_list(raw.get("scope")),
        roles: roles.into_iter().collect(),
    })
}

/// Build an unsigned token around `payload`.
#[cfg(test)]
pub(crate) fn unsigned_token(payload: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.signature", header, body)
}
