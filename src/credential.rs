//! Bearer credential value type and a non-verifying claims decoder
//!
//! Signature checks stay on the server; the client only needs `exp` to decide
//! when to refresh.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BearerCredential {
    pub access_token: String,
    pub refresh_token: String,
    pub refresh_route: String,
}

// Tokens must never end up in logs
impl std::fmt::Debug for BearerCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerCredential")
            .field("access_token", &"<redacted>")
            .field("refresh_route", &self.refresh_route)
            .field("expires_at", &self.expires_at())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ExpiryClaim {
    exp: Option<i64>,
}

/// Decode the payload segment of a `header.payload.signature` token and return
/// its `exp` claim. Returns `None` for anything malformed.
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    // Some issuers pad anyway
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claim: ExpiryClaim = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claim.exp?, 0).single()
}

impl BearerCredential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        refresh_route: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            refresh_route: refresh_route.into(),
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        decode_expiry(&self.access_token)
    }

    /// True when the token is expired, expires within `threshold` of `now`, or
    /// carries no readable expiry at all.
    pub fn needs_refresh_at(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.expires_at() {
            Some(exp) => exp <= now + threshold,
            None => true,
        }
    }

    pub fn needs_refresh(&self, threshold: Duration) -> bool {
        self.needs_refresh_at(Utc::now(), threshold)
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

/// Build an unsigned token shaped like a JWT. Used by the server-side issuer and
/// by tests; the third segment is an opaque random nonce, not a signature.
pub fn encode_token(subject: &str, expires_at: DateTime<Utc>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "sub": subject,
        "exp": expires_at.timestamp(),
        "iat": Utc::now().timestamp(),
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let nonce = URL_SAFE_NO_PAD.encode(uuid::Uuid::new_v4().as_bytes());
    format!("{header}.{payload}.{nonce}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_expiry_round_trip() {
        let exp = Utc.timestamp_opt(1_900_000_000, 0).unwrap();
        let token = encode_token("alice", exp);
        assert_eq!(decode_expiry(&token), Some(exp));
    }

    #[test]
    fn test_decode_expiry_malformed() {
        assert_eq!(decode_expiry(""), None);
        assert_eq!(decode_expiry("only.two"), None);
        assert_eq!(decode_expiry("a.b.c.d"), None);
        assert_eq!(decode_expiry("a.!!!.c"), None);
        // valid base64, no exp
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"x"}"#);
        assert_eq!(decode_expiry(&format!("h.{payload}.s")), None);
    }

    #[test]
    fn test_needs_refresh_threshold() {
        let now = Utc::now();
        let threshold = Duration::minutes(5);

        let soon = BearerCredential::new(encode_token("u", now + Duration::minutes(4)), "r", "auth/refresh");
        assert!(soon.needs_refresh_at(now, threshold));

        let later = BearerCredential::new(encode_token("u", now + Duration::hours(1)), "r", "auth/refresh");
        assert!(!later.needs_refresh_at(now, threshold));

        let expired = BearerCredential::new(encode_token("u", now - Duration::seconds(1)), "r", "auth/refresh");
        assert!(expired.needs_refresh_at(now, threshold));

        let opaque = BearerCredential::new("not-a-jwt", "r", "auth/refresh");
        assert!(opaque.needs_refresh_at(now, threshold));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let c = BearerCredential::new("secret-access", "secret-refresh", "auth/refresh");
        let s = format!("{c:?}");
        assert!(!s.contains("secret-access"));
        assert!(!s.contains("secret-refresh"));
    }
}
