//! Bearer credential issuing and verification
//!
//! Access tokens carry their expiry in JWT-shaped claims so clients can plan
//! refreshes, but the server never trusts the claims: a token is valid only if
//! it is in the issued table and not past its expiry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::credential::{encode_token, BearerCredential};

pub const TOKEN_ROUTE: &str = "auth/token";
pub const REFRESH_ROUTE: &str = "auth/refresh";

/// Refresh tokens outlive the access token they came with by this factor.
const REFRESH_TTL_FACTOR: i32 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("access token required")]
    MissingToken,
    #[error("access token not recognized")]
    UnknownToken,
    #[error("access token expired")]
    Expired,
    #[error("refresh token not recognized")]
    UnknownRefreshToken,
}

struct Grant {
    subject: String,
    expires_at: DateTime<Utc>,
}

pub struct TokenIssuer {
    api_keys: Vec<String>,
    ttl: chrono::Duration,
    access: DashMap<String, Grant>,
    refresh: DashMap<String, Grant>,
}

impl TokenIssuer {
    pub fn new(api_keys: Vec<String>, ttl: chrono::Duration) -> Self {
        Self {
            api_keys,
            ttl,
            access: DashMap::new(),
            refresh: DashMap::new(),
        }
    }

    /// With no API keys configured, anonymous sessions are accepted.
    pub fn auth_required(&self) -> bool {
        !self.api_keys.is_empty()
    }

    fn mint(&self, subject: &str) -> (String, String) {
        let expires_at = Utc::now() + self.ttl;
        let access = encode_token(subject, expires_at);
        let refresh = Uuid::new_v4().simple().to_string();
        self.access.insert(
            access.clone(),
            Grant {
                subject: subject.to_string(),
                expires_at,
            },
        );
        self.refresh.insert(
            refresh.clone(),
            Grant {
                subject: subject.to_string(),
                expires_at: Utc::now() + self.ttl * REFRESH_TTL_FACTOR,
            },
        );
        self.purge_expired();
        (access, refresh)
    }

    pub fn issue(&self, api_key: &str) -> Result<BearerCredential, AuthError> {
        let index = self
            .api_keys
            .iter()
            .position(|k| k == api_key)
            .ok_or(AuthError::InvalidApiKey)?;
        let subject = format!("key-{index}");
        let (access, refresh) = self.mint(&subject);
        tracing::info!(%subject, "issued access token");
        Ok(BearerCredential::new(access, refresh, REFRESH_ROUTE))
    }

    /// Trade a refresh token for a fresh pair. The refresh token is single use.
    pub fn refresh(&self, refresh_token: &str) -> Result<(String, String), AuthError> {
        let (_, grant) = self
            .refresh
            .remove(refresh_token)
            .ok_or(AuthError::UnknownRefreshToken)?;
        if grant.expires_at <= Utc::now() {
            return Err(AuthError::UnknownRefreshToken);
        }
        let subject = grant.subject;
        tracing::debug!(%subject, "refreshed access token");
        Ok(self.mint(&subject))
    }

    /// Subject of a valid token. Without configured keys every caller is
    /// "anonymous".
    pub fn verify(&self, token: Option<&str>) -> Result<String, AuthError> {
        if !self.auth_required() {
            return Ok("anonymous".to_string());
        }
        let token = token.filter(|t| !t.is_empty()).ok_or(AuthError::MissingToken)?;
        let grant = self.access.get(token).ok_or(AuthError::UnknownToken)?;
        if grant.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }
        Ok(grant.subject.clone())
    }

    fn purge_expired(&self) {
        let now = Utc::now();
        self.access.retain(|_, g| g.expires_at > now);
        self.refresh.retain(|_, g| g.expires_at > now);
    }
}

/// Token from an `authorization: Bearer ...` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}
