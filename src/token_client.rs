//! Plain request/response calls against the token endpoints

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::credential::BearerCredential;
use crate::error::{Result, SessionError, UnauthorizedBody};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
}

/// Seam between the token manager and the network so the refresh loop can be
/// driven without a server.
#[async_trait]
pub trait TokenClient: Send + Sync {
    /// `POST <endpoint> {apiKey}`
    async fn request_token(&self, endpoint: &str, api_key: &str) -> Result<BearerCredential>;

    /// `POST <server_uri>/<refresh_route> {refreshToken}`; the refresh route is
    /// carried over from the current credential.
    async fn refresh(&self, server_uri: &str, current: &BearerCredential) -> Result<BearerCredential>;
}

pub fn join_url(base: &str, route: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), route.trim_start_matches('/'))
}

pub struct HttpTokenClient {
    http: reqwest::Client,
}

impl HttpTokenClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

async fn error_from_response(resp: reqwest::Response) -> SessionError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        let body = serde_json::from_str::<UnauthorizedBody>(&text).unwrap_or(UnauthorizedBody {
            message: text,
            ..Default::default()
        });
        return SessionError::Unauthorized(body);
    }
    SessionError::Status {
        code: status.as_u16(),
        message: text,
    }
}

#[async_trait]
impl TokenClient for HttpTokenClient {
    async fn request_token(&self, endpoint: &str, api_key: &str) -> Result<BearerCredential> {
        let resp = self
            .http
            .post(endpoint)
            .json(&TokenRequest {
                api_key: api_key.to_string(),
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let cred: BearerCredential = resp
            .json()
            .await
            .map_err(|e| SessionError::Protocol(format!("token response: {e}")))?;
        Ok(cred)
    }

    async fn refresh(&self, server_uri: &str, current: &BearerCredential) -> Result<BearerCredential> {
        let url = join_url(server_uri, &current.refresh_route);
        let resp = self
            .http
            .post(&url)
            .json(&RefreshRequest {
                refresh_token: current.refresh_token.clone(),
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let fresh: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| SessionError::Protocol(format!("refresh response: {e}")))?;
        Ok(BearerCredential {
            access_token: fresh.access_token,
            refresh_token: fresh.refresh_token,
            refresh_route: current.refresh_route.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://h:1", "auth/refresh"), "http://h:1/auth/refresh");
        assert_eq!(join_url("http://h:1/", "/auth/refresh"), "http://h:1/auth/refresh");
    }

    #[test]
    fn test_credential_wire_names() {
        let c: BearerCredential = serde_json::from_str(
            r#"{"accessToken":"a","refreshToken":"r","refreshRoute":"auth/refresh"}"#,
        )
        .unwrap();
        assert_eq!(c.refresh_route, "auth/refresh");
    }
}
