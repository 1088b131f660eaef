//! Error taxonomy for the remote session core

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Body carried by every 401 response (HTTP) or handshake rejection (duplex).
/// Used to bootstrap authentication from an API key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnauthorizedBody {
    pub token_request_endpoint: String,
    #[serde(default)]
    pub http_base: String,
    #[serde(default)]
    pub message: String,
}

/// Coarse classification used by callers that only care about the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authorization,
    Transport,
    Integrity,
    LimitExceeded,
    Protocol,
    Canceled,
    Remote,
    Io,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unauthorized: {}", .0.message)]
    Unauthorized(UnauthorizedBody),

    #[error("access denied: {0}")]
    Authorization(String),

    #[error("not connected")]
    NotConnected,

    #[error("already connected to {0}")]
    AlreadyConnected(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("checksum mismatch (expected {expected}, got {actual})")]
    Integrity { expected: String, actual: String },

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server reported error: {0}")]
    Remote(String),

    #[error("transfer failed with status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("local file not found: {}", .0.display())]
    LocalFileMissing(PathBuf),

    #[error("operation canceled")]
    Canceled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Unauthorized(_) | SessionError::Authorization(_) => {
                ErrorKind::Authorization
            }
            SessionError::NotConnected
            | SessionError::AlreadyConnected(_)
            | SessionError::ConnectionClosed(_)
            | SessionError::Transport(_)
            | SessionError::Status { .. } => ErrorKind::Transport,
            SessionError::Integrity { .. } => ErrorKind::Integrity,
            SessionError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            SessionError::Protocol(_) => ErrorKind::Protocol,
            SessionError::Remote(_) => ErrorKind::Remote,
            SessionError::Canceled => ErrorKind::Canceled,
            SessionError::LocalFileMissing(_) | SessionError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(SessionError::NotConnected.kind(), ErrorKind::Transport);
        assert_eq!(
            SessionError::ConnectionClosed("eof".into()).kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            SessionError::Unauthorized(UnauthorizedBody::default()).kind(),
            ErrorKind::Authorization
        );
        assert_eq!(
            SessionError::Integrity { expected: "a".into(), actual: "b".into() }.kind(),
            ErrorKind::Integrity
        );
        assert!(SessionError::Status { code: 500, message: String::new() }.is_transport());
    }

    #[test]
    fn test_unauthorized_body_wire_names() {
        let body: UnauthorizedBody = serde_json::from_str(
            r#"{"tokenRequestEndpoint":"http://h/auth/token","message":"expired"}"#,
        )
        .unwrap();
        assert_eq!(body.token_request_endpoint, "http://h/auth/token");
        assert_eq!(body.http_base, "");
        assert_eq!(body.message, "expired");
    }
}
