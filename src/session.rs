//! Client facade wiring credentials, the connection proxy and transfers
//!
//! A process holds at most one `RemoteSession`, which holds at most one live
//! connection.

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::connection::{ConnectionProxy, ConnectionState};
use crate::error::{Result, SessionError};
use crate::keystore::{FileKeyStore, KeyStore};
use crate::logger::Logger;
use crate::progress::ProgressCallback;
use crate::protocol::{CommandOutput, SessionInfo};
use crate::token_client::{HttpTokenClient, TokenClient};
use crate::token_manager::{AccessTokenManager, RefreshPolicy};
use crate::transfer::{FileTransferClient, UploadOptions, UploadOutcome};
use crate::transport::{DuplexConnector, FramedConnector};
use crate::url::RemoteUri;

/// How to authenticate when the server turns the handshake down.
#[derive(Debug, Clone, Default)]
pub struct Bootstrap {
    pub api_key: Option<String>,
    /// Overrides the endpoint advertised in the 401 body
    pub token_endpoint: Option<String>,
}

pub struct RemoteSession {
    tokens: AccessTokenManager,
    token_client: Arc<dyn TokenClient>,
    proxy: ConnectionProxy,
    transfers: FileTransferClient,
    logger: Arc<dyn Logger>,
}

/// `scheme://host:port` part of a URL.
pub fn origin_of(url: &str) -> String {
    match url.find("://") {
        Some(i) => {
            let rest = &url[i + 3..];
            let end = rest.find('/').map(|j| i + 3 + j).unwrap_or(url.len());
            url[..end].to_string()
        }
        None => url.trim_end_matches('/').to_string(),
    }
}

impl RemoteSession {
    pub fn new(config: &ClientConfig, logger: Arc<dyn Logger>) -> Result<Self> {
        let connector = Arc::new(FramedConnector::new(config.connect_timeout()));
        let token_client = Arc::new(HttpTokenClient::new(config.http_timeout())?);
        let keystore = Arc::new(FileKeyStore::new(&config.key_dir));
        let policy = RefreshPolicy {
            interval: config.refresh_interval(),
            threshold: config.refresh_threshold(),
        };
        Self::with_parts(connector, token_client, keystore, logger, policy, config)
    }

    pub fn with_parts(
        connector: Arc<dyn DuplexConnector>,
        token_client: Arc<dyn TokenClient>,
        keystore: Arc<dyn KeyStore>,
        logger: Arc<dyn Logger>,
        policy: RefreshPolicy,
        config: &ClientConfig,
    ) -> Result<Self> {
        let tokens = AccessTokenManager::new(token_client.clone(), logger.clone(), policy);
        let proxy = ConnectionProxy::new(connector, tokens.clone(), keystore, logger.clone());
        let transfers = FileTransferClient::new(
            proxy.clone(),
            tokens.clone(),
            logger.clone(),
            Some(config.connect_timeout()),
        )?;
        Ok(Self {
            tokens,
            token_client,
            proxy,
            transfers,
            logger,
        })
    }

    pub fn tokens(&self) -> &AccessTokenManager {
        &self.tokens
    }

    pub fn proxy(&self) -> &ConnectionProxy {
        &self.proxy
    }

    pub fn transfers(&self) -> &FileTransferClient {
        &self.transfers
    }

    pub fn state(&self) -> ConnectionState {
        self.proxy.state()
    }

    /// Connect with the current credential. A 401 from the server is answered
    /// once by requesting a token with the API key, then connecting again.
    pub async fn connect(
        &self,
        uri: &RemoteUri,
        bootstrap: &Bootstrap,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<SessionInfo>> {
        self.tokens.start();
        let body = match self.proxy.connect(uri, force, cancel).await {
            Err(SessionError::Unauthorized(body)) if bootstrap.api_key.is_some() => body,
            other => return other,
        };
        let endpoint = bootstrap
            .token_endpoint
            .clone()
            .unwrap_or_else(|| body.token_request_endpoint.clone());
        if endpoint.is_empty() {
            return Err(SessionError::Unauthorized(body));
        }
        let api_key = bootstrap.api_key.as_deref().unwrap_or_default();
        tracing::info!(%endpoint, "requesting access token");
        let credential = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Canceled),
            r = self.token_client.request_token(&endpoint, api_key) => r?,
        };
        let server = if body.http_base.is_empty() {
            origin_of(&endpoint)
        } else {
            body.http_base.clone()
        };
        self.tokens.set_credential(Some(credential), &server).await;
        self.proxy.connect(uri, force, cancel).await
    }

    pub async fn run_command(&self, line: &str, cancel: &CancellationToken) -> Result<CommandOutput> {
        self.proxy.run_command(line, cancel).await
    }

    pub async fn upload(
        &self,
        source: &Path,
        dest: &str,
        options: UploadOptions,
        on_progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        let result = self
            .transfers
            .upload(source, dest, options, on_progress, cancel)
            .await;
        if let Err(e) = &result {
            self.logger.error("upload", &e.to_string());
        }
        result
    }

    pub async fn download(
        &self,
        source: &str,
        dest: &Path,
        on_progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let result = self.transfers.download(source, dest, on_progress, cancel).await;
        if let Err(e) = &result {
            self.logger.error("download", &e.to_string());
        }
        result
    }

    pub async fn disconnect(&self) {
        self.proxy.disconnect().await;
    }

    /// Disconnect and stop the credential monitor.
    pub async fn close(&self) {
        self.proxy.disconnect().await;
        self.tokens.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_of() {
        assert_eq!(origin_of("http://h:9032/auth/token"), "http://h:9032");
        assert_eq!(origin_of("https://h"), "https://h");
        assert_eq!(origin_of("h:1/"), "h:1");
    }
}
