//! Session daemon: duplex command channel plus HTTP transfer endpoints over a
//! sandboxed storage root.

pub mod commands;
pub mod fs;
pub mod http;
pub mod issuer;
pub mod sandbox;
pub mod session;
pub mod validators;

use anyhow::{Context, Result};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::error::UnauthorizedBody;
use crate::protocol::Capabilities;
use crate::token_client::join_url;
use commands::BuiltinCommands;
use fs::SandboxedFs;
use issuer::{TokenIssuer, TOKEN_ROUTE};
use sandbox::PathSandbox;
use session::{CommandHandler, ConnectionHub};
use validators::{ExtensionValidator, SizeValidator, WriteGate};

/// Everything a request handler on either listener needs.
pub struct ServerState {
    pub fs: Arc<SandboxedFs>,
    pub issuer: TokenIssuer,
    pub hub: Arc<ConnectionHub>,
    pub commands: Arc<dyn CommandHandler>,
    pub http_base: String,
}

impl ServerState {
    pub fn capabilities(&self) -> Capabilities {
        let gate = self.fs.gate();
        Capabilities {
            max_file_size: gate.size.max_bytes,
            allowed_extensions: gate.extensions.allowed().to_vec(),
            transfer_base: self.http_base.clone(),
        }
    }

    pub fn unauthorized_body(&self, message: &str) -> UnauthorizedBody {
        UnauthorizedBody {
            token_request_endpoint: join_url(&self.http_base, TOKEN_ROUTE),
            http_base: self.http_base.clone(),
            message: message.to_string(),
        }
    }
}

pub struct Daemon {
    duplex: TcpListener,
    http: TcpListener,
    tls: Option<TlsAcceptor>,
    state: Arc<ServerState>,
}

impl Daemon {
    /// Bind both listeners. Without a TLS config the duplex listener speaks
    /// plain TCP.
    pub async fn bind(config: &DaemonConfig, tls: Option<rustls::ServerConfig>) -> Result<Self> {
        let sandbox = PathSandbox::new(&config.root)
            .with_context(|| format!("storage root {}", config.root.display()))?;
        if !sandbox.root().is_dir() {
            anyhow::bail!("storage root is not a directory: {}", sandbox.root().display());
        }
        let gate = WriteGate::new(
            SizeValidator::new(config.max_file_size),
            ExtensionValidator::new(&config.allowed_extensions),
        );
        let fs = Arc::new(SandboxedFs::new(sandbox, gate));

        let duplex = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("bind duplex listener {}", config.bind))?;
        let http = TcpListener::bind(&config.http_bind)
            .await
            .with_context(|| format!("bind http listener {}", config.http_bind))?;
        let http_base = match config.public_http_base {
            Some(_) => config.http_base(),
            None => format!("http://{}", http.local_addr()?),
        };

        let issuer = TokenIssuer::new(config.api_keys.clone(), config.token_ttl());
        if !issuer.auth_required() {
            tracing::warn!("no api keys configured; sessions are anonymous");
        }
        let state = Arc::new(ServerState {
            commands: Arc::new(BuiltinCommands::new(fs.clone())),
            fs,
            issuer,
            hub: Arc::new(ConnectionHub::new()),
            http_base,
        });
        Ok(Self {
            duplex,
            http,
            tls: tls.map(|cfg| TlsAcceptor::from(Arc::new(cfg))),
            state,
        })
    }

    pub fn duplex_addr(&self) -> Result<SocketAddr> {
        Ok(self.duplex.local_addr()?)
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.http.local_addr()?)
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Run both listeners until `shutdown` fires or one of them fails.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            duplex = %self.duplex.local_addr()?,
            http = %self.state.http_base,
            root = %self.state.fs.sandbox().root().display(),
            tls = self.tls.is_some(),
            "daemon listening"
        );
        let app = http::router(self.state.clone());
        let stop = shutdown.clone();
        let http = axum::serve(self.http, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .into_future();
        let duplex = session::serve_duplex(self.duplex, self.tls, self.state, shutdown.clone());
        let result = tokio::select! {
            r = http => r.context("http listener"),
            r = duplex => r,
        };
        shutdown.cancel();
        result
    }
}
