//! Duplex transport seam and the framed TCP/TLS implementation
//!
//! The connection proxy only sees a [`DuplexLink`]: a sender for outbound
//! envelopes, a receiver for inbound ones, and a token that closes the link
//! cleanly. The receiver yielding `None` means the transport is gone.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SessionError};
use crate::protocol::{frame, timeouts, ClientMessage, Hello, Reject, ServerMessage, Welcome};
use crate::protocol_core::{decode_json, read_frame, read_frame_timed, write_frame, write_json_frame};
use crate::url::RemoteUri;

const CHANNEL_DEPTH: usize = 64;

pub struct DuplexLink {
    pub welcome: Welcome,
    pub outbound: mpsc::Sender<ClientMessage>,
    /// `Some(Err(_))` reports why the transport died; `None` follows it
    pub inbound: mpsc::Receiver<Result<ServerMessage>>,
    /// Cancel to say goodbye and close the transport
    pub shutdown: CancellationToken,
}

#[async_trait]
pub trait DuplexConnector: Send + Sync {
    /// Open the transport and complete the authenticated handshake.
    async fn open(&self, uri: &RemoteUri, token: Option<&str>) -> Result<DuplexLink>;
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub struct FramedConnector {
    pub connect_timeout: Duration,
    pub known_hosts: PathBuf,
    pub client_version: String,
    pub hostname: String,
}

impl FramedConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            known_hosts: crate::tls::known_hosts_path(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: local_hostname(),
        }
    }

    async fn dial(&self, uri: &RemoteUri) -> Result<Box<dyn AsyncStream>> {
        let addr = format!("{}:{}", uri.host, uri.port);
        let tcp = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(SessionError::Transport(format!("connect {addr}: {e}"))),
            Err(_) => return Err(SessionError::Transport(format!("connect {addr}: timed out"))),
        };
        let _ = tcp.set_nodelay(true);
        if !uri.tls {
            return Ok(Box::new(tcp));
        }
        let cfg = crate::tls::build_client_config_tofu(&uri.host, uri.port, self.known_hosts.clone());
        let connector = TlsConnector::from(Arc::new(cfg));
        let name = crate::tls::server_name_for(&uri.host)
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(|e| SessionError::Transport(format!("tls handshake with {addr}: {e}")))?;
        Ok(Box::new(tls))
    }
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[async_trait]
impl DuplexConnector for FramedConnector {
    async fn open(&self, uri: &RemoteUri, token: Option<&str>) -> Result<DuplexLink> {
        let mut stream = self.dial(uri).await?;

        let hello = Hello {
            token: token.map(str::to_string),
            client_version: self.client_version.clone(),
            hostname: self.hostname.clone(),
        };
        write_json_frame(&mut stream, frame::HELLO, &hello).await?;
        let welcome = match read_frame_timed(&mut stream, timeouts::HANDSHAKE_MS).await? {
            Some((frame::WELCOME, payload)) => decode_json::<Welcome>(&payload)?,
            Some((frame::REJECT, payload)) => {
                let reject: Reject = decode_json(&payload)?;
                return Err(if reject.status == 401 {
                    SessionError::Unauthorized(reject.body)
                } else {
                    SessionError::Authorization(reject.body.message)
                });
            }
            Some((t, _)) => {
                return Err(SessionError::Protocol(format!("unexpected handshake frame {t}")))
            }
            None => return Err(SessionError::ConnectionClosed("closed during handshake".into())),
        };

        let (rd, wr) = tokio::io::split(stream);
        Ok(spawn_link(rd, wr, welcome))
    }
}

/// Start the reader and writer tasks for an established stream. A failed
/// write surfaces on `inbound` like any other transport loss.
fn spawn_link<R, W>(rd: R, wr: W, welcome: Welcome) -> DuplexLink
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);
    let shutdown = CancellationToken::new();

    let lost = in_tx.clone();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = write_loop(wr, out_rx, stop).await {
            tracing::debug!("duplex write failed: {e}");
            let _ = lost
                .send(Err(SessionError::ConnectionClosed(format!("write failed: {e}"))))
                .await;
        }
    });
    tokio::spawn(read_loop(rd, in_tx, shutdown.clone()));

    DuplexLink {
        welcome,
        outbound: out_tx,
        inbound: in_rx,
        shutdown,
    }
}

/// Drain `rx` into MESSAGE frames until the channel closes or `shutdown`
/// fires, then say goodbye. Both ends of the link use it. An `Err` means
/// the stream is unusable; the caller owns reporting it.
pub(crate) async fn write_loop<W, T>(
    mut wr: W,
    mut rx: mpsc::Receiver<T>,
    shutdown: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => write_json_frame(&mut wr, frame::MESSAGE, &msg).await?,
                None => break,
            },
        }
    }
    let _ = write_frame(&mut wr, frame::GOODBYE, &[]).await;
    let _ = wr.shutdown().await;
    Ok(())
}

async fn read_loop<R>(mut rd: R, tx: mpsc::Sender<Result<ServerMessage>>, shutdown: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            f = read_frame(&mut rd) => f,
        };
        match next {
            Ok(Some((frame::MESSAGE, payload))) => match decode_json::<ServerMessage>(&payload) {
                Ok(msg) => {
                    if tx.send(Ok(msg)).await.is_err() {
                        return;
                    }
                }
                // malformed envelope: drop it, keep the link
                Err(e) => tracing::warn!("dropping inbound message: {e}"),
            },
            Ok(Some((frame::GOODBYE, _))) => {
                let _ = tx
                    .send(Err(SessionError::ConnectionClosed("server closed the session".into())))
                    .await;
                return;
            }
            Ok(Some((t, _))) => tracing::warn!("ignoring unexpected frame type {t}"),
            Ok(None) => {
                let _ = tx
                    .send(Err(SessionError::ConnectionClosed("connection reset by peer".into())))
                    .await;
                return;
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}
