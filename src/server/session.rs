//! Duplex session endpoint
//!
//! Each accepted connection authenticates in the handshake, gets a connection
//! id, and is then served concurrently: requests run on their own tasks so a
//! slow command never blocks a service reply the command itself is waiting on.

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::ServerState;
use crate::error::SessionError;
use crate::protocol::{
    frame, timeouts, ClientMessage, CommandDescriptor, CommandOutput, Hello, Reject, RequestPayload,
    ServerMessage, ServiceRequestType, SessionInfo, Welcome,
};
use crate::protocol_core::{decode_json, read_frame, read_frame_timed, write_json_frame};
use crate::rpc::RpcCorrelationRegistry;
use crate::transport::write_loop;

const CHANNEL_DEPTH: usize = 64;
const SERVICE_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Remote command execution. The default catalog lives in `commands`; a real
/// deployment plugs its own dispatcher in here.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn catalog(&self) -> Vec<CommandDescriptor>;
    async fn run(&self, ctx: &CommandContext, line: &str) -> CommandOutput;
}

#[derive(Clone)]
struct ClientHandle {
    outbound: mpsc::Sender<ServerMessage>,
    services: Arc<RpcCorrelationRegistry>,
}

/// Live connections by id, for anything that needs to reach a client outside
/// its own request (progress pushes from the HTTP side, service requests).
#[derive(Default)]
pub struct ConnectionHub {
    clients: DashMap<String, ClientHandle>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, connection_id: &str, handle: ClientHandle) {
        self.clients.insert(connection_id.to_string(), handle);
    }

    fn remove(&self, connection_id: &str) -> Option<ClientHandle> {
        self.clients.remove(connection_id).map(|(_, h)| h)
    }

    fn handle(&self, connection_id: &str) -> Option<ClientHandle> {
        self.clients.get(connection_id).map(|h| h.clone())
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.clients.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Returns false when the connection is gone.
    pub async fn push_progress(
        &self,
        connection_id: &str,
        correlation_id: Uuid,
        bytes: u64,
        error: Option<String>,
    ) -> bool {
        let msg = ServerMessage::ProgressPush {
            correlation_id,
            total_bytes_received_so_far: bytes,
            error,
            status: None,
        };
        self.send_to(connection_id, msg).await
    }

    /// Tell the uploader its request was refused with `status`, in case the
    /// HTTP answer itself never reaches it.
    pub async fn push_rejection(
        &self,
        connection_id: &str,
        correlation_id: Uuid,
        bytes: u64,
        status: u16,
        message: &str,
    ) -> bool {
        let msg = ServerMessage::ProgressPush {
            correlation_id,
            total_bytes_received_so_far: bytes,
            error: Some(message.to_string()),
            status: Some(status),
        };
        self.send_to(connection_id, msg).await
    }

    async fn send_to(&self, connection_id: &str, msg: ServerMessage) -> bool {
        match self.handle(connection_id) {
            Some(handle) => handle.outbound.send(msg).await.is_ok(),
            None => false,
        }
    }

    /// Ask the client something and wait for its ServiceReply.
    pub async fn service_request(
        &self,
        connection_id: &str,
        request_type: ServiceRequestType,
        data: &str,
    ) -> crate::error::Result<Value> {
        let handle = self.handle(connection_id).ok_or(SessionError::NotConnected)?;
        let pending = handle.services.register();
        let id = pending.id;
        let msg = ServerMessage::ServiceRequest {
            correlation_id: id,
            request_type,
            data: data.to_string(),
        };
        if handle.outbound.send(msg).await.is_err() {
            handle.services.forget(id);
            return Err(SessionError::ConnectionClosed("client went away".into()));
        }
        match tokio::time::timeout(SERVICE_TIMEOUT, pending.wait()).await {
            Ok(r) => r,
            Err(_) => {
                handle.services.forget(id);
                Err(SessionError::Transport("client did not answer the service request".into()))
            }
        }
    }
}

/// What a command sees of the connection it runs on.
#[derive(Clone)]
pub struct CommandContext {
    pub connection_id: String,
    pub subject: String,
    hub: Arc<ConnectionHub>,
}

impl CommandContext {
    pub fn new(connection_id: impl Into<String>, subject: impl Into<String>, hub: Arc<ConnectionHub>) -> Self {
        Self {
            connection_id: connection_id.into(),
            subject: subject.into(),
            hub,
        }
    }

    pub async fn service_request(
        &self,
        request_type: ServiceRequestType,
        data: &str,
    ) -> crate::error::Result<Value> {
        self.hub.service_request(&self.connection_id, request_type, data).await
    }
}

pub async fn serve_duplex(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<()> {
    accept_loop(|| listener.accept(), tls, state, shutdown).await
}

async fn accept_loop<F, Fut>(
    mut accept: F,
    tls: Option<TlsAcceptor>,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = accept() => r,
        };
        let (tcp, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                // EMFILE and friends pass; keep the listener alive
                tracing::warn!("duplex accept failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let _ = tcp.set_nodelay(true);
        let state = state.clone();
        let tls = tls.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            let result = match tls {
                Some(acceptor) => match acceptor.accept(tcp).await {
                    Ok(stream) => handle_connection(stream, peer, state, shutdown).await,
                    Err(e) => Err(anyhow::anyhow!("tls accept: {e}")),
                },
                None => handle_connection(tcp, peer, state, shutdown).await,
            };
            if let Err(e) = result {
                tracing::debug!(%peer, "session ended: {e:#}");
            }
        });
    }
    Ok(())
}

async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let hello: Hello = match read_frame_timed(&mut stream, timeouts::HANDSHAKE_MS).await? {
        Some((frame::HELLO, payload)) => decode_json(&payload)?,
        Some((t, _)) => bail!("expected HELLO, got frame type {t}"),
        None => return Ok(()),
    };
    let subject = match state.issuer.verify(hello.token.as_deref()) {
        Ok(subject) => subject,
        Err(e) => {
            tracing::info!(%peer, host = %hello.hostname, "handshake rejected: {e}");
            let reject = Reject {
                status: 401,
                body: state.unauthorized_body(&e.to_string()),
            };
            write_json_frame(&mut stream, frame::REJECT, &reject).await?;
            return Ok(());
        }
    };

    let connection_id = Uuid::new_v4().to_string();
    let welcome = Welcome {
        connection_id: connection_id.clone(),
        http_base: state.http_base.clone(),
    };
    write_json_frame(&mut stream, frame::WELCOME, &welcome).await?;
    tracing::info!(%peer, connection = %connection_id, %subject, client = %hello.client_version, host = %hello.hostname, "session opened");

    let (mut rd, wr) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let services = Arc::new(RpcCorrelationRegistry::new());
    state.hub.insert(
        &connection_id,
        ClientHandle {
            outbound: tx.clone(),
            services: services.clone(),
        },
    );
    let writer_stop = shutdown.child_token();
    let writer_failed = CancellationToken::new();
    let writer = {
        let stop = writer_stop.clone();
        let failed = writer_failed.clone();
        let connection = connection_id.clone();
        tokio::spawn(async move {
            if let Err(e) = write_loop(wr, rx, stop).await {
                tracing::debug!(%connection, "duplex write failed: {e}");
                failed.cancel();
            }
        })
    };
    let ctx = CommandContext::new(connection_id.clone(), subject, state.hub.clone());

    let result = loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            _ = writer_failed.cancelled() => break Err(anyhow::anyhow!("client stopped accepting frames")),
            f = read_frame(&mut rd) => f,
        };
        match next {
            Ok(Some((frame::MESSAGE, payload))) => match decode_json::<ClientMessage>(&payload) {
                Ok(ClientMessage::Request {
                    correlation_id,
                    payload,
                }) => {
                    tokio::spawn(answer_request(state.clone(), ctx.clone(), correlation_id, payload, tx.clone()));
                }
                Ok(ClientMessage::ServiceReply {
                    correlation_id,
                    payload,
                    error,
                    ..
                }) => {
                    let result = match error {
                        Some(e) => Err(SessionError::Remote(e)),
                        None => Ok(payload.unwrap_or(Value::Null)),
                    };
                    services.complete(correlation_id, result);
                }
                Err(e) => tracing::warn!(connection = %connection_id, "dropping malformed message: {e}"),
            },
            Ok(Some((frame::GOODBYE, _))) | Ok(None) => break Ok(()),
            Ok(Some((t, _))) => tracing::warn!(connection = %connection_id, "ignoring frame type {t}"),
            Err(e) => break Err(anyhow::Error::new(e)),
        }
    };

    state.hub.remove(&connection_id);
    let aborted = services.abort_all(|| SessionError::ConnectionClosed("client went away".into()));
    drop(tx);
    // in-flight request tasks still hold senders; do not wait on them
    writer_stop.cancel();
    let _ = writer.await;
    tracing::info!(connection = %connection_id, aborted, "session closed");
    result
}

async fn answer_request(
    state: Arc<ServerState>,
    ctx: CommandContext,
    correlation_id: Uuid,
    payload: RequestPayload,
    tx: mpsc::Sender<ServerMessage>,
) {
    let result = match payload {
        RequestPayload::CreateSession {
            client_version,
            hostname,
        } => {
            tracing::debug!(connection = %ctx.connection_id, %client_version, %hostname, "create session");
            let info = SessionInfo {
                commands: state.commands.catalog(),
                capabilities: state.capabilities(),
            };
            serde_json::to_value(info).map_err(|e| e.to_string())
        }
        RequestPayload::RunCommand { line } => {
            let output = state.commands.run(&ctx, &line).await;
            serde_json::to_value(output).map_err(|e| e.to_string())
        }
    };
    let msg = match result {
        Ok(payload) => ServerMessage::Response {
            correlation_id,
            payload: Some(payload),
            error: None,
        },
        Err(error) => ServerMessage::Response {
            correlation_id,
            payload: None,
            error: Some(error),
        },
    };
    if tx.send(msg).await.is_err() {
        tracing::debug!(%correlation_id, "client left before the response");
    }
}
