//! Connection proxy: one duplex session with awaitable calls
//!
//! State moves Disconnected -> Connecting -> Connected, or through
//! Reconnecting when a forced connect replaces a live session. Every state
//! change is published once on a watch channel. An unexpected transport close
//! fails all pending calls, drops the cached session info and tells every
//! upload in flight; a clean `disconnect` does none of that noisily.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SessionError};
use crate::keystore::KeyStore;
use crate::logger::Logger;
use crate::progress::{ProgressRegistry, UploadProgressRegistry};
use crate::protocol::{
    ClientMessage, CommandOutput, RequestPayload, ServerMessage, ServiceRequestType, SessionInfo,
};
use crate::rpc::RpcCorrelationRegistry;
use crate::token_manager::AccessTokenManager;
use crate::transport::{local_hostname, DuplexConnector, DuplexLink};
use crate::url::RemoteUri;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

struct Active {
    uri: RemoteUri,
    epoch: u64,
    connection_id: String,
    http_base: String,
    outbound: mpsc::Sender<ClientMessage>,
    shutdown: CancellationToken,
    receiver: Option<JoinHandle<()>>,
}

struct Shared {
    connector: Arc<dyn DuplexConnector>,
    tokens: AccessTokenManager,
    keystore: Arc<dyn KeyStore>,
    logger: Arc<dyn Logger>,
    registry: RpcCorrelationRegistry,
    uploads: Arc<UploadProgressRegistry>,
    state: watch::Sender<ConnectionState>,
    session_info: watch::Sender<Option<Arc<SessionInfo>>>,
    active: parking_lot::Mutex<Option<Active>>,
    // connect and disconnect never interleave
    lifecycle: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
    client_version: String,
    hostname: String,
}

#[derive(Clone)]
pub struct ConnectionProxy {
    shared: Arc<Shared>,
}

/// Where and as whom file transfers for the current session go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTarget {
    pub base: String,
    pub connection_id: String,
    pub max_file_size: Option<u64>,
}

impl ConnectionProxy {
    pub fn new(
        connector: Arc<dyn DuplexConnector>,
        tokens: AccessTokenManager,
        keystore: Arc<dyn KeyStore>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (session_info, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                connector,
                tokens,
                keystore,
                logger,
                registry: RpcCorrelationRegistry::new(),
                uploads: ProgressRegistry::new(),
                state,
                session_info,
                active: parking_lot::Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
                client_version: env!("CARGO_PKG_VERSION").to_string(),
                hostname: local_hostname(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Cached CreateSession result; `None` when there is no live session.
    pub fn session_info(&self) -> Option<Arc<SessionInfo>> {
        self.shared.session_info.borrow().clone()
    }

    pub fn session_info_changes(&self) -> watch::Receiver<Option<Arc<SessionInfo>>> {
        self.shared.session_info.subscribe()
    }

    pub fn remote_uri(&self) -> Option<RemoteUri> {
        self.shared.active.lock().as_ref().map(|a| a.uri.clone())
    }

    pub fn connection_id(&self) -> Option<String> {
        self.shared.active.lock().as_ref().map(|a| a.connection_id.clone())
    }

    pub fn transfer_target(&self) -> Option<TransferTarget> {
        let (connection_id, http_base) = {
            let active = self.shared.active.lock();
            let a = active.as_ref()?;
            (a.connection_id.clone(), a.http_base.clone())
        };
        let info = self.session_info();
        let caps = info.as_ref().map(|i| &i.capabilities);
        let base = match caps {
            Some(c) if !c.transfer_base.is_empty() => c.transfer_base.clone(),
            _ => http_base,
        };
        Some(TransferTarget {
            base: base.trim_end_matches('/').to_string(),
            connection_id,
            max_file_size: caps.map(|c| c.max_file_size).filter(|&m| m > 0),
        })
    }

    pub fn upload_progress(&self) -> Arc<UploadProgressRegistry> {
        self.shared.uploads.clone()
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.registry.len()
    }

    /// Open the duplex channel with the current credential and run one
    /// CreateSession round trip. With `force`, a live session is closed first.
    pub async fn connect(
        &self,
        uri: &RemoteUri,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<SessionInfo>> {
        let s = &self.shared;
        let _lifecycle = s.lifecycle.lock().await;

        let existing = s.active.lock().as_ref().map(|a| a.uri.clone());
        match existing {
            Some(current) if !force => {
                return Err(SessionError::AlreadyConnected(current.to_string()))
            }
            Some(_) => {
                s.set_state(ConnectionState::Reconnecting);
                s.close_active("reconnect").await;
            }
            None => s.set_state(ConnectionState::Connecting),
        }

        match self.establish(uri, cancel).await {
            Ok((info, connection_id)) => {
                s.session_info.send_replace(Some(info.clone()));
                s.set_state(ConnectionState::Connected);
                tracing::info!(%uri, connection = %connection_id, commands = info.commands.len(), "connected");
                s.logger.connected(&uri.to_string(), &connection_id);
                Ok(info)
            }
            Err(e) => {
                s.discard_active();
                s.set_state(ConnectionState::Disconnected);
                tracing::debug!(%uri, "connect failed: {e}");
                s.logger.error("connect", &e.to_string());
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        uri: &RemoteUri,
        cancel: &CancellationToken,
    ) -> Result<(Arc<SessionInfo>, String)> {
        let s = &self.shared;
        let token = s.tokens.credential().map(|c| c.access_token.clone());
        let link = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Canceled),
            r = s.connector.open(uri, token.as_deref()) => r?,
        };
        let DuplexLink {
            welcome,
            outbound,
            inbound,
            shutdown,
        } = link;

        let epoch = s.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let connection_id = welcome.connection_id.clone();
        *s.active.lock() = Some(Active {
            uri: uri.clone(),
            epoch,
            connection_id: welcome.connection_id,
            http_base: welcome.http_base,
            outbound: outbound.clone(),
            shutdown: shutdown.clone(),
            receiver: None,
        });
        // the session is registered before the reader can report its loss
        let receiver = tokio::spawn(receive_loop(s.clone(), epoch, inbound, outbound, shutdown));
        if let Some(a) = s.active.lock().as_mut().filter(|a| a.epoch == epoch) {
            a.receiver = Some(receiver);
        }

        let payload = RequestPayload::CreateSession {
            client_version: s.client_version.clone(),
            hostname: s.hostname.clone(),
        };
        let value = s.request(payload, cancel).await?;
        let info: SessionInfo = serde_json::from_value(value)?;
        Ok((Arc::new(info), connection_id))
    }

    /// Re-run CreateSession on the live connection and refresh the cached
    /// command catalog.
    pub async fn create_session(&self, cancel: &CancellationToken) -> Result<Arc<SessionInfo>> {
        let s = &self.shared;
        let payload = RequestPayload::CreateSession {
            client_version: s.client_version.clone(),
            hostname: s.hostname.clone(),
        };
        let value = self.call(payload, cancel).await?;
        let info = Arc::new(serde_json::from_value::<SessionInfo>(value)?);
        s.session_info.send_replace(Some(info.clone()));
        Ok(info)
    }

    pub async fn run_command(&self, line: &str, cancel: &CancellationToken) -> Result<CommandOutput> {
        let value = self
            .call(RequestPayload::RunCommand { line: line.to_string() }, cancel)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Generic request/response round trip. Fails fast without touching the
    /// network when no session is connected.
    pub async fn call(&self, payload: RequestPayload, cancel: &CancellationToken) -> Result<Value> {
        if self.state() != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        self.shared.request(payload, cancel).await
    }

    /// Close the session cleanly. Calls still pending resolve as canceled.
    /// Calling it again, or with no session, does nothing.
    pub async fn disconnect(&self) {
        let s = &self.shared;
        let _lifecycle = s.lifecycle.lock().await;
        if s.close_active("client disconnect").await {
            s.set_state(ConnectionState::Disconnected);
        }
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|cur| {
            if *cur == next {
                return false;
            }
            tracing::debug!(from = ?*cur, to = ?next, "connection state");
            *cur = next;
            true
        });
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.active.lock().as_ref().is_some_and(|a| a.epoch == epoch)
    }

    async fn request(&self, payload: RequestPayload, cancel: &CancellationToken) -> Result<Value> {
        let (epoch, outbound) = self
            .active
            .lock()
            .as_ref()
            .map(|a| (a.epoch, a.outbound.clone()))
            .ok_or(SessionError::NotConnected)?;

        let pending = self.registry.register();
        let id = pending.id;
        // a loss between the lookup above and register() would miss this call
        if !self.is_current(epoch) {
            self.registry.forget(id);
            return Err(SessionError::ConnectionClosed("connection lost".into()));
        }
        let msg = ClientMessage::Request {
            correlation_id: id,
            payload,
        };
        if outbound.send(msg).await.is_err() {
            self.registry.forget(id);
            return Err(SessionError::ConnectionClosed("link closed".into()));
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                self.registry.forget(id);
                Err(SessionError::Canceled)
            }
            r = pending.wait() => r,
        }
    }

    /// Clean close of the live session, if any. Returns whether one existed.
    async fn close_active(&self, reason: &str) -> bool {
        let Some(mut active) = self.active.lock().take() else {
            return false;
        };
        active.shutdown.cancel();
        drop(active.outbound);
        if let Some(receiver) = active.receiver.take() {
            if let Err(e) = receiver.await {
                tracing::warn!("receive task ended abnormally: {e}");
            }
        }
        let canceled = self.registry.abort_all(|| SessionError::Canceled);
        // cleared without notifying: a clean close is not a catalog drop
        self.session_info.send_if_modified(|info| {
            *info = None;
            false
        });
        tracing::info!(uri = %active.uri, canceled, "disconnected");
        self.logger.disconnected(&active.uri.to_string(), reason);
        true
    }

    /// Drop a half-open session after a failed connect.
    fn discard_active(&self) {
        if let Some(active) = self.active.lock().take() {
            active.shutdown.cancel();
        }
    }

    async fn connection_lost(&self, epoch: u64, reason: String) {
        let lost = {
            let mut active = self.active.lock();
            if !active.as_ref().is_some_and(|a| a.epoch == epoch) {
                return;
            }
            active.take()
        };
        let Some(lost) = lost else {
            return;
        };
        lost.shutdown.cancel();
        self.set_state(ConnectionState::Disconnected);
        let aborted = self
            .registry
            .abort_all(|| SessionError::ConnectionClosed(reason.clone()));
        self.session_info.send_replace(None);
        let transfers = self.uploads.abort_all(&reason).await;
        tracing::warn!(uri = %lost.uri, aborted, transfers, "connection lost: {reason}");
        self.logger.disconnected(&lost.uri.to_string(), &reason);
    }

    async fn dispatch(&self, msg: ServerMessage, outbound: &mpsc::Sender<ClientMessage>) {
        match msg {
            ServerMessage::Response {
                correlation_id,
                payload,
                error,
            } => {
                let result = match error {
                    Some(e) => Err(SessionError::Remote(e)),
                    None => Ok(payload.unwrap_or(Value::Null)),
                };
                self.registry.complete(correlation_id, result);
            }
            ServerMessage::ServiceRequest {
                correlation_id,
                request_type,
                data,
            } => {
                // answered off the receive path so a slow key store cannot stall it
                let keystore = self.keystore.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let reply =
                        answer_service_request(keystore.as_ref(), correlation_id, request_type, &data)
                            .await;
                    if outbound.send(reply).await.is_err() {
                        tracing::debug!(%correlation_id, "link closed before service reply");
                    }
                });
            }
            ServerMessage::ProgressPush {
                correlation_id,
                total_bytes_received_so_far,
                error,
                status,
            } => match (error, status) {
                (Some(e), Some(code)) => {
                    self.uploads.reject(correlation_id, code, &e).await;
                }
                (Some(e), None) => {
                    self.uploads.fail(correlation_id, &e).await;
                }
                (None, _) => {
                    self.uploads
                        .report(correlation_id, total_bytes_received_so_far)
                        .await;
                }
            },
        }
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    epoch: u64,
    mut inbound: mpsc::Receiver<Result<ServerMessage>>,
    outbound: mpsc::Sender<ClientMessage>,
    shutdown: CancellationToken,
) {
    // `shutdown` is only ever a deliberate close; transport failures of
    // either direction arrive on `inbound`
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            m = inbound.recv() => m,
        };
        match next {
            Some(Ok(msg)) => shared.dispatch(msg, &outbound).await,
            Some(Err(e)) => break e.to_string(),
            None => break "transport closed".to_string(),
        }
    };
    // a no-op when a deliberate close already took this epoch
    shared.connection_lost(epoch, reason).await;
}

pub(crate) async fn answer_service_request(
    keystore: &dyn KeyStore,
    correlation_id: uuid::Uuid,
    request_type: ServiceRequestType,
    data: &str,
) -> ClientMessage {
    let (payload, error) = match request_type {
        ServiceRequestType::IsKeyAvailable => {
            (Some(Value::Bool(keystore.is_key_available(data).await)), None)
        }
        ServiceRequestType::ReadKey => match keystore.read_key(data).await {
            Some(key) => (Some(Value::String(key)), None),
            None => (None, Some(format!("key '{data}' not available"))),
        },
    };
    ClientMessage::ServiceReply {
        correlation_id,
        payload,
        error,
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::BearerCredential;
    use crate::logger::NoopLogger;
    use crate::protocol::{Capabilities, CommandDescriptor, Welcome};
    use crate::token_client::TokenClient;
    use crate::token_manager::RefreshPolicy;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use uuid::Uuid;

    struct NoRefresh;

    #[async_trait]
    impl TokenClient for NoRefresh {
        async fn request_token(&self, _endpoint: &str, _api_key: &str) -> Result<BearerCredential> {
            Err(SessionError::Transport("offline".into()))
        }
        async fn refresh(&self, _server_uri: &str, _current: &BearerCredential) -> Result<BearerCredential> {
            Err(SessionError::Transport("offline".into()))
        }
    }

    struct MapKeyStore(HashMap<String, String>);

    #[async_trait]
    impl KeyStore for MapKeyStore {
        async fn is_key_available(&self, name: &str) -> bool {
            self.0.contains_key(name)
        }
        async fn read_key(&self, name: &str) -> Option<String> {
            self.0.get(name).cloned()
        }
    }

    /// In-memory server end of one link.
    struct Peer {
        from_client: mpsc::Receiver<ClientMessage>,
        to_client: mpsc::Sender<Result<ServerMessage>>,
    }

    #[derive(Default)]
    struct MemoryConnector {
        opened: AtomicUsize,
        peers: parking_lot::Mutex<Vec<Peer>>,
    }

    #[async_trait]
    impl DuplexConnector for MemoryConnector {
        async fn open(&self, _uri: &RemoteUri, _token: Option<&str>) -> Result<DuplexLink> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
            let (out_tx, out_rx) = mpsc::channel(64);
            let (in_tx, in_rx) = mpsc::channel(64);
            self.peers.lock().push(Peer {
                from_client: out_rx,
                to_client: in_tx,
            });
            Ok(DuplexLink {
                welcome: Welcome {
                    connection_id: format!("conn-{n}"),
                    http_base: "http://127.0.0.1:9032".into(),
                },
                outbound: out_tx,
                inbound: in_rx,
                shutdown: CancellationToken::new(),
            })
        }
    }

    fn session_info() -> SessionInfo {
        SessionInfo {
            commands: vec![CommandDescriptor {
                name: "ls".into(),
                summary: "list".into(),
            }],
            capabilities: Capabilities {
                max_file_size: 1024,
                allowed_extensions: vec![],
                transfer_base: String::new(),
            },
        }
    }

    /// Answers CreateSession and RunCommand. "hang" is never answered, "die"
    /// kills the transport. Service replies are forwarded to `replies`.
    async fn serve(mut peer: Peer, replies: Option<mpsc::UnboundedSender<ClientMessage>>) {
        while let Some(msg) = peer.from_client.recv().await {
            match msg {
                ClientMessage::Request {
                    correlation_id,
                    payload,
                } => {
                    let payload = match payload {
                        RequestPayload::CreateSession { .. } => serde_json::to_value(session_info()).unwrap(),
                        RequestPayload::RunCommand { line } if line == "hang" => continue,
                        RequestPayload::RunCommand { line } if line == "die" => {
                            let _ = peer
                                .to_client
                                .send(Err(SessionError::ConnectionClosed("connection reset by peer".into())))
                                .await;
                            return;
                        }
                        RequestPayload::RunCommand { line } => serde_json::to_value(CommandOutput {
                            exit_code: 0,
                            output: format!("ran {line}"),
                        })
                        .unwrap(),
                    };
                    let resp = ServerMessage::Response {
                        correlation_id,
                        payload: Some(payload),
                        error: None,
                    };
                    if peer.to_client.send(Ok(resp)).await.is_err() {
                        return;
                    }
                }
                reply @ ClientMessage::ServiceReply { .. } => {
                    if let Some(tx) = &replies {
                        let _ = tx.send(reply);
                    }
                }
            }
        }
    }

    fn proxy_with(connector: Arc<MemoryConnector>, keys: HashMap<String, String>) -> ConnectionProxy {
        let tokens = AccessTokenManager::new(Arc::new(NoRefresh), Arc::new(NoopLogger), RefreshPolicy::default());
        ConnectionProxy::new(connector, tokens, Arc::new(MapKeyStore(keys)), Arc::new(NoopLogger))
    }

    fn uri() -> RemoteUri {
        RemoteUri {
            host: "127.0.0.1".into(),
            port: 9031,
            tls: false,
        }
    }

    /// Connect with a serving peer; returns the channel of service replies.
    async fn connected(
        connector: &Arc<MemoryConnector>,
        proxy: &ConnectionProxy,
    ) -> (mpsc::UnboundedReceiver<ClientMessage>, mpsc::Sender<Result<ServerMessage>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = {
            let connector = connector.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    let peer = connector.peers.lock().pop();
                    if let Some(peer) = peer {
                        let push = peer.to_client.clone();
                        tokio::spawn(serve(peer, Some(tx)));
                        return push;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };
        proxy.connect(&uri(), false, &CancellationToken::new()).await.unwrap();
        (rx, watcher.await.unwrap())
    }

    #[tokio::test]
    async fn test_run_command_round_trip() {
        let connector = Arc::new(MemoryConnector::default());
        let proxy = proxy_with(connector.clone(), HashMap::new());
        let _peer = connected(&connector, &proxy).await;

        assert_eq!(proxy.state(), ConnectionState::Connected);
        assert_eq!(proxy.session_info().unwrap().commands[0].name, "ls");
        assert_eq!(proxy.connection_id().as_deref(), Some("conn-1"));
        let target = proxy.transfer_target().unwrap();
        assert_eq!(target.base, "http://127.0.0.1:9032");
        assert_eq!(target.max_file_size, Some(1024));

        let out = proxy.run_command("ls /", &CancellationToken::new()).await.unwrap();
        assert_eq!(out.output, "ran ls /");
        assert_eq!(proxy.pending_calls(), 0);
        proxy.disconnect().await;
    }

    #[tokio::test]
    async fn test_calls_fail_fast_when_disconnected() {
        let connector = Arc::new(MemoryConnector::default());
        let proxy = proxy_with(connector.clone(), HashMap::new());
        let err = proxy.run_command("ls", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        assert!(err.is_transport());
        assert!(proxy.create_session(&CancellationToken::new()).await.is_err());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 0);
        assert_eq!(proxy.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_close_aborts_all_pending() {
        let connector = Arc::new(MemoryConnector::default());
        let proxy = proxy_with(connector.clone(), HashMap::new());
        let _peer = connected(&connector, &proxy).await;
        let mut catalog = proxy.session_info_changes();
        catalog.borrow_and_update();

        let calls: Vec<_> = (0..5)
            .map(|_| {
                let proxy = proxy.clone();
                tokio::spawn(async move { proxy.run_command("hang", &CancellationToken::new()).await })
            })
            .collect();
        while proxy.pending_calls() < 5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let last = proxy.run_command("die", &CancellationToken::new()).await.unwrap_err();
        assert!(last.is_transport());
        for c in calls {
            let err = c.await.unwrap().unwrap_err();
            assert!(err.is_transport(), "got {err:?}");
        }
        assert_eq!(proxy.pending_calls(), 0);
        assert_eq!(proxy.state(), ConnectionState::Disconnected);
        assert!(proxy.session_info().is_none());
        assert!(catalog.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_double_disconnect_notifies_once() {
        let connector = Arc::new(MemoryConnector::default());
        let proxy = proxy_with(connector.clone(), HashMap::new());
        let _peer = connected(&connector, &proxy).await;
        let mut states = proxy.state_changes();
        let mut catalog = proxy.session_info_changes();
        states.borrow_and_update();
        catalog.borrow_and_update();

        proxy.disconnect().await;
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
        proxy.disconnect().await;
        assert!(!states.has_changed().unwrap());
        assert!(!catalog.has_changed().unwrap());
        assert!(proxy.session_info().is_none());
    }

    #[tokio::test]
    async fn test_clean_disconnect_cancels_pending() {
        let connector = Arc::new(MemoryConnector::default());
        let proxy = proxy_with(connector.clone(), HashMap::new());
        let _peer = connected(&connector, &proxy).await;
        let call = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.run_command("hang", &CancellationToken::new()).await })
        };
        while proxy.pending_calls() < 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        proxy.disconnect().await;
        assert!(matches!(call.await.unwrap(), Err(SessionError::Canceled)));
    }

    #[tokio::test]
    async fn test_already_connected_unless_forced() {
        let connector = Arc::new(MemoryConnector::default());
        let proxy = proxy_with(connector.clone(), HashMap::new());
        let _first = connected(&connector, &proxy).await;
        let err = proxy.connect(&uri(), false, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyConnected(_)));

        let mut states = proxy.state_changes();
        states.borrow_and_update();
        let _second = {
            let connector2 = connector.clone();
            let server = tokio::spawn(async move {
                loop {
                    let peer = connector2.peers.lock().pop();
                    if let Some(peer) = peer {
                        serve(peer, None).await;
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            });
            proxy.connect(&uri(), true, &CancellationToken::new()).await.unwrap();
            server
        };
        assert_eq!(proxy.connection_id().as_deref(), Some("conn-2"));
        assert_eq!(proxy.state(), ConnectionState::Connected);
        proxy.disconnect().await;
    }

    #[tokio::test]
    async fn test_service_request_answered_from_keystore() {
        let connector = Arc::new(MemoryConnector::default());
        let mut keys = HashMap::new();
        keys.insert("deploy".to_string(), "k3y".to_string());
        let proxy = proxy_with(connector.clone(), keys);
        let (mut replies, push) = connected(&connector, &proxy).await;

        let id = Uuid::new_v4();
        push.send(Ok(ServerMessage::ServiceRequest {
            correlation_id: id,
            request_type: ServiceRequestType::ReadKey,
            data: "deploy".into(),
        }))
        .await
        .unwrap();
        match replies.recv().await.unwrap() {
            ClientMessage::ServiceReply {
                correlation_id,
                payload,
                error,
                ..
            } => {
                assert_eq!(correlation_id, id);
                assert_eq!(payload, Some(Value::String("k3y".into())));
                assert!(error.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        // bypasses the call registry entirely
        assert_eq!(proxy.pending_calls(), 0);
        proxy.disconnect().await;
    }

    #[tokio::test]
    async fn test_progress_push_reaches_upload_registry() {
        let connector = Arc::new(MemoryConnector::default());
        let proxy = proxy_with(connector.clone(), HashMap::new());
        let (_replies, push) = connected(&connector, &proxy).await;

        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _guard = proxy.upload_progress().register(
            id,
            Some(10),
            Arc::new(move |e: crate::progress::ProgressEvent| {
                let _ = tx.send(e);
            }),
        );
        push.send(Ok(ServerMessage::ProgressPush {
            correlation_id: id,
            total_bytes_received_so_far: 10,
            error: None,
            status: None,
        }))
        .await
        .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            crate::progress::ProgressEvent::Advanced { bytes: 10, total: Some(10) }
        );
        push.send(Ok(ServerMessage::ProgressPush {
            correlation_id: id,
            total_bytes_received_so_far: 0,
            error: Some("too big".into()),
            status: Some(413),
        }))
        .await
        .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            crate::progress::ProgressEvent::Rejected {
                status: 413,
                message: "too big".into()
            }
        );
        proxy.disconnect().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_peer_write_timeout_drops_session() {
        use crate::protocol::frame;
        use crate::protocol_core::{decode_json, read_frame, write_json_frame};
        use crate::transport::FramedConnector;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let _hello = read_frame(&mut s).await.unwrap();
            let welcome = Welcome {
                connection_id: "stalled".into(),
                http_base: "http://127.0.0.1:1".into(),
            };
            write_json_frame(&mut s, frame::WELCOME, &welcome).await.unwrap();
            let (_, p) = read_frame(&mut s).await.unwrap().unwrap();
            let id = match decode_json::<ClientMessage>(&p).unwrap() {
                ClientMessage::Request { correlation_id, .. } => correlation_id,
                other => panic!("unexpected {other:?}"),
            };
            let resp = ServerMessage::Response {
                correlation_id: id,
                payload: Some(serde_json::to_value(session_info()).unwrap()),
                error: None,
            };
            write_json_frame(&mut s, frame::MESSAGE, &resp).await.unwrap();
            // keep the socket open but stop reading
            let _ = release_rx.await;
        });

        let tokens = AccessTokenManager::new(Arc::new(NoRefresh), Arc::new(NoopLogger), RefreshPolicy::default());
        let proxy = ConnectionProxy::new(
            Arc::new(FramedConnector::new(Duration::from_secs(2))),
            tokens,
            Arc::new(MapKeyStore(HashMap::new())),
            Arc::new(NoopLogger),
        );
        let uri = RemoteUri {
            host: "127.0.0.1".into(),
            port,
            tls: false,
        };
        proxy.connect(&uri, false, &CancellationToken::new()).await.unwrap();

        let small = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.run_command("pwd", &CancellationToken::new()).await })
        };
        // far more than the socket buffers take, so the write deadline trips
        let big = {
            let proxy = proxy.clone();
            let line = "x".repeat(15 * 1024 * 1024);
            tokio::spawn(async move { proxy.run_command(&line, &CancellationToken::new()).await })
        };
        let (small, big) = tokio::time::timeout(Duration::from_secs(10), async {
            (small.await.unwrap(), big.await.unwrap())
        })
        .await
        .expect("pending calls hung after the write failed");
        assert!(small.unwrap_err().is_transport());
        assert!(big.unwrap_err().is_transport());
        assert_eq!(proxy.state(), ConnectionState::Disconnected);
        assert_eq!(proxy.pending_calls(), 0);
        assert!(proxy.session_info().is_none());
        let _ = release_tx.send(());
    }

    #[tokio::test]
    async fn test_missing_key_reply_carries_error() {
        let store = MapKeyStore(HashMap::new());
        let id = Uuid::new_v4();
        match answer_service_request(&store, id, ServiceRequestType::ReadKey, "nope").await {
            ClientMessage::ServiceReply { payload, error, .. } => {
                assert!(payload.is_none());
                assert!(error.unwrap().contains("nope"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match answer_service_request(&store, id, ServiceRequestType::IsKeyAvailable, "nope").await {
            ClientMessage::ServiceReply { payload, .. } => assert_eq!(payload, Some(Value::Bool(false))),
            other => panic!("unexpected {other:?}"),
        }
    }
}
