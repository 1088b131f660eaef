//! File transfer client
//!
//! Uploads stream the file body over HTTP while the server reports how many
//! bytes it has taken in as `ProgressPush` messages on the duplex channel. An
//! upload is done once the server has answered the request and pushed the full
//! size, which it only does after the checksum matched. Downloads compute
//! progress locally from `content-length`.

use futures_util::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checksum::{digests_match, hash_file_async, StreamingHasher};
use crate::connection::{ConnectionProxy, ConnectionState, TransferTarget};
use crate::error::{Result, SessionError, UnauthorizedBody};
use crate::logger::Logger;
use crate::progress::{DownloadProgressRegistry, ProgressCallback, ProgressEvent, ProgressRegistry};
use crate::protocol::{headers, TransferErrorBody, UploadReceipt, UploadStatus};
use crate::token_manager::AccessTokenManager;

// Header and query values: keep '/' readable, escape the rest
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

// How long to wait for the closing progress push once the server answered
const FINAL_PUSH_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    /// Leave an existing remote file alone instead of replacing it
    pub skip_existing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Stored { bytes: u64 },
    Skipped,
}

/// A local file whose checksum has been taken and which is ready to send.
#[derive(Debug, Clone)]
pub struct PreparedUpload {
    pub path: PathBuf,
    pub size: u64,
    pub blake3: String,
}

pub struct FileTransferClient {
    http: reqwest::Client,
    proxy: ConnectionProxy,
    tokens: AccessTokenManager,
    downloads: Arc<DownloadProgressRegistry>,
    logger: Arc<dyn Logger>,
}

pub fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_ENCODE_SET).to_string()
}

impl FileTransferClient {
    pub fn new(
        proxy: ConnectionProxy,
        tokens: AccessTokenManager,
        logger: Arc<dyn Logger>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(t) = timeout {
            builder = builder.connect_timeout(t);
        }
        Ok(Self {
            http: builder.build()?,
            proxy,
            tokens,
            downloads: ProgressRegistry::new(),
            logger,
        })
    }

    pub fn download_progress(&self) -> Arc<DownloadProgressRegistry> {
        self.downloads.clone()
    }

    fn target(&self) -> Result<TransferTarget> {
        if self.proxy.state() != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        self.proxy.transfer_target().ok_or(SessionError::NotConnected)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.tokens.credential() {
            Some(c) => req.header(reqwest::header::AUTHORIZATION, c.authorization_header()),
            None => req,
        }
    }

    /// Check the local file and take its checksum. No network traffic.
    pub async fn prepare_upload(&self, path: &Path) -> Result<PreparedUpload> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            _ => return Err(SessionError::LocalFileMissing(path.to_path_buf())),
        };
        let (blake3, hashed) = hash_file_async(path.to_path_buf()).await?;
        if hashed != meta.len() {
            tracing::debug!(path = %path.display(), "file changed size while hashing");
        }
        Ok(PreparedUpload {
            path: path.to_path_buf(),
            size: hashed,
            blake3,
        })
    }

    pub async fn upload(
        &self,
        path: &Path,
        dest: &str,
        options: UploadOptions,
        on_progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        let prepared = self.prepare_upload(path).await?;
        self.upload_prepared(&prepared, dest, options, on_progress, cancel)
            .await
    }

    pub async fn upload_prepared(
        &self,
        prepared: &PreparedUpload,
        dest: &str,
        options: UploadOptions,
        on_progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        let target = self.target()?;
        if let Some(max) = target.max_file_size {
            if prepared.size > max {
                return Err(SessionError::LimitExceeded(format!(
                    "{} is {} bytes, server accepts at most {max}",
                    prepared.path.display(),
                    prepared.size
                )));
            }
        }
        let started = Instant::now();

        let id = Uuid::new_v4();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let forward: ProgressCallback = Arc::new(move |event: ProgressEvent| {
            if let Some(cb) = &on_progress {
                cb(event.clone());
            }
            let _ = events_tx.send(event);
        });
        let _registration = self
            .proxy
            .upload_progress()
            .register(id, Some(prepared.size), forward);

        let file = tokio::fs::File::open(&prepared.path)
            .await
            .map_err(|_| SessionError::LocalFileMissing(prepared.path.clone()))?;
        let body = reqwest::Body::wrap_stream(ReaderStream::with_capacity(file, 64 * 1024));
        let req = self
            .http
            .post(format!("{}/upload", target.base))
            .header(headers::TARGET_PATH, encode_path(dest))
            .header(headers::CONNECTION_ID, &target.connection_id)
            .header(headers::CORRELATION_ID, id.to_string())
            .header(headers::CONTENT_LENGTH, prepared.size.to_string())
            .header(headers::CONTENT_BLAKE3, &prepared.blake3)
            .header(headers::SKIP_EXISTING, options.skip_existing.to_string())
            .body(body);
        let send = self.authorize(req).send();
        tokio::pin!(send);

        let mut receipt: Option<UploadReceipt> = None;
        let mut pushed_all = false;
        let grace = tokio::time::sleep(Duration::MAX);
        tokio::pin!(grace);
        loop {
            if pushed_all {
                if let Some(r) = receipt {
                    self.finish_upload(prepared, dest, r.bytes, started);
                    return Ok(UploadOutcome::Stored { bytes: r.bytes });
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Canceled),
                resp = &mut send, if receipt.is_none() => {
                    let resp = resp?;
                    if !resp.status().is_success() {
                        return Err(error_from_response(resp).await);
                    }
                    let r: UploadReceipt = resp
                        .json()
                        .await
                        .map_err(|e| SessionError::Protocol(format!("upload response: {e}")))?;
                    if r.status == UploadStatus::Skipped {
                        tracing::info!(dest, "upload skipped, target exists");
                        return Ok(UploadOutcome::Skipped);
                    }
                    grace.as_mut().reset(tokio::time::Instant::now() + FINAL_PUSH_GRACE);
                    receipt = Some(r);
                }
                event = events.recv() => match event {
                    Some(ProgressEvent::Advanced { bytes, .. }) => {
                        if bytes >= prepared.size {
                            pushed_all = true;
                        }
                    }
                    Some(ProgressEvent::Failed(msg)) => {
                        if self.proxy.state() != ConnectionState::Connected {
                            return Err(SessionError::ConnectionClosed(msg));
                        }
                        // a rejected upload also answers over HTTP, with the precise error
                        if receipt.is_none() {
                            if let Ok(Ok(resp)) = tokio::time::timeout(FINAL_PUSH_GRACE, &mut send).await {
                                if !resp.status().is_success() {
                                    return Err(error_from_response(resp).await);
                                }
                            }
                        }
                        return Err(SessionError::Remote(msg));
                    }
                    Some(ProgressEvent::Rejected { status, message }) => {
                        if self.proxy.state() != ConnectionState::Connected {
                            return Err(SessionError::ConnectionClosed(message));
                        }
                        // the server may stop reading a large body before it answers over HTTP
                        if receipt.is_none() {
                            if let Ok(Ok(resp)) = tokio::time::timeout(FINAL_PUSH_GRACE, &mut send).await {
                                if !resp.status().is_success() {
                                    return Err(error_from_response(resp).await);
                                }
                            }
                        }
                        return Err(error_from_status(status, &message));
                    }
                    None => return Err(SessionError::ConnectionClosed("progress channel closed".into())),
                },
                _ = &mut grace, if receipt.is_some() => {
                    // stored and acknowledged; the closing push got lost
                    tracing::warn!(%id, "no final progress push, trusting the upload receipt");
                    pushed_all = true;
                }
            }
        }
    }

    fn finish_upload(&self, prepared: &PreparedUpload, dest: &str, bytes: u64, started: Instant) {
        let secs = started.elapsed().as_secs_f64();
        tracing::info!(src = %prepared.path.display(), dest, bytes, "upload complete");
        self.logger
            .transfer_done("upload", &prepared.path.display().to_string(), dest, bytes, secs);
    }

    /// Fetch `source` into `dest`. The file only appears at `dest` once every
    /// byte arrived and the checksum, when the server sent one, matched.
    pub async fn download(
        &self,
        source: &str,
        dest: &Path,
        on_progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let target = self.target()?;
        let started = Instant::now();
        let req = self
            .http
            .get(format!("{}/download?path={}", target.base, encode_path(source)))
            .header(headers::CONNECTION_ID, &target.connection_id);
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Canceled),
            r = self.authorize(req).send() => r?,
        };
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let total = resp.content_length();
        let expected = resp
            .headers()
            .get(headers::CONTENT_BLAKE3)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let id = Uuid::new_v4();
        let callback: ProgressCallback = on_progress.unwrap_or_else(|| Arc::new(|_: ProgressEvent| {}));
        let _registration = self.downloads.register(id, total, callback);

        let partial = PartialFile::create(dest).await?;
        let mut file = tokio::fs::File::create(&partial.path).await?;
        let mut hasher = StreamingHasher::new();
        let mut stream = resp.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(SessionError::Canceled),
                c = stream.next() => c,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            self.downloads.report(id, hasher.bytes()).await;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let received = hasher.bytes();
        if let Some(total) = total {
            if received != total {
                return Err(SessionError::Transport(format!(
                    "download truncated: {received} of {total} bytes"
                )));
            }
        }
        if let Some(expected) = expected {
            let actual = hasher.finalize_hex();
            if !digests_match(&expected, &actual) {
                return Err(SessionError::Integrity { expected, actual });
            }
        }
        partial.commit(dest).await?;

        let secs = started.elapsed().as_secs_f64();
        tracing::info!(source, dest = %dest.display(), bytes = received, "download complete");
        self.logger
            .transfer_done("download", source, &dest.display().to_string(), received, secs);
        Ok(received)
    }
}

/// Temp file next to the destination, removed unless committed.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    async fn create(dest: &Path) -> Result<Self> {
        let name = dest
            .file_name()
            .ok_or_else(|| SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file name", dest.display()),
            )))?
            .to_string_lossy()
            .into_owned();
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            path: dest.with_file_name(format!(".{name}.{}.part", Uuid::new_v4().simple())),
            committed: false,
        })
    }

    async fn commit(mut self, dest: &Path) -> Result<()> {
        tokio::fs::rename(&self.path, dest).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Map a failed transfer response onto the error taxonomy.
pub fn error_from_status(status: u16, text: &str) -> SessionError {
    if status == StatusCode::UNAUTHORIZED.as_u16() {
        let body = serde_json::from_str::<UnauthorizedBody>(text).unwrap_or(UnauthorizedBody {
            message: text.to_string(),
            ..Default::default()
        });
        return SessionError::Unauthorized(body);
    }
    let body = serde_json::from_str::<TransferErrorBody>(text).unwrap_or(TransferErrorBody {
        error: String::new(),
        message: text.to_string(),
        ..Default::default()
    });
    match status {
        403 => SessionError::Authorization(body.message),
        413 | 415 => SessionError::LimitExceeded(body.message),
        422 => SessionError::Integrity {
            expected: body.expected.unwrap_or_default(),
            actual: body.actual.unwrap_or_default(),
        },
        code => SessionError::Status {
            code,
            message: body.message,
        },
    }
}

async fn error_from_response(resp: reqwest::Response) -> SessionError {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    error_from_status(status, &text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::BearerCredential;
    use crate::error::ErrorKind;
    use crate::keystore::EmptyKeyStore;
    use crate::logger::NoopLogger;
    use crate::protocol::{ClientMessage, ServerMessage, SessionInfo, Welcome};
    use crate::token_client::TokenClient;
    use crate::token_manager::RefreshPolicy;
    use crate::transport::{DuplexConnector, DuplexLink};
    use crate::url::RemoteUri;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    struct NoTokens;

    #[async_trait]
    impl TokenClient for NoTokens {
        async fn request_token(&self, _endpoint: &str, _api_key: &str) -> Result<BearerCredential> {
            Err(SessionError::Transport("offline".into()))
        }
        async fn refresh(&self, _server_uri: &str, _current: &BearerCredential) -> Result<BearerCredential> {
            Err(SessionError::Transport("offline".into()))
        }
    }

    /// Answers every request with an empty session; `sever` kills the link.
    struct ScriptedPeer {
        http_base: String,
        to_client: parking_lot::Mutex<Option<mpsc::Sender<Result<ServerMessage>>>>,
    }

    impl ScriptedPeer {
        async fn push(&self, msg: Result<ServerMessage>) {
            let tx = self.to_client.lock().clone();
            if let Some(tx) = tx {
                let _ = tx.send(msg).await;
            }
        }

        async fn sever(&self) {
            self.push(Err(SessionError::ConnectionClosed("connection reset by peer".into())))
                .await;
        }
    }

    #[async_trait]
    impl DuplexConnector for ScriptedPeer {
        async fn open(&self, _uri: &RemoteUri, _token: Option<&str>) -> Result<DuplexLink> {
            let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(16);
            let (in_tx, in_rx) = mpsc::channel(16);
            *self.to_client.lock() = Some(in_tx.clone());
            tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    if let ClientMessage::Request { correlation_id, .. } = msg {
                        let resp = ServerMessage::Response {
                            correlation_id,
                            payload: Some(serde_json::to_value(SessionInfo::default()).unwrap()),
                            error: None,
                        };
                        if in_tx.send(Ok(resp)).await.is_err() {
                            return;
                        }
                    }
                }
            });
            Ok(DuplexLink {
                welcome: Welcome {
                    connection_id: "conn-1".into(),
                    http_base: self.http_base.clone(),
                },
                outbound: out_tx,
                inbound: in_rx,
                shutdown: CancellationToken::new(),
            })
        }
    }

    /// HTTP endpoint that swallows requests and never answers.
    async fn silent_http() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let count = accepted.clone();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });
        (base, accepted)
    }

    async fn connected_client() -> (FileTransferClient, Arc<ScriptedPeer>, Arc<AtomicUsize>) {
        let (http_base, accepted) = silent_http().await;
        let peer = Arc::new(ScriptedPeer {
            http_base,
            to_client: parking_lot::Mutex::new(None),
        });
        (client_for(peer.clone()).await, peer, accepted)
    }

    async fn client_for(peer: Arc<ScriptedPeer>) -> FileTransferClient {
        let tokens = AccessTokenManager::new(Arc::new(NoTokens), Arc::new(NoopLogger), RefreshPolicy::default());
        let proxy = ConnectionProxy::new(peer.clone(), tokens.clone(), Arc::new(EmptyKeyStore), Arc::new(NoopLogger));
        let uri = RemoteUri {
            host: "127.0.0.1".into(),
            port: 9031,
            tls: false,
        };
        proxy.connect(&uri, false, &CancellationToken::new()).await.unwrap();
        FileTransferClient::new(proxy, tokens, Arc::new(NoopLogger), None).unwrap()
    }

    /// Reads the upload's headers, rejects it over the duplex link with `status`,
    /// then keeps the request open without an HTTP answer.
    async fn rejecting_http(listener: TcpListener, peer: Arc<ScriptedPeer>, status: u16) {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = sock.read(&mut buf).await.unwrap();
            assert!(n > 0, "request ended before its headers");
            head.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8_lossy(&head).to_ascii_lowercase();
        let id = text
            .lines()
            .find_map(|l| l.strip_prefix("x-correlation-id:"))
            .map(|v| Uuid::parse_str(v.trim()).unwrap())
            .unwrap();
        peer.push(Ok(ServerMessage::ProgressPush {
            correlation_id: id,
            total_bytes_received_so_far: 0,
            error: Some("file exceeds the size limit".into()),
            status: Some(status),
        }))
        .await;
        while let Ok(n) = sock.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    }

    async fn until_registered(client: &FileTransferClient) {
        while client.proxy.upload_progress().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_missing_local_file_fails_before_any_request() {
        let (client, _peer, accepted) = connected_client().await;
        let dir = tempfile::tempdir().unwrap();
        let err = client
            .upload(
                &dir.path().join("absent.txt"),
                "absent.txt",
                UploadOptions::default(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LocalFileMissing(_)), "got {err:?}");
        // a directory is not an uploadable file either
        let err = client
            .upload(dir.path(), "d", UploadOptions::default(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::LocalFileMissing(_)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
        assert!(client.proxy.upload_progress().is_empty());
    }

    #[tokio::test]
    async fn test_canceled_upload_unregisters_progress() {
        let (client, _peer, _accepted) = connected_client().await;
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, vec![7u8; 4096]).unwrap();

        let cancel = CancellationToken::new();
        let upload = client.upload(&src, "a.txt", UploadOptions::default(), None, &cancel);
        let trigger = async {
            until_registered(&client).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(upload, trigger);
        assert!(matches!(result, Err(SessionError::Canceled)), "got {result:?}");
        assert!(client.proxy.upload_progress().is_empty());
        assert_eq!(client.proxy.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connection_loss_ends_upload_with_transport_error() {
        let (client, peer, _accepted) = connected_client().await;
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("b.txt");
        std::fs::write(&src, vec![1u8; 4096]).unwrap();

        let cancel = CancellationToken::new();
        let upload = client.upload(&src, "b.txt", UploadOptions::default(), None, &cancel);
        let trigger = async {
            until_registered(&client).await;
            peer.sever().await;
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(upload, trigger) })
            .await
            .expect("upload hung after the connection dropped");
        let err = result.unwrap_err();
        assert!(err.is_transport(), "got {err:?}");
        assert_eq!(client.proxy.state(), ConnectionState::Disconnected);
        assert!(client.proxy.upload_progress().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_push_keeps_status_without_http_answer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = Arc::new(ScriptedPeer {
            http_base: format!("http://{}", listener.local_addr().unwrap()),
            to_client: parking_lot::Mutex::new(None),
        });
        let client = client_for(peer.clone()).await;
        tokio::spawn(rejecting_http(listener, peer, 413));

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("big.bin");
        std::fs::write(&src, vec![3u8; 64 * 1024]).unwrap();
        let cancel = CancellationToken::new();
        let upload = client.upload(&src, "big.bin", UploadOptions::default(), None, &cancel);
        let err = tokio::time::timeout(Duration::from_secs(15), upload)
            .await
            .expect("upload hung after the rejection")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LimitExceeded, "got {err:?}");
        assert!(err.to_string().contains("size limit"));
        assert!(client.proxy.upload_progress().is_empty());
        assert_eq!(client.proxy.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_error_from_status() {
        let e = error_from_status(413, r#"{"error":"size_limit","message":"too big"}"#);
        assert_eq!(e.kind(), ErrorKind::LimitExceeded);
        let e = error_from_status(415, r#"{"error":"extension","message":".exe"}"#);
        assert_eq!(e.kind(), ErrorKind::LimitExceeded);
        let e = error_from_status(403, r#"{"error":"forbidden","message":"outside root"}"#);
        assert_eq!(e.kind(), ErrorKind::Authorization);
        match error_from_status(
            422,
            r#"{"error":"integrity","message":"mismatch","expected":"aa","actual":"bb"}"#,
        ) {
            SessionError::Integrity { expected, actual } => {
                assert_eq!(expected, "aa");
                assert_eq!(actual, "bb");
            }
            other => panic!("unexpected {other:?}"),
        }
        match error_from_status(401, r#"{"tokenRequestEndpoint":"http://h/auth/token"}"#) {
            SessionError::Unauthorized(b) => assert_eq!(b.token_request_endpoint, "http://h/auth/token"),
            other => panic!("unexpected {other:?}"),
        }
        match error_from_status(500, "plain text") {
            SessionError::Status { code, message } => {
                assert_eq!(code, 500);
                assert_eq!(message, "plain text");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_encode_path() {
        assert_eq!(encode_path("dir/a b.txt"), "dir/a%20b.txt");
        assert_eq!(encode_path("100%.txt"), "100%25.txt");
        assert_eq!(encode_path("ünï"), "%C3%BCn%C3%AF");
    }

    #[tokio::test]
    async fn test_partial_file_removed_unless_committed() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("sub/out.bin");
        let p = PartialFile::create(&dest).await.unwrap();
        std::fs::write(&p.path, b"x").unwrap();
        let tmp = p.path.clone();
        drop(p);
        assert!(!tmp.exists());

        let p = PartialFile::create(&dest).await.unwrap();
        std::fs::write(&p.path, b"y").unwrap();
        p.commit(&dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"y");
    }
}
