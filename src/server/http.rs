//! HTTP side of the daemon: token issuing and file transfer
//!
//! Upload bodies are streamed to a scratch file under the root, hashed on the
//! way in, and only moved into place once length and checksum match. Progress
//! goes back to the uploading client over its duplex connection.

use axum::body::{Body, BodyDataStream};
use axum::extract::{DefaultBodyLimit, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::issuer::{bearer_token, REFRESH_ROUTE, TOKEN_ROUTE};
use super::sandbox::{SandboxError, ValidatedPath};
use super::ServerState;
use crate::checksum::{digests_match, hash_file_async, StreamingHasher};
use crate::credential::BearerCredential;
use crate::error::UnauthorizedBody;
use crate::protocol::{headers, timeouts, TransferErrorBody, UploadReceipt, UploadStatus};
use crate::token_client::{RefreshRequest, RefreshResponse, TokenRequest};

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route(&format!("/{TOKEN_ROUTE}"), post(issue_token))
        .route(&format!("/{REFRESH_ROUTE}"), post(refresh_token))
        .route("/upload", post(upload))
        .route("/download", get(download))
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(UnauthorizedBody),
    Transfer { status: StatusCode, body: TransferErrorBody },
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        ApiError::Transfer {
            status,
            body: TransferErrorBody {
                error: code.to_string(),
                message: message.into(),
                ..Default::default()
            },
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Transfer { status, .. } => *status,
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::Unauthorized(body) => &body.message,
            ApiError::Transfer { body, .. } => &body.message,
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(e: SandboxError) -> Self {
        let message = e.to_string();
        match e {
            SandboxError::Authorization(_) => Self::new(StatusCode::FORBIDDEN, "forbidden", message),
            SandboxError::NotSupported(_) => Self::new(StatusCode::BAD_REQUEST, "not_supported", message),
            SandboxError::SizeLimit { .. } => Self::new(StatusCode::PAYLOAD_TOO_LARGE, "size_limit", message),
            SandboxError::ExtensionNotAllowed(_) => {
                Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, "extension", message)
            }
            SandboxError::Io(io) => match io.kind() {
                std::io::ErrorKind::NotFound => Self::new(StatusCode::NOT_FOUND, "not_found", message),
                std::io::ErrorKind::AlreadyExists => Self::new(StatusCode::CONFLICT, "exists", message),
                _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "io", message),
            },
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        SandboxError::Io(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(body) => (StatusCode::UNAUTHORIZED, Json(body)).into_response(),
            ApiError::Transfer { status, body } => (status, Json(body)).into_response(),
        }
    }
}

fn authorize(state: &ServerState, headers: &HeaderMap) -> Result<String, ApiError> {
    let value = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    state
        .issuer
        .verify(bearer_token(value))
        .map_err(|e| ApiError::Unauthorized(state.unauthorized_body(&e.to_string())))
}

async fn issue_token(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<BearerCredential>, ApiError> {
    state
        .issuer
        .issue(&req.api_key)
        .map(Json)
        .map_err(|e| ApiError::Unauthorized(state.unauthorized_body(&e.to_string())))
}

async fn refresh_token(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, ApiError> {
    match state.issuer.refresh(&req.refresh_token) {
        Ok((access_token, refresh_token)) => Ok(Json(RefreshResponse {
            access_token,
            refresh_token,
        })),
        Err(e) => {
            tracing::info!("refresh refused: {e}");
            Err(ApiError::Unauthorized(state.unauthorized_body(&e.to_string())))
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

struct UploadRequest {
    target: String,
    connection_id: Option<String>,
    correlation_id: Option<Uuid>,
    length: u64,
    blake3: Option<String>,
    skip_existing: bool,
}

impl UploadRequest {
    fn from_headers(h: &HeaderMap) -> Result<Self, ApiError> {
        let target = header_str(h, headers::TARGET_PATH)
            .ok_or_else(|| ApiError::bad_request(format!("missing {}", headers::TARGET_PATH)))?
            .to_string();
        let length = header_str(h, headers::CONTENT_LENGTH)
            .ok_or_else(|| ApiError::bad_request(format!("missing {}", headers::CONTENT_LENGTH)))?
            .parse::<u64>()
            .map_err(|e| ApiError::bad_request(format!("bad {}: {e}", headers::CONTENT_LENGTH)))?;
        let correlation_id = match header_str(h, headers::CORRELATION_ID) {
            Some(v) => Some(
                Uuid::parse_str(v)
                    .map_err(|e| ApiError::bad_request(format!("bad {}: {e}", headers::CORRELATION_ID)))?,
            ),
            None => None,
        };
        Ok(Self {
            target,
            connection_id: header_str(h, headers::CONNECTION_ID).map(str::to_string),
            correlation_id,
            length,
            blake3: header_str(h, headers::CONTENT_BLAKE3).map(str::to_ascii_lowercase),
            skip_existing: header_str(h, headers::SKIP_EXISTING)
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
        })
    }
}

/// Progress back-channel for one upload. Silent when the request did not name
/// a live connection.
struct ProgressSink<'a> {
    state: &'a ServerState,
    route: Option<(String, Uuid)>,
    last: Option<Instant>,
}

impl<'a> ProgressSink<'a> {
    fn new(state: &'a ServerState, req: &UploadRequest) -> Self {
        let route = match (&req.connection_id, req.correlation_id) {
            (Some(conn), Some(id)) => Some((conn.clone(), id)),
            _ => None,
        };
        Self { state, route, last: None }
    }

    async fn push(&mut self, bytes: u64, error: Option<String>) {
        if let Some((conn, id)) = &self.route {
            if !self.state.hub.push_progress(conn, *id, bytes, error).await {
                tracing::debug!(connection = %conn, "uploader's connection is gone");
            }
            self.last = Some(Instant::now());
        }
    }

    /// Tells the uploader why the request failed before its body is drained.
    async fn reject(&mut self, status: StatusCode, message: &str) {
        if let Some((conn, id)) = &self.route {
            if !self.state.hub.push_rejection(conn, *id, 0, status.as_u16(), message).await {
                tracing::debug!(connection = %conn, "uploader's connection is gone");
            }
        }
    }

    async fn throttled(&mut self, bytes: u64) {
        let due = self
            .last
            .map_or(true, |t| t.elapsed() >= Duration::from_millis(timeouts::PROGRESS_PUSH_MS));
        if due {
            self.push(bytes, None).await;
        }
    }
}

/// Removes the scratch file unless the upload was committed.
struct ScratchFile {
    path: PathBuf,
    committed: bool,
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn upload(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadReceipt>, ApiError> {
    let subject = authorize(&state, &headers)?;
    let req = UploadRequest::from_headers(&headers)?;
    let mut sink = ProgressSink::new(&state, &req);
    let mut stream = body.into_data_stream();
    let result = store_upload(&state, &req, &mut sink, &mut stream).await;
    if let Err(e) = &result {
        tracing::warn!(%subject, target = %req.target, "upload failed: {}", e.message());
        // the drain below gives up on large bodies and the client may never see the response
        sink.reject(e.status(), e.message()).await;
    }
    drain(&mut stream, DRAIN_LIMIT).await;
    result.map(Json)
}

const DRAIN_LIMIT: u64 = 8 * 1024 * 1024;

async fn drain(stream: &mut BodyDataStream, mut budget: u64) {
    while budget > 0 {
        match stream.next().await {
            Some(Ok(chunk)) => budget = budget.saturating_sub(chunk.len() as u64),
            _ => break,
        }
    }
}

async fn store_upload(
    state: &ServerState,
    req: &UploadRequest,
    sink: &mut ProgressSink<'_>,
    stream: &mut BodyDataStream,
) -> Result<UploadReceipt, ApiError> {
    let dest = state.fs.resolve(&req.target)?;
    state.fs.check_write(&dest, req.length)?;
    if req.skip_existing && tokio::fs::try_exists(&dest).await? {
        tracing::info!(target = %state.fs.display_path(&dest), "target exists, skipping upload");
        return Ok(UploadReceipt {
            status: UploadStatus::Skipped,
            bytes: 0,
        });
    }

    let mut scratch = ScratchFile {
        path: state.fs.temp_path_for(&dest).await?,
        committed: false,
    };
    let mut file = tokio::fs::File::create(&scratch.path).await?;
    let mut hasher = StreamingHasher::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ApiError::bad_request(format!("upload body: {e}")))?;
        if hasher.bytes() + chunk.len() as u64 > req.length {
            return Err(ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "length_mismatch",
                format!("body exceeds the declared {} bytes", req.length),
            ));
        }
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        if hasher.bytes() < req.length {
            sink.throttled(hasher.bytes()).await;
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    let received = hasher.bytes();
    if received != req.length {
        return Err(ApiError::bad_request(format!(
            "body ended after {received} of {} bytes",
            req.length
        )));
    }
    let actual = hasher.finalize_hex();
    if let Some(expected) = &req.blake3 {
        if !digests_match(expected, &actual) {
            return Err(ApiError::Transfer {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                body: TransferErrorBody {
                    error: "integrity".into(),
                    message: format!("checksum mismatch for {}", state.fs.display_path(&dest)),
                    expected: Some(expected.clone()),
                    actual: Some(actual),
                },
            });
        }
    }

    state.fs.commit(&scratch.path, &dest).await?;
    scratch.committed = true;
    sink.push(received, None).await;
    tracing::info!(target = %state.fs.display_path(&dest), bytes = received, "upload stored");
    Ok(UploadReceipt {
        status: UploadStatus::Stored,
        bytes: received,
    })
}

/// Value of `key` in a query string, still percent-encoded. The sandbox
/// does the one and only decode.
fn raw_query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

async fn download(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    let raw = query
        .as_deref()
        .and_then(|q| raw_query_param(q, "path"))
        .ok_or_else(|| ApiError::bad_request("missing path query parameter".to_string()))?;
    let (path, file) = state.fs.open_read(raw).await?;
    let meta = file.metadata().await?;
    if !meta.is_file() {
        return Err(ApiError::bad_request(format!("{} is not a file", state.fs.display_path(&path))));
    }
    let digest = checksum_of(&path).await?;
    tracing::info!(source = %state.fs.display_path(&path), bytes = meta.len(), "serving download");

    let body = Body::from_stream(ReaderStream::with_capacity(file, crate::checksum::HASH_BUFFER_SIZE));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, meta.len().to_string()),
        ],
        [(headers::CONTENT_BLAKE3, digest)],
        body,
    )
        .into_response())
}

async fn checksum_of(path: &ValidatedPath) -> Result<String, ApiError> {
    hash_file_async(path.as_path().to_path_buf())
        .await
        .map(|(digest, _)| digest)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "io", e.to_string()))
}
