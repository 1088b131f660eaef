//! Shared protocol constants and message envelopes for the duplex channel

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"RMRA";
pub const VERSION: u16 = 1;

// Maximum frame payload size (16MB) - envelopes are small JSON documents, file
// bytes travel over HTTP
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const DEFAULT_PORT: u16 = 9031;

// Frame type IDs
pub mod frame {
    // Handshake: client sends HELLO, server answers WELCOME or REJECT
    pub const HELLO: u8 = 1;
    pub const WELCOME: u8 = 2;
    pub const REJECT: u8 = 3;
    // JSON envelope (ClientMessage / ServerMessage)
    pub const MESSAGE: u8 = 4;
    // Clean, user-initiated close
    pub const GOODBYE: u8 = 5;
}

pub mod timeouts {
    // Handshake frames must arrive within this window (ms)
    pub const HANDSHAKE_MS: u64 = 5_000;

    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 500;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 1;

    // Progress pushes are throttled to at most one per interval (ms)
    pub const PROGRESS_PUSH_MS: u64 = 100;

    // 500ms base + 1ms per 1MB payload (ceil)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        WRITE_BASE_MS + mb * PER_MB_MS
    }
}

/// Upload endpoint header names
pub mod headers {
    pub const TARGET_PATH: &str = "x-target-path";
    pub const CONNECTION_ID: &str = "x-connection-id";
    pub const CORRELATION_ID: &str = "x-correlation-id";
    pub const CONTENT_LENGTH: &str = "x-content-length";
    pub const CONTENT_BLAKE3: &str = "x-content-blake3";
    pub const SKIP_EXISTING: &str = "x-skip-existing";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub token: Option<String>,
    pub client_version: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub connection_id: String,
    pub http_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reject {
    pub status: u16,
    pub body: crate::error::UnauthorizedBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDescriptor {
    pub name: String,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub max_file_size: u64,
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    pub transfer_base: String,
}

/// CreateSession result: the remote command catalog plus capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub commands: Vec<CommandDescriptor>,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Stored,
    Skipped,
}

/// Body of a successful `POST /upload`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub status: UploadStatus,
    pub bytes: u64,
}

/// Body of every failed transfer request. `error` is a short machine code
/// ("integrity", "size_limit", "extension", "forbidden", ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RequestPayload {
    #[serde(rename_all = "camelCase")]
    CreateSession { client_version: String, hostname: String },
    #[serde(rename_all = "camelCase")]
    RunCommand { line: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceRequestType {
    IsKeyAvailable,
    ReadKey,
}

/// Client -> server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Request {
        correlation_id: Uuid,
        payload: RequestPayload,
    },
    #[serde(rename_all = "camelCase")]
    ServiceReply {
        correlation_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// HTTP status the upload was refused with, when it was refused
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
}

/// Server -> client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Response {
        correlation_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ServiceRequest {
        correlation_id: Uuid,
        request_type: ServiceRequestType,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    ProgressPush {
        correlation_id: Uuid,
        total_bytes_received_so_far: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// HTTP status the upload was refused with, when it was refused
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
}

impl ServerMessage {
    pub fn correlation_id(&self) -> Uuid {
        match self {
            ServerMessage::Response { correlation_id, .. }
            | ServerMessage::ServiceRequest { correlation_id, .. }
            | ServerMessage::ProgressPush { correlation_id, .. } => *correlation_id,
        }
    }
}
