//! Frame codec shared by the client transport and the session endpoint
//!
//! Frame format: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4), little endian,
//! followed by LENGTH payload bytes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::error::{Result, SessionError};
use crate::protocol::{timeouts, MAGIC, MAX_FRAME_SIZE, VERSION};

pub const HEADER_LEN: usize = 11;

/// Validate frame payload size
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(SessionError::Protocol(format!(
            "frame payload too large: {} bytes (max: {})",
            size, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u32)> {
    if &header[0..4] != MAGIC {
        return Err(SessionError::Protocol("invalid magic in frame header".into()));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(SessionError::Protocol(format!(
            "protocol version mismatch: got {}, expected {}",
            version, VERSION
        )));
    }
    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
    Ok((frame_type, payload_len))
}

pub async fn write_frame<W>(stream: &mut W, frame_type: u8, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    validate_frame_size(payload.len())?;
    let ms = timeouts::write_deadline_ms(payload.len());
    let hdr = build_frame_header(frame_type, payload.len() as u32);
    match timeout(Duration::from_millis(ms), async {
        stream.write_all(&hdr).await?;
        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        stream.flush().await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SessionError::Transport(format!("frame write: {e}"))),
        Err(_) => Err(SessionError::Transport(format!("frame write timeout ({ms} ms)"))),
    }
}

pub async fn write_json_frame<W, T>(stream: &mut W, frame_type: u8, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    write_frame(stream, frame_type, &payload).await
}

/// Read one frame. `Ok(None)` is a clean EOF at a frame boundary.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<(u8, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; HEADER_LEN];
    match stream.read_exact(&mut hdr).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SessionError::Transport(format!("frame read: {e}"))),
    }
    let (typ, len) = parse_frame_header(&hdr)?;
    let len = len as usize;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| SessionError::Transport(format!("frame payload read: {e}")))?;
    }
    Ok(Some((typ, payload)))
}

pub async fn read_frame_timed<R>(stream: &mut R, ms: u64) -> Result<Option<(u8, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    match timeout(Duration::from_millis(ms), read_frame(stream)).await {
        Ok(res) => res,
        Err(_) => Err(SessionError::Transport(format!("frame read timeout ({ms} ms)"))),
    }
}

pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| SessionError::Protocol(format!("bad envelope: {e}")))
}
