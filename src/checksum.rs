//! Content checksums for transfers
//!
//! Files are hashed with blake3 in a single pass through a fixed 64 KiB
//! buffer, so memory use does not depend on file size. Digests travel as
//! lowercase hex in the `x-content-blake3` header.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::{Result, SessionError};

/// Read buffer size used for hashing
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Hash everything `reader` yields.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<(String, u64)> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.finalize().to_hex().to_string(), total))
}

/// Hex digest and byte count of a file. Blocking.
pub fn hash_file(path: &Path) -> io::Result<(String, u64)> {
    hash_reader(File::open(path)?)
}

/// [`hash_file`] on the blocking pool.
pub async fn hash_file_async(path: PathBuf) -> Result<(String, u64)> {
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| SessionError::Io(io::Error::new(io::ErrorKind::Other, e)))?
        .map_err(SessionError::Io)
}

/// Incremental hashing for bytes that arrive in chunks (download and upload
/// bodies).
#[derive(Default)]
pub struct StreamingHasher {
    inner: blake3::Hasher,
    bytes: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize_hex(&self) -> String {
        self.inner.finalize().to_hex().to_string()
    }
}

/// Compare digests case-insensitively.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}
