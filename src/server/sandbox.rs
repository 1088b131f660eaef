//! Path validation against the storage root
//!
//! Every path a client sends is turned into a [`ValidatedPath`] here before it
//! can reach the filesystem. Validation is lexical: decode, normalize, resolve
//! against the root, and check containment. Symlink escapes are handled one
//! level up in `SandboxedFs`, which can touch the disk.

use percent_encoding::percent_decode_str;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

// Path comparison follows the platform's filesystem conventions
const CASE_INSENSITIVE: bool = cfg!(any(windows, target_os = "macos"));

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("access denied: {0}")]
    Authorization(String),

    #[error("not supported inside the storage root: {0}")]
    NotSupported(&'static str),

    #[error("file of {size} bytes exceeds the limit of {max} bytes")]
    SizeLimit { size: u64, max: u64 },

    #[error("extension not allowed: {0}")]
    ExtensionNotAllowed(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// An absolute path equal to or lexically nested under the storage root.
/// Only [`PathSandbox::validate_path`] creates one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPath(PathBuf);

impl ValidatedPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for ValidatedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ValidatedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct PathSandbox {
    root: PathBuf,
}

/// Collapse `.` and `..` without touching the disk. `..` at the top stays at
/// the top.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                out.push(comp.as_os_str())
            }
            Component::CurDir => {}
            Component::ParentDir => {
                let at_top = matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                );
                if !at_top {
                    out.pop();
                }
            }
        }
    }
    out
}

fn component_eq(a: Component<'_>, b: Component<'_>) -> bool {
    if CASE_INSENSITIVE {
        a.as_os_str().to_string_lossy().to_lowercase() == b.as_os_str().to_string_lossy().to_lowercase()
    } else {
        a == b
    }
}

/// True when `candidate` equals `root` or sits below it.
pub fn is_within(root: &Path, candidate: &Path) -> bool {
    let mut cand = candidate.components();
    for r in root.components() {
        match cand.next() {
            Some(c) if component_eq(r, c) => {}
            _ => return false,
        }
    }
    true
}

/// One round of percent-decoding. Whatever `%XX` survives it is part of the
/// name; containment is checked on the decoded form.
fn decode(raw: &str) -> SandboxResult<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| SandboxError::Authorization("path does not decode to UTF-8".into()))
}

impl PathSandbox {
    /// The root is made absolute and, when it exists, canonical.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref();
        let absolute = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };
        let root = std::fs::canonicalize(&absolute).unwrap_or_else(|_| lexical_normalize(&absolute));
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a client-supplied, percent-encoded path.
    pub fn validate_path(&self, raw: &str) -> SandboxResult<ValidatedPath> {
        if raw.is_empty() {
            return Err(SandboxError::Authorization("empty path".into()));
        }
        if raw.contains('\0') {
            return Err(SandboxError::Authorization("path contains NUL".into()));
        }
        self.validate_decoded(&decode(raw)?)
    }

    /// Validate a path that is already plain text, such as a link target read
    /// from disk.
    pub fn validate_decoded(&self, decoded: &str) -> SandboxResult<ValidatedPath> {
        if decoded.is_empty() {
            return Err(SandboxError::Authorization("empty path".into()));
        }
        if decoded.contains('\0') {
            return Err(SandboxError::Authorization("path contains NUL".into()));
        }
        #[cfg(windows)]
        let decoded = decoded.replace('\\', "/");

        // an absolute path already inside the root is taken as is
        let as_given = Path::new(&decoded);
        if as_given.is_absolute() {
            let normalized = lexical_normalize(as_given);
            if is_within(&self.root, &normalized) {
                return Ok(ValidatedPath(normalized));
            }
        }

        // otherwise a leading separator addresses the root itself
        let relative = decoded.strip_prefix('/').unwrap_or(&decoded);
        let resolved = lexical_normalize(&self.root.join(relative));
        if !is_within(&self.root, &resolved) {
            tracing::warn!(path = %decoded, "rejected path outside the storage root");
            return Err(SandboxError::Authorization(format!("'{decoded}' is outside the storage root")));
        }
        Ok(ValidatedPath(resolved))
    }

    /// Root-relative form for messages shown to clients, always `/`-separated.
    pub fn display_path(&self, path: &ValidatedPath) -> String {
        let rel = path.as_path().strip_prefix(&self.root).unwrap_or(path.as_path());
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        format!("/{}", parts.join("/"))
    }

    pub fn is_root(&self, path: &ValidatedPath) -> bool {
        is_within(path.as_path(), &self.root) && is_within(&self.root, path.as_path())
    }
}
