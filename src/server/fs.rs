//! Filesystem operations confined to the storage root
//!
//! Callers hand over raw client strings; each operation validates them through
//! the sandbox and then checks that no existing symlink along the way leads
//! out of the root. Write-style operations also pass the write gate.

use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::sandbox::{is_within, PathSandbox, SandboxError, SandboxResult, ValidatedPath};
use super::validators::WriteGate;

const TEMP_DIR: &str = ".remora-tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

pub struct SandboxedFs {
    sandbox: PathSandbox,
    gate: WriteGate,
}

impl SandboxedFs {
    pub fn new(sandbox: PathSandbox, gate: WriteGate) -> Self {
        Self { sandbox, gate }
    }

    pub fn sandbox(&self) -> &PathSandbox {
        &self.sandbox
    }

    pub fn gate(&self) -> &WriteGate {
        &self.gate
    }

    pub fn display_path(&self, path: &ValidatedPath) -> String {
        self.sandbox.display_path(path)
    }

    /// Validate `raw` and make sure the deepest existing ancestor still
    /// resolves inside the root.
    pub fn resolve(&self, raw: &str) -> SandboxResult<ValidatedPath> {
        let path = self.sandbox.validate_path(raw)?;
        let mut cursor: &Path = path.as_path();
        loop {
            match std::fs::canonicalize(cursor) {
                Ok(real) => {
                    if !is_within(self.sandbox.root(), &real) {
                        return Err(SandboxError::Authorization(format!(
                            "'{raw}' leaves the storage root through a link"
                        )));
                    }
                    break;
                }
                Err(_) => match cursor.parent() {
                    Some(parent) if is_within(self.sandbox.root(), parent) => cursor = parent,
                    _ => break,
                },
            }
        }
        Ok(path)
    }

    /// Gate check for content about to be written at `dest`.
    pub fn check_write(&self, dest: &ValidatedPath, size: u64) -> SandboxResult<()> {
        self.gate.check(dest.as_path(), size)
    }

    pub async fn read(&self, raw: &str) -> SandboxResult<Vec<u8>> {
        let p = self.resolve(raw)?;
        Ok(tokio::fs::read(&p).await?)
    }

    pub async fn write(&self, raw: &str, data: &[u8]) -> SandboxResult<()> {
        let p = self.resolve(raw)?;
        self.check_write(&p, data.len() as u64)?;
        ensure_parent(&p).await?;
        Ok(tokio::fs::write(&p, data).await?)
    }

    pub async fn open_read(&self, raw: &str) -> SandboxResult<(ValidatedPath, tokio::fs::File)> {
        let p = self.resolve(raw)?;
        let f = tokio::fs::File::open(&p).await?;
        Ok((p, f))
    }

    pub async fn create_write(&self, raw: &str, size: u64) -> SandboxResult<(ValidatedPath, tokio::fs::File)> {
        let p = self.resolve(raw)?;
        self.check_write(&p, size)?;
        ensure_parent(&p).await?;
        let f = tokio::fs::File::create(&p).await?;
        Ok((p, f))
    }

    pub async fn list(&self, raw: &str) -> SandboxResult<Vec<EntryInfo>> {
        let p = self.resolve(raw)?;
        let mut rd = tokio::fs::read_dir(&p).await?;
        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == TEMP_DIR {
                continue;
            }
            let meta = entry.metadata().await?;
            out.push(EntryInfo {
                name,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub async fn metadata(&self, raw: &str) -> SandboxResult<std::fs::Metadata> {
        let p = self.resolve(raw)?;
        Ok(tokio::fs::metadata(&p).await?)
    }

    pub async fn exists(&self, raw: &str) -> SandboxResult<bool> {
        let p = self.resolve(raw)?;
        Ok(tokio::fs::try_exists(&p).await?)
    }

    pub async fn rename(&self, from: &str, to: &str) -> SandboxResult<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        self.refuse_root(&src)?;
        let meta = tokio::fs::metadata(&src).await?;
        if meta.is_file() {
            self.check_write(&dst, meta.len())?;
        }
        ensure_parent(&dst).await?;
        Ok(tokio::fs::rename(&src, &dst).await?)
    }

    pub async fn copy(&self, from: &str, to: &str) -> SandboxResult<u64> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        let meta = tokio::fs::metadata(&src).await?;
        if !meta.is_file() {
            return Err(SandboxError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only regular files can be copied",
            )));
        }
        self.check_write(&dst, meta.len())?;
        ensure_parent(&dst).await?;
        Ok(tokio::fs::copy(&src, &dst).await?)
    }

    pub async fn create_dir(&self, raw: &str) -> SandboxResult<()> {
        let p = self.resolve(raw)?;
        Ok(tokio::fs::create_dir_all(&p).await?)
    }

    pub async fn remove_dir(&self, raw: &str, recursive: bool) -> SandboxResult<()> {
        let p = self.resolve(raw)?;
        self.refuse_root(&p)?;
        if recursive {
            Ok(tokio::fs::remove_dir_all(&p).await?)
        } else {
            Ok(tokio::fs::remove_dir(&p).await?)
        }
    }

    pub async fn remove_file(&self, raw: &str) -> SandboxResult<()> {
        let p = self.resolve(raw)?;
        Ok(tokio::fs::remove_file(&p).await?)
    }

    /// Target of the link at `raw`; the target has to be inside the root too.
    pub async fn read_link(&self, raw: &str) -> SandboxResult<ValidatedPath> {
        let link = self.sandbox.validate_path(raw)?;
        let target = tokio::fs::read_link(&link).await?;
        let absolute = if target.is_absolute() {
            target
        } else {
            link.as_path()
                .parent()
                .map(|parent| parent.join(&target))
                .unwrap_or(target)
        };
        let text = absolute.to_string_lossy();
        let validated = self.sandbox.validate_decoded(&text)?;
        if !absolute.is_absolute() || validated.as_path() != super::sandbox::lexical_normalize(&absolute) {
            return Err(SandboxError::Authorization(format!("link '{raw}' points outside the storage root")));
        }
        Ok(validated)
    }

    /// Scratch location for an incoming upload, inside the root so the final
    /// rename never crosses filesystems.
    pub async fn temp_path_for(&self, dest: &ValidatedPath) -> SandboxResult<PathBuf> {
        let dir = self.sandbox.root().join(TEMP_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        let name = dest
            .as_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".into());
        Ok(dir.join(format!("{}.{name}.part", Uuid::new_v4().simple())))
    }

    /// Move a finished temp file into place.
    pub async fn commit(&self, temp: &Path, dest: &ValidatedPath) -> SandboxResult<()> {
        if !is_within(&self.sandbox.root().join(TEMP_DIR), temp) {
            return Err(SandboxError::Authorization("temp file outside the scratch area".into()));
        }
        ensure_parent(dest).await?;
        Ok(tokio::fs::rename(temp, dest).await?)
    }

    pub fn set_current_dir(&self, _raw: &str) -> SandboxResult<()> {
        Err(SandboxError::NotSupported("changing the working directory"))
    }

    pub fn list_drives(&self) -> SandboxResult<Vec<String>> {
        Err(SandboxError::NotSupported("enumerating drives"))
    }

    pub fn create_temp_file_outside_root(&self) -> SandboxResult<PathBuf> {
        Err(SandboxError::NotSupported("temp files outside the storage root"))
    }

    fn refuse_root(&self, p: &ValidatedPath) -> SandboxResult<()> {
        if self.sandbox.is_root(p) {
            return Err(SandboxError::Authorization("the storage root itself cannot be moved or removed".into()));
        }
        Ok(())
    }
}

async fn ensure_parent(p: &ValidatedPath) -> io::Result<()> {
    match p.as_path().parent() {
        Some(parent) => tokio::fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}
