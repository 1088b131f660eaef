//! Write gating: size and extension checks
//!
//! Only operations that create or replace content consult these; reads,
//! listings and deletes never do.

use std::path::Path;

use super::sandbox::{SandboxError, SandboxResult};

#[derive(Debug, Clone, Copy)]
pub struct SizeValidator {
    /// Zero disables the check
    pub max_bytes: u64,
}

impl SizeValidator {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub fn check(&self, size: u64) -> SandboxResult<()> {
        if self.max_bytes > 0 && size > self.max_bytes {
            return Err(SandboxError::SizeLimit {
                size,
                max: self.max_bytes,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtensionValidator {
    // lowercase, without the leading dot; empty accepts everything
    allowed: Vec<String>,
}

impl ExtensionValidator {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = allowed
            .into_iter()
            .map(|e| e.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { allowed }
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    pub fn check(&self, path: &Path) -> SandboxResult<()> {
        if self.allowed.is_empty() {
            return Ok(());
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if self.allowed.iter().any(|a| *a == ext) {
            Ok(())
        } else {
            let shown = if ext.is_empty() { "(none)".to_string() } else { format!(".{ext}") };
            Err(SandboxError::ExtensionNotAllowed(shown))
        }
    }
}

/// Both validators, applied in the order a client would want to hear about:
/// extension first, then size.
#[derive(Debug, Clone)]
pub struct WriteGate {
    pub size: SizeValidator,
    pub extensions: ExtensionValidator,
}

impl WriteGate {
    pub fn new(size: SizeValidator, extensions: ExtensionValidator) -> Self {
        Self { size, extensions }
    }

    pub fn unrestricted() -> Self {
        Self::new(SizeValidator::new(0), ExtensionValidator::default())
    }

    pub fn check(&self, path: &Path, size: u64) -> SandboxResult<()> {
        self.extensions.check(path)?;
        self.size.check(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_validator() {
        let v = SizeValidator::new(10);
        assert!(v.check(10).is_ok());
        assert!(matches!(v.check(11), Err(SandboxError::SizeLimit { size: 11, max: 10 })));
        assert!(SizeValidator::new(0).check(u64::MAX).is_ok());
    }

    #[test]
    fn test_extension_validator() {
        let v = ExtensionValidator::new([".TXT", "log", " "]);
        assert_eq!(v.allowed(), ["txt", "log"]);
        assert!(v.check(Path::new("/r/a.txt")).is_ok());
        assert!(v.check(Path::new("/r/A.Log")).is_ok());
        assert!(matches!(v.check(Path::new("/r/a.exe")), Err(SandboxError::ExtensionNotAllowed(e)) if e == ".exe"));
        assert!(v.check(Path::new("/r/Makefile")).is_err());
        assert!(ExtensionValidator::default().check(Path::new("x.exe")).is_ok());
    }

    #[test]
    fn test_gate_reports_extension_first() {
        let gate = WriteGate::new(SizeValidator::new(1), ExtensionValidator::new(["txt"]));
        assert!(matches!(
            gate.check(Path::new("a.bin"), 100),
            Err(SandboxError::ExtensionNotAllowed(_))
        ));
        assert!(matches!(gate.check(Path::new("a.txt"), 100), Err(SandboxError::SizeLimit { .. })));
    }
}
