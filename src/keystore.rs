//! Local capability answering server-initiated key requests

use async_trait::async_trait;
use std::path::PathBuf;

#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn is_key_available(&self, name: &str) -> bool;
    async fn read_key(&self, name: &str) -> Option<String>;
}

/// Keys are plain files in one directory, named after the key.
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, name: &str) -> Option<PathBuf> {
        // a key name is a single file name, nothing that could walk out of dir
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        valid.then(|| self.dir.join(name))
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn is_key_available(&self, name: &str) -> bool {
        match self.key_path(name) {
            Some(p) => tokio::fs::metadata(&p).await.map(|m| m.is_file()).unwrap_or(false),
            None => false,
        }
    }

    async fn read_key(&self, name: &str) -> Option<String> {
        let p = self.key_path(name)?;
        tokio::fs::read_to_string(&p)
            .await
            .ok()
            .map(|s| s.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Store with no keys; every request is answered negatively.
pub struct EmptyKeyStore;

#[async_trait]
impl KeyStore for EmptyKeyStore {
    async fn is_key_available(&self, _name: &str) -> bool {
        false
    }
    async fn read_key(&self, _name: &str) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_key_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deploy"), "s3cret\n").unwrap();
        let store = FileKeyStore::new(dir.path());

        assert!(store.is_key_available("deploy").await);
        assert_eq!(store.read_key("deploy").await.as_deref(), Some("s3cret"));
        assert!(!store.is_key_available("missing").await);
        assert_eq!(store.read_key("missing").await, None);
    }

    #[tokio::test]
    async fn test_key_names_cannot_escape_dir() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("keys");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(dir.path().join("outside"), "x").unwrap();
        let store = FileKeyStore::new(&inner);
        assert!(!store.is_key_available("../outside").await);
        assert_eq!(store.read_key("..").await, None);
        assert_eq!(store.read_key("").await, None);
    }
}
