//! TOML configuration for the client and the daemon
//!
//! Files are optional; every field has a default and CLI flags override whatever
//! the file provides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Remora");
        }
    }
    // Unix-like default
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("remora");
    }
    PathBuf::from(".remora")
}

fn load_toml<T: for<'de> Deserialize<'de> + Default>(path: Option<&Path>, default_name: &str) -> Result<T> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (config_dir().join(default_name), false),
    };
    if !path.exists() {
        if explicit {
            anyhow::bail!("config file not found: {}", path.display());
        }
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seconds between credential monitor passes
    pub refresh_interval_secs: u64,
    /// Refresh when the token expires within this many seconds
    pub refresh_threshold_secs: u64,
    pub connect_timeout_ms: u64,
    pub http_timeout_secs: u64,
    /// Directory answering server-initiated key requests
    pub key_dir: PathBuf,
    pub log_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30,
            refresh_threshold_secs: 300,
            connect_timeout_ms: 5_000,
            http_timeout_secs: 30,
            key_dir: config_dir().join("keys"),
            log_file: None,
        }
    }
}

impl ClientConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        load_toml(path, "client.toml")
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn refresh_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_threshold_secs as i64)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Duplex session listener (host:port)
    pub bind: String,
    /// HTTP listener for auth and transfers (host:port)
    pub http_bind: String,
    /// Base URL clients use to reach the HTTP listener; derived from
    /// `http_bind` when unset
    pub public_http_base: Option<String>,
    pub root: PathBuf,
    pub max_file_size: u64,
    /// Empty means every extension is accepted
    pub allowed_extensions: Vec<String>,
    pub api_keys: Vec<String>,
    pub token_ttl_secs: u64,
    /// Plain TCP on the duplex listener
    pub insecure: bool,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9031".to_string(),
            http_bind: "127.0.0.1:9032".to_string(),
            public_http_base: None,
            root: PathBuf::from("."),
            max_file_size: 1024 * 1024 * 1024,
            allowed_extensions: Vec::new(),
            api_keys: Vec::new(),
            token_ttl_secs: 900,
            insecure: false,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        load_toml(path, "remorad.toml")
    }

    pub fn http_base(&self) -> String {
        match &self.public_http_base {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.http_bind),
        }
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_ttl_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.refresh_interval(), Duration::from_secs(30));
        assert_eq!(c.refresh_threshold(), chrono::Duration::minutes(5));
    }

    #[test]
    fn test_partial_daemon_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remorad.toml");
        std::fs::write(
            &path,
            "root = \"/srv/data\"\nmax_file_size = 1024\nallowed_extensions = [\"txt\", \"log\"]\n",
        )
        .unwrap();
        let c = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(c.root, PathBuf::from("/srv/data"));
        assert_eq!(c.max_file_size, 1024);
        assert_eq!(c.allowed_extensions, vec!["txt", "log"]);
        // untouched fields keep defaults
        assert_eq!(c.bind, "127.0.0.1:9031");
        assert_eq!(c.http_base(), "http://127.0.0.1:9032");
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ClientConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
