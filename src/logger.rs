use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Session event log. Every hook defaults to a no-op so callers only pay for
/// what a concrete logger records.
pub trait Logger: Send + Sync {
    fn connected(&self, _uri: &str, _connection_id: &str) {}
    fn disconnected(&self, _uri: &str, _reason: &str) {}
    fn credential_refreshed(&self, _server: &str) {}
    fn session_lost(&self, _server: &str, _msg: &str) {}
    fn transfer_done(&self, _direction: &str, _src: &str, _dst: &str, _bytes: u64, _seconds: f64) {}
    fn error(&self, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn connected(&self, uri: &str, connection_id: &str) {
        self.line(&format!("CONNECT uri={uri} connection={connection_id}"));
    }
    fn disconnected(&self, uri: &str, reason: &str) {
        self.line(&format!("DISCONNECT uri={uri} reason={reason}"));
    }
    fn credential_refreshed(&self, server: &str) {
        self.line(&format!("REFRESH server={server}"));
    }
    fn session_lost(&self, server: &str, msg: &str) {
        self.line(&format!("SESSION_LOST server={server} msg={msg}"));
    }
    fn transfer_done(&self, direction: &str, src: &str, dst: &str, bytes: u64, seconds: f64) {
        self.line(&format!(
            "{} src={} dst={} bytes={} seconds={:.3}",
            direction.to_ascii_uppercase(),
            src,
            dst,
            bytes,
            seconds
        ));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} msg={msg}"));
    }
}
