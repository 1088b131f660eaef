//! Shared CLI definitions for `remora` and `remorad`

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DaemonConfig;

#[derive(Debug, Parser)]
#[command(author, version, about = "Remote session client: run commands and move files through a remorad daemon")]
pub struct ClientOpts {
    /// Daemon address (remora://host:port for TLS, remora+tcp://host:port plain)
    #[arg(long)]
    pub uri: String,

    /// API key used to obtain an access token when the daemon asks for one
    #[arg(long)]
    pub api_key: Option<String>,

    /// Token endpoint to use instead of the one the daemon advertises
    #[arg(long)]
    pub token_endpoint: Option<String>,

    /// Replace an existing connection of this process
    #[arg(long)]
    pub force: bool,

    /// Client config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append session events to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// More diagnostics on stderr (repeat for more)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Debug, Subcommand)]
pub enum ClientCommand {
    /// Connect, print the remote command catalog and capabilities
    #[command(alias = "info")]
    Connect,
    /// Drop this process's connection; every other command already ends with one
    Disconnect,
    /// Run one remote command
    Run {
        /// Command line, e.g. `ls /docs`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        line: Vec<String>,
    },
    /// Read command lines from stdin until EOF
    Shell,
    /// Upload a local file
    Upload {
        source: PathBuf,
        dest: String,
        /// Leave an existing remote file alone
        #[arg(long)]
        skip_existing: bool,
    },
    /// Download a remote file
    Download { source: String, dest: PathBuf },
}

/// Daemon options; anything given here overrides the config file.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Remote session daemon")]
pub struct DaemonOpts {
    /// Daemon config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Duplex listener (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// HTTP listener (host:port)
    #[arg(long)]
    pub http_bind: Option<String>,

    /// Base URL clients should use for HTTP, when it differs from the listener
    #[arg(long)]
    pub public_http_base: Option<String>,

    /// Storage root
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Largest accepted upload in bytes (0 = unlimited)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Allowed upload extension (repeatable; none means all)
    #[arg(long = "allow-ext", action = ArgAction::Append)]
    pub allowed_extensions: Vec<String>,

    /// Accepted API key (repeatable; none means anonymous sessions)
    #[arg(long = "api-key", action = ArgAction::Append)]
    pub api_keys: Vec<String>,

    /// Plain TCP on the duplex listener instead of TLS
    #[arg(long)]
    pub insecure: bool,

    /// Path to TLS certificate (PEM)
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM)
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl DaemonOpts {
    pub fn apply(&self, cfg: &mut DaemonConfig) {
        if let Some(b) = &self.bind {
            cfg.bind = b.clone();
        }
        if let Some(b) = &self.http_bind {
            cfg.http_bind = b.clone();
        }
        if let Some(b) = &self.public_http_base {
            cfg.public_http_base = Some(b.clone());
        }
        if let Some(r) = &self.root {
            cfg.root = r.clone();
        }
        if let Some(m) = self.max_file_size {
            cfg.max_file_size = m;
        }
        if !self.allowed_extensions.is_empty() {
            cfg.allowed_extensions = self.allowed_extensions.clone();
        }
        if !self.api_keys.is_empty() {
            cfg.api_keys = self.api_keys.clone();
        }
        if self.insecure {
            cfg.insecure = true;
        }
        if self.tls_cert.is_some() {
            cfg.tls_cert = self.tls_cert.clone();
        }
        if self.tls_key.is_some() {
            cfg.tls_key = self.tls_key.clone();
        }
    }
}

/// `RUST_LOG` wins; otherwise the verbosity count picks the level.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_subcommands_parse() {
        let opts = ClientOpts::try_parse_from([
            "remora",
            "--uri",
            "remora+tcp://127.0.0.1:9031",
            "run",
            "ls",
            "-l",
            "/docs",
        ])
        .unwrap();
        match opts.command {
            ClientCommand::Run { line } => assert_eq!(line, ["ls", "-l", "/docs"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_daemon_flags_override_config() {
        let opts = DaemonOpts::try_parse_from([
            "remorad",
            "--root",
            "/srv",
            "--allow-ext",
            "txt",
            "--allow-ext",
            "md",
            "--api-key",
            "k1",
            "--insecure",
        ])
        .unwrap();
        let mut cfg = DaemonConfig::default();
        opts.apply(&mut cfg);
        assert_eq!(cfg.root, PathBuf::from("/srv"));
        assert_eq!(cfg.allowed_extensions, ["txt", "md"]);
        assert_eq!(cfg.api_keys, ["k1"]);
        assert!(cfg.insecure);
        assert_eq!(cfg.bind, "127.0.0.1:9031");
    }
}
