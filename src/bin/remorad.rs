use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use remora::cli::{init_tracing, DaemonOpts};
use remora::config::{config_dir, DaemonConfig};
use remora::server::Daemon;
use remora::tls;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(opts.verbose);

    let mut config = DaemonConfig::load(opts.config.as_deref())?;
    opts.apply(&mut config);

    // Validate root directory exists and is a directory
    if !config.root.exists() {
        anyhow::bail!("Error: Root directory does not exist: {}", config.root.display());
    }
    if !config.root.is_dir() {
        anyhow::bail!("Error: Root path is not a directory: {}", config.root.display());
    }
    let canonical_root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", config.root.display()))?;

    println!("Starting remorad:");
    println!("  Root: {}", canonical_root.display());
    println!("  Duplex: {}", config.bind);
    println!("  HTTP: {}", config.http_base());
    if config.api_keys.is_empty() {
        eprintln!("WARNING: no API keys configured, anyone who can reach the daemon gets a session");
    }
    if config.bind.starts_with("0.0.0.0") || config.http_bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the daemon to all network interfaces");
    }

    let tls_config = if config.insecure {
        eprintln!("WARNING: duplex channel is unencrypted (--insecure)");
        None
    } else {
        match &config.tls_cert {
            Some(cert) => println!("Using custom certificate: {}", cert.display()),
            None => println!(
                "Using self-signed certificate at: {}/server-cert.pem",
                config_dir().display()
            ),
        }
        Some(
            tls::load_or_generate_server_config(config.tls_cert.clone(), config.tls_key.clone())
                .context("Failed to set up TLS configuration")?,
        )
    };

    let shutdown = CancellationToken::new();
    let on_interrupt = shutdown.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        on_interrupt.cancel();
    })
    .context("install Ctrl-C handler")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(async move {
        let daemon = Daemon::bind(&config, tls_config).await?;
        daemon.serve(shutdown).await
    })
}
