//! remora - command-line client for a remorad session daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use remora::cli::{init_tracing, ClientCommand, ClientOpts};
use remora::config::ClientConfig;
use remora::logger::{Logger, NoopLogger, TextLogger};
use remora::progress::TransferBar;
use remora::session::{Bootstrap, RemoteSession};
use remora::transfer::{UploadOptions, UploadOutcome};
use remora::url::parse_remote_uri;

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    init_tracing(opts.verbose);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, canceling...");
        on_interrupt.cancel();
    })
    .context("install Ctrl-C handler")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let code = rt.block_on(run(opts, cancel))?;
    std::process::exit(code);
}

async fn run(opts: ClientOpts, cancel: CancellationToken) -> Result<i32> {
    let mut config = ClientConfig::load(opts.config.as_deref())?;
    if opts.log_file.is_some() {
        config.log_file = opts.log_file.clone();
    }
    let logger: Arc<dyn Logger> = match &config.log_file {
        Some(p) => match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                eprintln!("warning: cannot open log file {}: {e}", p.display());
                Arc::new(NoopLogger)
            }
        },
        None => Arc::new(NoopLogger),
    };

    let uri = parse_remote_uri(&opts.uri).with_context(|| format!("invalid daemon address: {}", opts.uri))?;
    let session = RemoteSession::new(&config, logger)?;
    if matches!(opts.command, ClientCommand::Disconnect) {
        session.close().await;
        println!("Disconnected from {uri}");
        return Ok(0);
    }
    let bootstrap = Bootstrap {
        api_key: opts.api_key.clone(),
        token_endpoint: opts.token_endpoint.clone(),
    };
    let info = session
        .connect(&uri, &bootstrap, opts.force, &cancel)
        .await
        .with_context(|| format!("connect to {uri}"))?;

    let result = match opts.command {
        ClientCommand::Disconnect => Ok(0),
        ClientCommand::Connect => {
            println!("Connected to {uri}");
            let caps = &info.capabilities;
            if caps.max_file_size > 0 {
                println!("  Max file size: {} bytes", caps.max_file_size);
            }
            if !caps.allowed_extensions.is_empty() {
                println!("  Allowed extensions: {}", caps.allowed_extensions.join(", "));
            }
            println!("Commands:");
            for c in &info.commands {
                println!("  {:<8} {}", c.name, c.summary);
            }
            Ok(0)
        }
        ClientCommand::Run { line } => run_line(&session, &line.join(" "), &cancel).await,
        ClientCommand::Shell => shell(&session, &cancel).await,
        ClientCommand::Upload {
            source,
            dest,
            skip_existing,
        } => {
            let size = std::fs::metadata(&source).map(|m| m.len()).ok();
            let bar = TransferBar::new(&format!("{} -> {dest}", source.display()), size);
            let options = UploadOptions { skip_existing };
            match session
                .upload(&source, &dest, options, Some(bar.callback()), &cancel)
                .await
            {
                Ok(UploadOutcome::Stored { bytes }) => {
                    bar.finish_success(bytes);
                    Ok(0)
                }
                Ok(UploadOutcome::Skipped) => {
                    bar.finish_error("skipped: target exists");
                    Ok(0)
                }
                Err(e) => {
                    bar.finish_error(&e.to_string());
                    Err(anyhow::Error::new(e).context("upload"))
                }
            }
        }
        ClientCommand::Download { source, dest } => {
            let bar = TransferBar::new(&format!("{source} -> {}", dest.display()), None);
            match session
                .download(&source, &dest, Some(bar.callback()), &cancel)
                .await
            {
                Ok(bytes) => {
                    bar.finish_success(bytes);
                    Ok(0)
                }
                Err(e) => {
                    bar.finish_error(&e.to_string());
                    Err(anyhow::Error::new(e).context("download"))
                }
            }
        }
    };
    session.close().await;
    result
}

async fn run_line(session: &RemoteSession, line: &str, cancel: &CancellationToken) -> Result<i32> {
    let out = session.run_command(line, cancel).await?;
    print!("{}", out.output);
    Ok(out.exit_code)
}

async fn shell(session: &RemoteSession, cancel: &CancellationToken) -> Result<i32> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(1);
    // stdin is blocking; feed lines from a dedicated thread
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    let mut last = 0;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            l = rx.recv() => match l {
                Some(l) => l,
                None => break,
            },
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        last = run_line(session, line, cancel).await?;
    }
    Ok(last)
}
