// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Strata Node
//!
//! Entry point for the `strata-node` binary. Parses CLI arguments,
//! initializes logging and runs one subcommand against a log directory.
//!
//! - `init`     create a writable log
//! - `append`   append blocks from arguments or stdin
//! - `get`      print one block, fetching it from a server if needed
//! - `info`     show the log's state
//! - `truncate` cut the log back on a new fork
//! - `serve`    replicate the log to TCP peers
//! - `clone`    download a remote log and optionally keep serving it

mod cli;
mod logging;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use strata_protocol::{Log, LogEvent, LogOptions, Mux, PublicKey};

use cli::{Commands, StrataCli};

/// How long `clone` waits for the server's tree before giving up.
const CLONE_UPDATE_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = StrataCli::parse();
    logging::init_logging(&cli.log_level, cli.log_format.into());

    match cli.command {
        Commands::Init(args) => init_log(args).await,
        Commands::Append(args) => append_blocks(args).await,
        Commands::Get(args) => get_block(args).await,
        Commands::Info(args) => show_info(args).await,
        Commands::Truncate(args) => truncate_log(args).await,
        Commands::Serve(args) => serve_log(args).await,
        Commands::Clone(args) => clone_log(args).await,
    }
}

async fn open_dir(args: &cli::DirArgs) -> Result<Log> {
    Log::open(LogOptions::dir(&args.dir))
        .await
        .with_context(|| format!("failed to open log at {}", args.dir.display()))
}

/// Creates a new writable log in an empty directory.
async fn init_log(args: cli::DirArgs) -> Result<()> {
    if args.dir.exists() {
        let mut entries = std::fs::read_dir(&args.dir)
            .with_context(|| format!("failed to read {}", args.dir.display()))?;
        if entries.next().is_some() {
            bail!("{} is not empty", args.dir.display());
        }
    }
    std::fs::create_dir_all(&args.dir)
        .with_context(|| format!("failed to create log directory: {}", args.dir.display()))?;

    let log = open_dir(&args).await?;
    log.flush()?;
    tracing::info!(dir = %args.dir.display(), "log created");

    println!("Log initialized.");
    println!("  Directory     : {}", args.dir.display());
    println!("  Public key    : {}", log.public_key().to_hex());
    println!("  Discovery key : {}", hex::encode(log.discovery_key()));
    Ok(())
}

async fn append_blocks(args: cli::AppendArgs) -> Result<()> {
    let log = open_dir(&args.log).await?;

    let blocks = if args.blocks.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut blocks = Vec::new();
        while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
            blocks.push(line);
        }
        blocks
    } else {
        args.blocks
    };
    if blocks.is_empty() {
        bail!("nothing to append");
    }

    let length = log.append(blocks.as_slice()).await.context("append failed")?;
    log.flush()?;
    tracing::info!(appended = blocks.len(), length, "blocks appended");
    println!("{length}");
    Ok(())
}

async fn get_block(args: cli::GetArgs) -> Result<()> {
    let log = open_dir(&args.log).await?;
    let _mux = match &args.connect {
        Some(addr) => Some(connect(&log, addr).await?),
        None => None,
    };

    let bytes = log
        .get_timeout(args.index, Duration::from_millis(args.timeout_ms))
        .await
        .with_context(|| format!("block {} unavailable", args.index))?;
    log.flush()?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&bytes).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

async fn show_info(args: cli::InfoArgs) -> Result<()> {
    let log = open_dir(&args.log).await?;
    let status = log.status();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    println!("Public key    : {}", status.public_key);
    println!("Discovery key : {}", status.discovery_key);
    println!("Writable      : {}", status.writable);
    println!("Length        : {}", status.length);
    println!("Byte length   : {}", status.byte_length);
    println!("Fork          : {}", status.fork);
    println!("Held          : {}/{}", status.held, status.length);
    if let Some(reorg) = log.pending_reorg() {
        println!(
            "Pending reorg : fork {} at length {} (keeps {} blocks)",
            reorg.fork, reorg.length, reorg.fork_point
        );
    }
    Ok(())
}

async fn truncate_log(args: cli::TruncateArgs) -> Result<()> {
    let log = open_dir(&args.log).await?;
    let state = log
        .truncate(args.length, args.fork)
        .await
        .context("truncate failed")?;
    log.flush()?;
    println!("length {} fork {}", state.length, state.fork);
    Ok(())
}

async fn serve_log(args: cli::ServeArgs) -> Result<()> {
    let log = open_dir(&args.log).await?;
    let events = spawn_event_logger(&log, false);
    tracing::info!(
        public_key = %log.public_key().to_hex(),
        length = log.length(),
        writable = log.is_writable(),
        "serving log"
    );
    accept_loop(&log, &args.listen).await?;
    events.abort();
    log.flush()?;
    Ok(())
}

/// Downloads a range of a remote log, then optionally serves it.
async fn clone_log(args: cli::CloneArgs) -> Result<()> {
    let public_key = PublicKey::from_hex(&args.key).context("invalid public key")?;
    std::fs::create_dir_all(&args.log.dir)
        .with_context(|| format!("failed to create log directory: {}", args.log.dir.display()))?;
    let log = Log::open(LogOptions::dir(&args.log.dir).reader_of(public_key))
        .await
        .with_context(|| format!("failed to open log at {}", args.log.dir.display()))?;
    let events = spawn_event_logger(&log, true);

    let mux = connect(&log, &args.connect).await?;
    tokio::time::timeout(CLONE_UPDATE_TIMEOUT, log.update())
        .await
        .context("server did not send its tree in time")?
        .context("update failed")?;

    let end = args.end.unwrap_or_else(|| log.length());
    tracing::info!(start = args.start, end, linear = args.linear, "downloading");
    let download = log.download(args.start, end, args.linear);
    let summary = tokio::select! {
        summary = download.wait() => summary.context("download failed")?,
        _ = shutdown_signal() => {
            tracing::info!("interrupted, keeping verified blocks");
            log.flush()?;
            return Ok(());
        }
    };
    log.flush()?;
    println!(
        "downloaded {} blocks ({} already held), length {}",
        summary.downloaded,
        summary.already_held,
        log.length()
    );

    if let Some(listen) = &args.listen {
        accept_loop(&log, listen).await?;
    }
    mux.close();
    events.abort();
    log.flush()?;
    Ok(())
}

async fn connect(log: &Log, addr: &str) -> Result<Mux> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    stream.set_nodelay(true)?;
    tracing::info!(%addr, "connected");
    Ok(log.replicate(stream))
}

/// Replicates `log` to every connection on `addr` until a shutdown signal.
async fn accept_loop(log: &Log, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind replication listener on {addr}"))?;
    tracing::info!("replication listening on {}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "set_nodelay failed");
                }
                tracing::info!(%remote, "peer connected");
                let mux = log.replicate(stream);
                tokio::spawn(async move {
                    mux.closed().await;
                    tracing::info!(%remote, "peer disconnected");
                });
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                return Ok(());
            }
        }
    }
}

/// Logs log events. With `apply_reorgs`, pending reorgs are applied as
/// soon as they are announced so a mirror follows its writer.
fn spawn_event_logger(log: &Log, apply_reorgs: bool) -> JoinHandle<()> {
    let log = log.clone();
    let mut events = log.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LogEvent::Download { index, peer, .. }) => {
                    tracing::debug!(index, peer, "block downloaded");
                }
                Ok(LogEvent::Reorg { fork, fork_point }) => {
                    tracing::warn!(fork, fork_point, "writer truncated the log");
                    if apply_reorgs {
                        match log.apply_reorg() {
                            Ok(Some(reorg)) => tracing::info!(fork = reorg.fork, length = reorg.length, "reorg applied"),
                            Ok(None) => {}
                            Err(e) => tracing::error!(error = %e, "failed to apply reorg"),
                        }
                    }
                }
                Ok(event) => tracing::info!(?event, "log event"),
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
