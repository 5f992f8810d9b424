//! # uplink agent
//!
//! Watches a directory tree and mirrors every newly created file to a
//! remote FTP server, surviving restarts without losing or duplicating
//! work.
//!
//! The agent owns the wiring: it loads the settings file (generating a
//! template on first run), restores the durable upload queue, and runs the
//! two long-lived loops — the directory watcher and, whenever there is
//! pending work, the single upload worker. A settings reload restarts the
//! worker so new credentials take effect on the next run; ctrl-c cancels
//! both loops gracefully.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use uplink_config::{ConfigService, Settings};
use uplink_core::{
    DirectoryWatcher, DurableQueue, FtpSessions, RemoteTarget, TargetProvider, TransferDispatcher,
    UploadWorker, WatcherConfig,
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "uplink-agent")]
#[command(about = "Mirror new files from a directory tree to a remote FTP server")]
struct Cli {
    /// Directory tree to watch for new files
    dir: PathBuf,

    /// Path to the TOML settings file
    #[arg(short, long, env = "UPLINK_CONFIG", default_value = "uplink.toml")]
    config: PathBuf,

    /// Path of the durable upload-queue snapshot
    #[arg(long, env = "UPLINK_QUEUE", default_value = "upload-queue.json")]
    queue: PathBuf,

    /// Watch only the root directory, not its subdirectories
    #[arg(long)]
    no_recursive: bool,
}

/// Always hands the worker the latest published settings snapshot.
struct LiveTarget(watch::Receiver<Settings>);

impl TargetProvider for LiveTarget {
    fn target(&self) -> RemoteTarget {
        self.0.borrow().remote_target()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = match uplink_config::load(&cli.config) {
        Ok(settings) => settings,
        Err(err) => {
            error!(error = %err, "could not load settings");
            return ExitCode::FAILURE;
        }
    };

    match run(cli, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "agent stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, settings: Settings) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let (config_service, settings_rx) = ConfigService::new(cli.config.clone(), settings);
    let reload_task = config_service.spawn(cancel.clone());

    let queue = Arc::new(DurableQueue::open(&cli.queue));
    let worker = Arc::new(UploadWorker::new(
        Arc::clone(&queue),
        Arc::new(LiveTarget(settings_rx.clone())),
        Arc::new(FtpSessions),
        cancel.clone(),
    ));

    if !queue.is_empty() {
        info!(pending = queue.len(), "resuming persisted upload queue");
        worker.start();
    }

    // A settings reload restarts the worker so new credentials apply from
    // the next run.
    {
        let worker = Arc::clone(&worker);
        let mut settings_rx = settings_rx;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = settings_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        info!("settings changed, restarting upload worker");
                        worker.start();
                    }
                }
            }
        });
    }

    let dispatcher =
        TransferDispatcher::new(cli.dir.clone(), Arc::clone(&queue), Arc::clone(&worker));
    let mut watcher = DirectoryWatcher::new(
        cli.dir.clone(),
        dispatcher,
        WatcherConfig {
            recursive: !cli.no_recursive,
            ..WatcherConfig::default()
        },
        cancel.clone(),
    )
    .with_context(|| format!("could not watch '{}'", cli.dir.display()))?;

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    watcher.process_events().await?;

    cancel.cancel();
    reload_task.await.ok();
    Ok(())
}
