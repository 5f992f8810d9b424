//! Hot reload of the settings file.
//!
//! Watches the directory containing the settings file and republishes a
//! validated snapshot on every change. Invalid intermediate states (partial
//! editor writes, temporarily empty values) are logged and skipped, so
//! subscribers only ever observe loadable settings.

use std::path::{Path, PathBuf};

use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::loader;
use crate::models::Settings;

/// Publishes settings snapshots to the rest of the process.
#[derive(Debug)]
pub struct ConfigService {
    path: PathBuf,
    tx: watch::Sender<Settings>,
}

impl ConfigService {
    /// Wrap an already-loaded initial snapshot. The returned receiver always
    /// holds the latest valid settings.
    pub fn new(path: PathBuf, initial: Settings) -> (Self, watch::Receiver<Settings>) {
        let (tx, rx) = watch::channel(initial);
        (Self { path, tx }, rx)
    }

    /// Run the reload watcher until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(err) = self.run(cancel).await {
                warn!(error = %err, "settings reload watcher stopped");
            }
        })
    }

    async fn run(self, cancel: CancellationToken) -> Result<(), notify::Error> {
        let (tx, mut rx) = mpsc::channel::<Event>(16);
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                if let Ok(event) = result {
                    let _ = tx.blocking_send(event);
                }
            },
            NotifyConfig::default(),
        )?;

        // Watch the containing directory: editors replace the file rather
        // than writing in place, which would drop a watch on the file
        // itself.
        let dir = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };

            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            let ours = event
                .paths
                .iter()
                .any(|path| path.file_name() == self.path.file_name());
            if !ours {
                continue;
            }

            match loader::load(&self.path) {
                Ok(settings) => {
                    info!(path = %self.path.display(), "settings reloaded");
                    self.tx.send_replace(settings);
                }
                Err(err) => {
                    warn!(error = %err, "ignoring unloadable settings change");
                }
            }
        }
    }
}
