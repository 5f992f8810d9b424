//! Recursive directory watcher.
//!
//! A thin wrapper around `notify` that keeps a whole directory tree covered
//! as it grows. Every directory gets its own non-recursive watch recorded in
//! a [`WatchRegistry`], so the registry always mirrors true coverage and a
//! directory that disappears can be invalidated without touching its
//! siblings. Newly created subdirectories are registered from the event
//! loop itself; qualifying file creations are handed to the
//! [`TransferDispatcher`].

use std::path::{Path, PathBuf};

use notify::event::Flag;
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::dispatch::TransferDispatcher;
use crate::error::Result;
use crate::registry::{WatchId, WatchRegistry};

/// Knobs for the watch loop.
#[derive(Clone, Debug)]
pub struct WatcherConfig {
    /// Register every subdirectory, present and future, beneath the root.
    pub recursive: bool,
    /// Capacity of the channel between the notify callback and the loop.
    pub channel_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            channel_capacity: 1024,
        }
    }
}

enum WatchMessage {
    Event(Event),
    Error(notify::Error),
}

/// Observes a directory tree and forwards qualifying creations downstream.
pub struct DirectoryWatcher {
    root: PathBuf,
    recursive: bool,
    registry: WatchRegistry,
    watcher: RecommendedWatcher,
    rx: mpsc::Receiver<WatchMessage>,
    dispatcher: TransferDispatcher,
    cancel: CancellationToken,
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("root", &self.root)
            .field("recursive", &self.recursive)
            .field("watched_dirs", &self.registry.len())
            .finish()
    }
}

impl DirectoryWatcher {
    /// Create the watcher and establish coverage of `root` (recursively,
    /// unless configured otherwise).
    pub fn new(
        root: PathBuf,
        dispatcher: TransferDispatcher,
        config: WatcherConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let message = match result {
                    Ok(event) => WatchMessage::Event(event),
                    Err(err) => WatchMessage::Error(err),
                };
                // The callback runs on notify's own thread; a full channel
                // applies backpressure rather than dropping events.
                let _ = tx.blocking_send(message);
            },
            NotifyConfig::default(),
        )?;

        let mut this = Self {
            root: root.clone(),
            recursive: config.recursive,
            registry: WatchRegistry::new(),
            watcher,
            rx,
            dispatcher,
            cancel,
        };

        // Watching the root itself must succeed; coverage of an unreadable
        // subdirectory is best-effort.
        this.register(&root)?;
        if this.recursive {
            this.register_all(&root)?;
        }
        info!(
            root = %this.root.display(),
            watched = this.registry.len(),
            "watching directory tree"
        );

        Ok(this)
    }

    /// Number of directories currently covered.
    pub fn watched_dirs(&self) -> usize {
        self.registry.len()
    }

    /// Begin observing a single directory.
    fn register(&mut self, dir: &Path) -> Result<()> {
        if self.registry.id_for(dir).is_some() {
            return Ok(());
        }
        self.watcher.watch(dir, RecursiveMode::NonRecursive)?;
        let id = self.registry.insert(dir.to_path_buf());
        debug!(dir = %dir.display(), ?id, "registered directory");
        Ok(())
    }

    /// Register `start` and every directory beneath it, depth-first.
    /// Symbolic links are not followed, so cyclic links cannot recurse.
    fn register_all(&mut self, start: &Path) -> Result<()> {
        for entry in WalkDir::new(start).follow_links(false) {
            match entry {
                Ok(entry) if entry.file_type().is_dir() => self.register(entry.path())?,
                Ok(_) => {}
                Err(err) => warn!(error = %err, "skipping unreadable entry during registration"),
            }
        }
        Ok(())
    }

    fn unregister(&mut self, id: WatchId) {
        if let Some(dir) = self.registry.remove(id) {
            // The underlying watch may already be gone with the directory.
            if let Err(err) = self.watcher.unwatch(&dir) {
                debug!(dir = %dir.display(), error = %err, "unwatch after invalidation failed");
            }
            info!(dir = %dir.display(), "directory no longer watched");
        }
    }

    /// Long-running event loop.
    ///
    /// Runs until all watched directories have become inaccessible (the
    /// registry is empty) or the cancellation token fires; both are clean
    /// returns with no partial event processing.
    pub async fn process_events(&mut self) -> Result<()> {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("watcher cancelled");
                    return Ok(());
                }
                message = self.rx.recv() => message,
            };

            let Some(message) = message else {
                return Ok(());
            };

            match message {
                WatchMessage::Event(event) => self.handle_event(event),
                WatchMessage::Error(err) => self.handle_error(err),
            }

            if self.registry.is_empty() {
                info!("all watched directories inaccessible, stopping watcher");
                return Ok(());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        if event.flag() == Some(Flag::Rescan) {
            // The OS dropped notifications. Files created in the gap are
            // not recovered here; a full rescan is a possible extension.
            warn!("notification overflow, some events may have been missed");
            return;
        }

        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.handle_created(path.clone());
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.handle_removed(path);
                }
            }
            _ => {}
        }
    }

    fn handle_created(&mut self, path: PathBuf) {
        // The parent is the directory whose watch produced this event; an
        // unknown parent means the registration was already invalidated.
        let watched_parent = path
            .parent()
            .and_then(|parent| self.registry.id_for(parent));
        if watched_parent.is_none() {
            warn!(path = %path.display(), "creation event for an unwatched directory, ignoring");
            return;
        }

        // No symlink follow when classifying, so link cycles stay inert.
        let metadata = match std::fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "created entry vanished before classification");
                return;
            }
        };

        if metadata.is_dir() {
            if self.recursive {
                if let Err(err) = self.register_all(&path) {
                    warn!(
                        dir = %path.display(),
                        error = %err,
                        "could not register new subdirectory"
                    );
                }
            }
        } else if metadata.is_file() && !is_hidden(&path) {
            self.dispatcher.file_created(&path);
        }
    }

    fn handle_removed(&mut self, path: &Path) {
        // Invalidate the removed directory and any watched descendants.
        let stale: Vec<WatchId> = self
            .registry
            .iter()
            .filter(|(_, dir)| *dir == path || dir.starts_with(path))
            .map(|(id, _)| id)
            .collect();
        for id in stale {
            self.unregister(id);
        }
    }

    fn handle_error(&mut self, err: notify::Error) {
        if err.paths.is_empty() {
            warn!(error = %err, "watch error");
            return;
        }
        for path in &err.paths {
            warn!(path = %path.display(), error = %err, "watch error, dropping directory");
            if let Some(id) = self.registry.id_for(path) {
                self.unregister(id);
            }
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}
