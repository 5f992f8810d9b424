//! Glue between the watcher and the upload pipeline.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::queue::{DurableQueue, TransferRecord};
use crate::worker::UploadWorker;

/// Turns qualifying file-creation events into queued transfers.
///
/// For every created file the dispatcher computes the path relative to the
/// watched root, reuses it (`/`-separated) as the remote destination under
/// the configured remote root, enqueues a [`TransferRecord`], and makes sure
/// a worker run is active. Starting the worker while one is running is a
/// no-op.
pub struct TransferDispatcher {
    watch_root: PathBuf,
    queue: Arc<DurableQueue>,
    worker: Arc<UploadWorker>,
}

impl std::fmt::Debug for TransferDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferDispatcher")
            .field("watch_root", &self.watch_root)
            .field("pending", &self.queue.len())
            .finish()
    }
}

impl TransferDispatcher {
    pub fn new(watch_root: PathBuf, queue: Arc<DurableQueue>, worker: Arc<UploadWorker>) -> Self {
        Self {
            watch_root,
            queue,
            worker,
        }
    }

    /// Enqueue a newly created file and kick the worker.
    pub fn file_created(&self, path: &Path) {
        let Ok(relative) = path.strip_prefix(&self.watch_root) else {
            warn!(
                path = %path.display(),
                root = %self.watch_root.display(),
                "created file is outside the watched root, ignoring"
            );
            return;
        };

        let Some(remote_path) = remote_relative_path(relative) else {
            warn!(
                path = %path.display(),
                "could not derive a remote path, ignoring"
            );
            return;
        };

        info!(
            local = %path.display(),
            remote = %remote_path,
            "queued upload"
        );
        self.queue
            .enqueue(TransferRecord::new(path.to_path_buf(), remote_path));
        self.worker.start();
    }
}

/// Join the normal components of `relative` with `/`, the separator the
/// provisioning algorithm splits on. Returns None for an empty path or one
/// with non-UTF-8 components.
fn remote_relative_path(relative: &Path) -> Option<String> {
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_str()?),
            _ => return None,
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}
