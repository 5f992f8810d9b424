//! Core pipeline for the uplink mirroring agent.
//!
//! Watches a directory tree for newly created files and drains them to a
//! remote FTP server through a durable, restart-safe upload queue. The
//! pieces compose left to right:
//!
//! ```text
//! notify event -> DirectoryWatcher -> TransferDispatcher -> DurableQueue -> UploadWorker
//! ```
//!
//! [`watch::DirectoryWatcher`] keeps the whole tree covered as it grows,
//! [`queue::DurableQueue`] snapshots every mutation to disk so pending
//! uploads survive a crash, and [`worker::UploadWorker`] is the single
//! background task allowed to touch the remote session.

pub mod dispatch;
pub mod error;
pub mod queue;
pub mod registry;
pub mod session;
pub mod watch;
pub mod worker;

pub use dispatch::TransferDispatcher;
pub use error::{Result, UplinkError};
pub use queue::{DurableQueue, TransferRecord};
pub use registry::{WatchId, WatchRegistry};
pub use session::{FtpSession, FtpSessions, RemoteSession, SessionFactory};
pub use watch::{DirectoryWatcher, WatcherConfig};
pub use worker::{RemoteTarget, TargetProvider, UploadWorker, WorkerState};
