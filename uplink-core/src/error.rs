use thiserror::Error;

/// Failure taxonomy for the watch/queue/upload pipeline.
///
/// Session-level failures are split by the operation that produced them so a
/// provisioning failure (cannot create or enter a remote directory) is never
/// conflated with a store failure; both leave the failing record at the queue
/// head for the next run.
#[derive(Error, Debug)]
pub enum UplinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue is empty")]
    QueueEmpty,

    #[error("connect to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("login as '{username}' refused: {reason}")]
    Auth { username: String, reason: String },

    #[error("could not provision remote directory '{path}': {reason}")]
    Provision { path: String, reason: String },

    #[error("store of '{path}' failed: {reason}")]
    Store { path: String, reason: String },

    #[error("session error: {0}")]
    Session(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, UplinkError>;
