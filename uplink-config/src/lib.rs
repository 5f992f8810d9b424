//! Settings for the uplink agent.
//!
//! Loads `{host, port, username, password, remote_root}` from a TOML file,
//! generates a commented template on first run, and republishes validated
//! snapshots through a watch channel when the file changes on disk. The
//! agent and the upload worker only ever see immutable [`Settings`]
//! snapshots, so a reload can never change credentials mid-transfer.

pub mod loader;
pub mod models;
pub mod service;

pub use loader::{ConfigLoadError, load};
pub use models::Settings;
pub use service::ConfigService;
