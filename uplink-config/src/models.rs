use std::fmt;

use serde::{Deserialize, Serialize};
use uplink_core::RemoteTarget;

/// One immutable snapshot of the agent's settings file.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Remote directory all uploads are provisioned under.
    pub remote_root: String,
}

impl Settings {
    /// View of these settings as the worker's connection target.
    pub fn remote_target(&self) -> RemoteTarget {
        RemoteTarget {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            root_dir: self.remote_root.clone(),
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("remote_root", &self.remote_root)
            .finish()
    }
}
