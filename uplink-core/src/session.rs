//! Remote transfer-protocol session seam.
//!
//! [`RemoteSession`] is the narrow surface the upload worker drives; the
//! production implementation wraps a blocking [`suppaftp::FtpStream`]. Tests
//! substitute scripted sessions to verify call sequences without a server.

use std::fmt;
use std::io::Read;

use suppaftp::FtpStream;
use suppaftp::types::FileType;
use tracing::debug;

use crate::error::{Result, UplinkError};

/// One stateful session with the remote server.
///
/// All operations are blocking; the worker runs them on a blocking task.
/// Directory state (`change_dir`) is part of the session, so callers must
/// not interleave operations from multiple owners.
pub trait RemoteSession: Send {
    fn connect(&mut self, host: &str, port: u16) -> Result<()>;
    fn login(&mut self, username: &str, password: &str) -> Result<()>;
    /// Switch the data channel to binary mode.
    fn set_binary(&mut self) -> Result<()>;
    fn change_dir(&mut self, path: &str) -> Result<()>;
    fn make_dir(&mut self, path: &str) -> Result<()>;
    /// Store `reader`'s content under `remote_name` in the current remote
    /// working directory.
    fn store(&mut self, remote_name: &str, reader: &mut dyn Read) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
}

/// Creates a fresh, unconnected session for each worker run.
pub trait SessionFactory: Send + Sync {
    fn create(&self) -> Box<dyn RemoteSession>;
}

/// FTP-backed [`RemoteSession`].
#[derive(Default)]
pub struct FtpSession {
    stream: Option<FtpStream>,
}

impl FtpSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&mut self) -> Result<&mut FtpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| UplinkError::Session("session is not connected".into()))
    }
}

impl fmt::Debug for FtpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpSession")
            .field("connected", &self.stream.is_some())
            .finish()
    }
}

impl RemoteSession for FtpSession {
    fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        let stream = FtpStream::connect((host, port)).map_err(|err| UplinkError::Connect {
            host: host.to_string(),
            port,
            reason: err.to_string(),
        })?;
        debug!(host, port, "connected to remote server");
        self.stream = Some(stream);
        Ok(())
    }

    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.stream()?
            .login(username, password)
            .map_err(|err| UplinkError::Auth {
                username: username.to_string(),
                reason: err.to_string(),
            })
    }

    fn set_binary(&mut self) -> Result<()> {
        self.stream()?
            .transfer_type(FileType::Binary)
            .map_err(|err| UplinkError::Session(err.to_string()))
    }

    fn change_dir(&mut self, path: &str) -> Result<()> {
        self.stream()?
            .cwd(path)
            .map_err(|err| UplinkError::Session(err.to_string()))
    }

    fn make_dir(&mut self, path: &str) -> Result<()> {
        self.stream()?
            .mkdir(path)
            .map_err(|err| UplinkError::Session(err.to_string()))
    }

    fn store(&mut self, remote_name: &str, mut reader: &mut dyn Read) -> Result<()> {
        self.stream()?
            .put_file(remote_name, &mut reader)
            .map_err(|err| UplinkError::Session(err.to_string()))?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream
                .quit()
                .map_err(|err| UplinkError::Session(err.to_string()))?;
        }
        Ok(())
    }
}

/// [`SessionFactory`] handing out plain FTP sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct FtpSessions;

impl SessionFactory for FtpSessions {
    fn create(&self) -> Box<dyn RemoteSession> {
        Box::new(FtpSession::new())
    }
}
