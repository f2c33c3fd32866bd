use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Wire protocol used to reach the remote host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Sftp,
    Ftp,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Sftp => 22,
            Protocol::Ftp => 21,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Sftp => f.write_str("sftp"),
            Protocol::Ftp => f.write_str("ftp"),
        }
    }
}

/// Where a file should land: host, optional port and the full remote file path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: Option<u16>,
    /// Remote file path, e.g. `cams/front/2024/01/15/photo.jpg`
    pub remote_path: String,
}

impl Destination {
    pub fn port_for(&self, protocol: Protocol) -> u16 {
        self.port.unwrap_or_else(|| protocol.default_port())
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One push of a local file to a remote host.
///
/// The task only lives for the duration of [`crate::send`]; credentials are
/// copied out of the caller's configuration snapshot and dropped with it.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub source: PathBuf,
    pub destination: Destination,
    pub credentials: Credentials,
    pub protocol: Protocol,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReceipt {
    pub protocol: Protocol,
    pub host: String,
    pub remote_path: String,
    pub bytes: u64,
}
