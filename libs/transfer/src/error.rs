use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Every way a transfer can fail. None of them are retried here.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid remote path {0:?}")]
    InvalidPath(String),

    #[error("failed to connect to {host}:{port}: {message}")]
    Connect {
        host: String,
        port: u16,
        message: String,
    },

    #[error("authentication failed for {username}@{host}: {message}")]
    Auth {
        host: String,
        username: String,
        message: String,
    },

    #[error("failed to create remote directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to upload {path}: {source}")]
    Upload {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read local file {}: {source}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("transfer task aborted: {0}")]
    Join(String),
}

impl TransferError {
    /// Short machine-readable stage name for reports
    pub fn reason(&self) -> &'static str {
        match self {
            TransferError::InvalidPath(_) => "invalid_path",
            TransferError::Connect { .. } => "connect_error",
            TransferError::Auth { .. } => "auth_error",
            TransferError::Directory { .. } => "directory_error",
            TransferError::Upload { .. } => "upload_error",
            TransferError::Source { .. } => "source_error",
            TransferError::Timeout(_) => "timeout",
            TransferError::Join(_) => "aborted",
        }
    }
}
