use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{Protocol, TransferReceipt, TransferTask};
use crate::error::TransferError;
use crate::ftp::FtpSession;
use crate::path::split_remote_path;
use crate::sftp::SftpSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Binary,
    Text,
}

impl TransferMode {
    /// Text mode for markup/plain text, binary for everything else
    pub fn for_path(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("txt") | Some("htm") | Some("html") => TransferMode::Text,
            _ => TransferMode::Binary,
        }
    }
}

/// How long [`send`] keeps waiting on a blocking exchange that overran its
/// own deadline before giving up on it
const ABANDON_GRACE: Duration = Duration::from_secs(5);

/// An authenticated connection with a notion of "current directory".
///
/// SFTP has no server-side cwd, so the SFTP implementation tracks it locally;
/// FTP maps these straight onto CWD/MKD/STOR.
pub trait RemoteSession {
    fn chdir(&mut self, dir: &str) -> io::Result<()>;
    fn mkdir(&mut self, dir: &str) -> io::Result<()>;
    fn put(&mut self, name: &str, source: &mut dyn Read, mode: TransferMode) -> io::Result<u64>;
    fn close(&mut self) -> io::Result<()>;

    /// Bound every following blocking call to `limit`
    fn set_timeout(&mut self, limit: Duration) -> io::Result<()> {
        let _ = limit;
        Ok(())
    }
}

/// Point in time a whole exchange has to be finished by
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left, or `Timeout` once it has passed
    pub fn remaining(&self) -> Result<Duration, TransferError> {
        self.at
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .ok_or(TransferError::Timeout(self.budget))
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// Shrink the session's per-call timeout to what is left of `deadline`
fn tighten<S: RemoteSession + ?Sized>(
    session: &mut S,
    deadline: &Deadline,
) -> Result<(), TransferError> {
    let left = deadline.remaining()?;
    if let Err(e) = session.set_timeout(left) {
        debug!(error = %e, "could not adjust remote session timeout");
    }
    Ok(())
}

/// Local file reader that stops once the deadline has passed, so a slow
/// upload cannot outlive its budget
struct DeadlineReader<'a, R> {
    inner: R,
    deadline: &'a Deadline,
}

impl<R: Read> Read for DeadlineReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.deadline.expired() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "transfer deadline passed",
            ));
        }
        self.inner.read(buf)
    }
}

fn ensure_dir<S: RemoteSession + ?Sized>(
    session: &mut S,
    dir: &str,
    walked: &str,
    deadline: &Deadline,
) -> Result<(), TransferError> {
    if session.chdir(dir).is_ok() {
        return Ok(());
    }
    debug!(path = walked, "remote directory missing, creating");
    tighten(session, deadline)?;
    session
        .mkdir(dir)
        .and_then(|_| session.chdir(dir))
        .map_err(|source| {
            if is_timeout(&source) || deadline.expired() {
                TransferError::Timeout(deadline.budget())
            } else {
                TransferError::Directory {
                    path: walked.to_string(),
                    source,
                }
            }
        })
}

/// Walk (and create where absent) every directory of `remote_path`, then
/// upload `source` as its final component. The local file is only read.
/// Every step is checked against `deadline`.
pub fn push<S: RemoteSession + ?Sized>(
    session: &mut S,
    source: &Path,
    remote_path: &str,
    deadline: Deadline,
) -> Result<u64, TransferError> {
    let (dirs, file_name) = split_remote_path(remote_path)?;

    let mut walked = String::new();
    for dir in dirs {
        if dir != "/" && !walked.is_empty() && !walked.ends_with('/') {
            walked.push('/');
        }
        walked.push_str(dir);
        tighten(session, &deadline)?;
        ensure_dir(session, dir, &walked, &deadline)?;
    }

    let file = File::open(source).map_err(|e| TransferError::Source {
        path: source.to_path_buf(),
        source: e,
    })?;
    let mut reader = DeadlineReader {
        inner: file,
        deadline: &deadline,
    };

    tighten(session, &deadline)?;
    session
        .put(file_name, &mut reader, TransferMode::for_path(file_name))
        .map_err(|e| {
            if is_timeout(&e) || deadline.expired() {
                TransferError::Timeout(deadline.budget())
            } else {
                TransferError::Upload {
                    path: remote_path.to_string(),
                    source: e,
                }
            }
        })
}

/// Connect, push and close, blocking the calling thread. The whole exchange
/// is bounded by `task.timeout`.
pub fn send_blocking(task: &TransferTask) -> Result<TransferReceipt, TransferError> {
    let deadline = Deadline::after(task.timeout);
    let mut session: Box<dyn RemoteSession> = match task.protocol {
        Protocol::Sftp => Box::new(SftpSession::connect(
            &task.destination,
            &task.credentials,
            task.timeout,
        )?),
        Protocol::Ftp => Box::new(FtpSession::connect(
            &task.destination,
            &task.credentials,
            task.timeout,
        )?),
    };

    let result = push(
        session.as_mut(),
        &task.source,
        &task.destination.remote_path,
        deadline,
    );
    if let Err(e) = session.close() {
        warn!(host = %task.destination.host, error = %e, "error closing remote session");
    }

    let bytes = result?;
    info!(
        protocol = %task.protocol,
        host = %task.destination.host,
        remote_path = %task.destination.remote_path,
        bytes,
        "file transferred"
    );
    Ok(TransferReceipt {
        protocol: task.protocol,
        host: task.destination.host.clone(),
        remote_path: task.destination.remote_path.clone(),
        bytes,
    })
}

/// Run a transfer on the blocking pool. Returns only once the blocking side
/// has finished, which its own deadline keeps close to `task.timeout`.
pub async fn send(task: TransferTask) -> Result<TransferReceipt, TransferError> {
    let timeout = task.timeout;
    let host = task.destination.host.clone();
    let handle = tokio::task::spawn_blocking(move || send_blocking(&task));
    match tokio::time::timeout(timeout + ABANDON_GRACE, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(TransferError::Join(e.to_string())),
        Err(_) => {
            warn!(%host, "transfer ignored its deadline, abandoning it");
            Err(TransferError::Timeout(timeout))
        }
    }
}
