use std::io::{self, Read};
use std::net::TcpStream;
use std::time::Duration;

use suppaftp::types::{FileType, FormatControl};
use suppaftp::{FtpError, FtpStream};
use tracing::debug;

use crate::config::{Credentials, Destination, Protocol};
use crate::error::TransferError;
use crate::session::{RemoteSession, TransferMode, is_timeout};
use crate::sftp::resolve;

/// Socket errors keep their kind so timeouts stay recognisable
fn to_io(e: FtpError) -> io::Error {
    match e {
        FtpError::ConnectionError(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

fn timed_out(e: &FtpError) -> bool {
    matches!(e, FtpError::ConnectionError(e) if is_timeout(e))
}

fn set_socket_timeouts(tcp: &TcpStream, limit: Duration) -> io::Result<()> {
    tcp.set_read_timeout(Some(limit))?;
    tcp.set_write_timeout(Some(limit))
}

pub struct FtpSession {
    stream: FtpStream,
}

impl FtpSession {
    pub fn connect(
        destination: &Destination,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self, TransferError> {
        let addr = resolve(destination, Protocol::Ftp)?;
        let connect_err = |message: String| TransferError::Connect {
            host: destination.host.clone(),
            port: addr.port(),
            message,
        };

        // Without socket timeouts a server that goes quiet would hold this
        // thread forever
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            if is_timeout(&e) {
                TransferError::Timeout(timeout)
            } else {
                connect_err(e.to_string())
            }
        })?;
        set_socket_timeouts(&tcp, timeout).map_err(|e| connect_err(e.to_string()))?;

        let mut stream = FtpStream::connect_with_stream(tcp).map_err(|e| {
            if timed_out(&e) {
                TransferError::Timeout(timeout)
            } else {
                connect_err(e.to_string())
            }
        })?;

        stream
            .login(credentials.username.as_str(), credentials.password.as_str())
            .map_err(|e| {
                if timed_out(&e) {
                    TransferError::Timeout(timeout)
                } else {
                    TransferError::Auth {
                        host: destination.host.clone(),
                        username: credentials.username.clone(),
                        message: e.to_string(),
                    }
                }
            })?;
        debug!(%addr, "ftp session established");

        Ok(Self { stream })
    }
}

impl RemoteSession for FtpSession {
    fn chdir(&mut self, dir: &str) -> io::Result<()> {
        self.stream.cwd(dir).map_err(to_io)
    }

    fn mkdir(&mut self, dir: &str) -> io::Result<()> {
        self.stream.mkdir(dir).map_err(to_io)
    }

    fn put(&mut self, name: &str, source: &mut dyn Read, mode: TransferMode) -> io::Result<u64> {
        let file_type = match mode {
            TransferMode::Text => FileType::Ascii(FormatControl::Default),
            TransferMode::Binary => FileType::Binary,
        };
        self.stream.transfer_type(file_type).map_err(to_io)?;
        let mut reader = source;
        self.stream.put_file(name, &mut reader).map_err(to_io)
    }

    fn close(&mut self) -> io::Result<()> {
        self.stream.quit().map_err(to_io)
    }

    fn set_timeout(&mut self, limit: Duration) -> io::Result<()> {
        set_socket_timeouts(self.stream.get_ref(), limit)
    }
}
