use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use ssh2::{Session, Sftp};
use tracing::debug;

use crate::config::{Credentials, Destination, Protocol};
use crate::error::TransferError;
use crate::session::{RemoteSession, TransferMode, is_timeout};

pub(crate) fn resolve(
    destination: &Destination,
    protocol: Protocol,
) -> Result<SocketAddr, TransferError> {
    let port = destination.port_for(protocol);
    let connect_err = |message: String| TransferError::Connect {
        host: destination.host.clone(),
        port,
        message,
    };
    (destination.host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| connect_err(e.to_string()))?
        .next()
        .ok_or_else(|| connect_err("host did not resolve".to_string()))
}

fn millis(limit: Duration) -> u32 {
    limit.as_millis().clamp(1, u32::MAX as u128) as u32
}

pub struct SftpSession {
    session: Session,
    sftp: Sftp,
    cwd: PathBuf,
}

impl SftpSession {
    pub fn connect(
        destination: &Destination,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self, TransferError> {
        let addr = resolve(destination, Protocol::Sftp)?;
        let connect_err = |message: String| TransferError::Connect {
            host: destination.host.clone(),
            port: addr.port(),
            message,
        };

        let stage_err = |e: io::Error, fallback: &dyn Fn(String) -> TransferError| {
            if is_timeout(&e) {
                TransferError::Timeout(timeout)
            } else {
                fallback(e.to_string())
            }
        };

        let tcp =
            TcpStream::connect_timeout(&addr, timeout).map_err(|e| stage_err(e, &connect_err))?;
        let mut session = Session::new().map_err(|e| connect_err(e.to_string()))?;
        session.set_timeout(millis(timeout));
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| stage_err(io::Error::from(e), &connect_err))?;

        let auth_err = |message: String| TransferError::Auth {
            host: destination.host.clone(),
            username: credentials.username.clone(),
            message,
        };
        session
            .userauth_password(&credentials.username, &credentials.password)
            .map_err(|e| stage_err(io::Error::from(e), &auth_err))?;
        if !session.authenticated() {
            return Err(auth_err("server rejected credentials".to_string()));
        }

        let sftp = session.sftp().map_err(|e| connect_err(e.to_string()))?;
        debug!(%addr, "sftp session established");

        Ok(Self {
            session,
            sftp,
            cwd: PathBuf::new(),
        })
    }

    fn resolve_dir(&self, dir: &str) -> PathBuf {
        if dir == "/" {
            PathBuf::from("/")
        } else {
            self.cwd.join(dir)
        }
    }
}

impl RemoteSession for SftpSession {
    fn chdir(&mut self, dir: &str) -> io::Result<()> {
        let target = self.resolve_dir(dir);
        let stat = self.sftp.stat(&target).map_err(io::Error::from)?;
        if !stat.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not a directory", target.display()),
            ));
        }
        self.cwd = target;
        Ok(())
    }

    fn mkdir(&mut self, dir: &str) -> io::Result<()> {
        let target = self.resolve_dir(dir);
        self.sftp.mkdir(&target, 0o755).map_err(io::Error::from)
    }

    fn put(&mut self, name: &str, source: &mut dyn Read, _mode: TransferMode) -> io::Result<u64> {
        let target = self.cwd.join(name);
        let mut remote = self.sftp.create(&target).map_err(io::Error::from)?;
        io::copy(source, &mut remote)
    }

    fn close(&mut self) -> io::Result<()> {
        self.session
            .disconnect(None, "picast transfer complete", None)
            .map_err(io::Error::from)
    }

    fn set_timeout(&mut self, limit: Duration) -> io::Result<()> {
        self.session.set_timeout(millis(limit));
        Ok(())
    }
}
