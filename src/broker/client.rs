//! Client side of the cross-process broker.

use std::env;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use socket2::Socket;

use crate::broker::protocol::{decode_line, encode_line, recv_line_with_fd, BrokerResponse};
use crate::broker::{BrokerError, ListenRequest, SocketBroker, BROKER_PATH_ENV};

/// Requests sockets from a [`BrokerServer`](crate::broker::BrokerServer),
/// possibly in another process. Each request opens its own connection.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    path: PathBuf,
}

impl BrokerClient {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Client for the path in `LISTENKIT_BROKER_PATH`, if set.
    pub fn from_env() -> Option<Self> {
        env::var_os(BROKER_PATH_ENV)
            .filter(|path| !path.is_empty())
            .map(|path| Self::new(PathBuf::from(path)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SocketBroker for BrokerClient {
    fn listen(&self, request: &ListenRequest) -> Result<Socket, BrokerError> {
        let mut stream = UnixStream::connect(&self.path)?;
        stream.write_all(&encode_line(request)?)?;

        let (line, fd) = recv_line_with_fd(stream.as_raw_fd())?;
        if line.is_empty() {
            return Err(BrokerError::Protocol("broker closed without answering".to_string()));
        }

        let response: BrokerResponse = decode_line(&line)?;
        if let Some(error) = response.into_error() {
            return Err(error);
        }
        let fd = fd.ok_or_else(|| BrokerError::Protocol("response carried no descriptor".to_string()))?;
        Ok(Socket::from(fd))
    }
}
