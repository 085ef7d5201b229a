//! Wire format of the broker rendezvous socket.
//!
//! One JSON request line per connection, answered by one JSON response
//! line. A successful response carries the socket descriptor as
//! `SCM_RIGHTS` ancillary data on its first byte.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::io::{IoSlice, IoSliceMut};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use serde::{Deserialize, Serialize};

use crate::broker::BrokerError;

/// Longest request line the server accepts.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BrokerResponse {
    Ok,
    Error { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AddrInUse,
    Io,
    BadRequest,
}

impl BrokerResponse {
    pub fn from_error(error: &BrokerError) -> Self {
        let kind = match error {
            BrokerError::AddressInUse(_) => ErrorKind::AddrInUse,
            BrokerError::Io(_) => ErrorKind::Io,
            BrokerError::Protocol(_) | BrokerError::Rejected(_) => ErrorKind::BadRequest,
        };
        let message = match error {
            BrokerError::AddressInUse(addr) => addr.clone(),
            other => other.to_string(),
        };
        BrokerResponse::Error { kind, message }
    }

    /// The error a client reports for this response, if any.
    pub fn into_error(self) -> Option<BrokerError> {
        match self {
            BrokerResponse::Ok => None,
            BrokerResponse::Error { kind, message } => Some(match kind {
                ErrorKind::AddrInUse => BrokerError::AddressInUse(message),
                ErrorKind::Io => BrokerError::Io(io::Error::other(message)),
                ErrorKind::BadRequest => BrokerError::Rejected(message),
            }),
        }
    }

    pub fn to_line(&self) -> Result<Vec<u8>, BrokerError> {
        encode_line(self)
    }
}

/// Serialize `value` as one newline-terminated JSON line.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, BrokerError> {
    let mut line = serde_json::to_vec(value).map_err(|e| BrokerError::Protocol(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a [u8]) -> Result<T, BrokerError> {
    let trimmed = line.strip_suffix(b"\n").unwrap_or(line);
    serde_json::from_slice(trimmed).map_err(|e| BrokerError::Protocol(e.to_string()))
}

/// Send `payload` with `fd` attached, or with no descriptor at all.
pub fn send_with_fd(socket: RawFd, payload: &[u8], fd: Option<RawFd>) -> io::Result<()> {
    let iov = [IoSlice::new(payload)];
    let fds: Vec<RawFd> = fd.into_iter().collect();
    let rights = [ControlMessage::ScmRights(&fds[..])];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };

    let sent = sendmsg::<()>(socket, &iov, cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)?;
    if sent < payload.len() {
        // The descriptor went with the first chunk; the rest is plain data.
        write_all_raw(socket, &payload[sent..])?;
    }
    Ok(())
}

fn write_all_raw(socket: RawFd, mut rest: &[u8]) -> io::Result<()> {
    while !rest.is_empty() {
        let iov = [IoSlice::new(rest)];
        let sent = sendmsg::<()>(socket, &iov, &[], MsgFlags::empty(), None).map_err(io::Error::from)?;
        if sent == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        rest = &rest[sent..];
    }
    Ok(())
}

/// Read one line, collecting at most one attached descriptor.
pub fn recv_line_with_fd(socket: RawFd) -> io::Result<(Vec<u8>, Option<OwnedFd>)> {
    let mut line = Vec::new();
    let mut received: Option<OwnedFd> = None;
    let mut buf = [0u8; 4096];

    while !line.contains(&b'\n') {
        let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
        let (bytes, fds) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = recvmsg::<()>(socket, &mut iov, Some(&mut cmsg_space), MsgFlags::empty())
                .map_err(io::Error::from)?;
            let mut fds = Vec::new();
            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(rights) = cmsg {
                    fds.extend(rights);
                }
            }
            (msg.bytes, fds)
        };

        for fd in fds {
            // SAFETY: the kernel installed this descriptor in our table for
            // this message; nothing else refers to it.
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            if received.is_none() {
                received = Some(owned);
            }
        }

        if bytes == 0 {
            break;
        }
        line.extend_from_slice(&buf[..bytes]);
        if line.len() > MAX_MESSAGE_BYTES {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "broker message too long"));
        }
    }
    Ok((line, received))
}
