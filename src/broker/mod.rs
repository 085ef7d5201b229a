//! Listening-socket sharing between helper instances and processes.
//!
//! # Data Flow
//! ```text
//! ServerHelper (shared = true)
//!     → SocketBroker::listen(ListenRequest)
//!         InProcessBroker: cached socket, or bind and cache
//!         BrokerClient:    JSON line over the rendezvous socket
//!             → BrokerServer → InProcessBroker
//!             ← JSON line + SCM_RIGHTS descriptor
//!     ← duplicate of the shared socket
//! ```
//!
//! # Design Decisions
//! - The helper receives the broker as `Arc<dyn SocketBroker>`; there is no
//!   process-global broker
//! - Requests are keyed by (protocol, normalized bind, port); unix sockets
//!   by path
//! - The broker serializes bind requests, so two callers never race to
//!   create the same socket

pub mod client;
pub mod memory;
pub mod protocol;
pub mod server;

use std::fmt;
use std::io;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use socket2::Socket;
use thiserror::Error;

use crate::net::Protocol;

pub use client::BrokerClient;
pub use memory::InProcessBroker;
pub use server::BrokerServer;

/// Environment variable naming the broker rendezvous path.
pub const BROKER_PATH_ENV: &str = "LISTENKIT_BROKER_PATH";

/// What a caller wants to listen on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenRequest {
    pub protocol: Protocol,
    /// IP literal, or the socket path for unix.
    pub bind: String,
    pub port: u16,
    pub backlog: Option<u32>,
}

impl ListenRequest {
    pub fn key(&self) -> ListenKey {
        match self.protocol {
            Protocol::Unix => ListenKey {
                protocol: Protocol::Unix,
                bind: self.bind.clone(),
                port: 0,
            },
            protocol => ListenKey {
                protocol,
                bind: self
                    .bind
                    .parse::<IpAddr>()
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|_| self.bind.clone()),
                port: self.port,
            },
        }
    }
}

impl fmt::Display for ListenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key(), f)
    }
}

/// Identity of a shareable socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenKey {
    pub protocol: Protocol,
    pub bind: String,
    pub port: u16,
}

impl fmt::Display for ListenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::Unix => write!(f, "unix://{}", self.bind),
            protocol if self.bind.contains(':') => {
                write!(f, "{}://[{}]:{}", protocol, self.bind, self.port)
            }
            protocol => write!(f, "{}://{}:{}", protocol, self.bind, self.port),
        }
    }
}

/// Hands out listening (stream) or bound (datagram) sockets that may be
/// shared with other holders.
pub trait SocketBroker: Send + Sync + fmt::Debug {
    /// Return a socket for `request`, creating it on first use. Every call
    /// returns a separate descriptor for the same underlying socket.
    fn listen(&self, request: &ListenRequest) -> Result<Socket, BrokerError>;
}

/// Errors returned by socket brokers.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("address already in use: {0}")]
    AddressInUse(String),

    #[error("broker I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed broker message: {0}")]
    Protocol(String),

    #[error("broker rejected request: {0}")]
    Rejected(String),
}

impl BrokerError {
    /// Classify a bind failure for `request`.
    pub(crate) fn from_bind(request: &ListenRequest, error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::AddrInUse {
            BrokerError::AddressInUse(request.to_string())
        } else {
            BrokerError::Io(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(protocol: Protocol, bind: &str, port: u16) -> ListenRequest {
        ListenRequest {
            protocol,
            bind: bind.to_string(),
            port,
            backlog: None,
        }
    }

    #[test]
    fn keys_normalize_ip_literals() {
        let long = request(Protocol::Tcp, "0:0:0:0:0:0:0:1", 24224);
        let short = request(Protocol::Tcp, "::1", 24224);
        assert_eq!(long.key(), short.key());
        assert_eq!(short.to_string(), "tcp://[::1]:24224");
    }

    #[test]
    fn keys_separate_protocols() {
        let tcp = request(Protocol::Tcp, "127.0.0.1", 5170);
        let udp = request(Protocol::Udp, "127.0.0.1", 5170);
        assert_ne!(tcp.key(), udp.key());
        assert_eq!(udp.to_string(), "udp://127.0.0.1:5170");
    }

    #[test]
    fn unix_keys_ignore_port() {
        let a = request(Protocol::Unix, "/tmp/a.sock", 1);
        let b = request(Protocol::Unix, "/tmp/a.sock", 2);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.to_string(), "unix:///tmp/a.sock");
    }

    #[test]
    fn request_wire_form() {
        let json = serde_json::to_string(&request(Protocol::Tcp, "0.0.0.0", 24224)).unwrap();
        assert_eq!(json, r#"{"protocol":"tcp","bind":"0.0.0.0","port":24224,"backlog":null}"#);
    }
}
