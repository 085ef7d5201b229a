//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ServerOptions (validated)
//!     → acquire.rs (local bind or broker lookup)
//!     → tcp.rs / tls.rs / unix.rs (accept loop)  |  udp.rs (receive loop)
//!     → stream.rs (per-connection driver task)
//!     → connection.rs (callback slots, state machine)
//!     → plugin callbacks
//!
//! Connection States:
//!     Open → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - Callbacks are synchronous closures; I/O stays in driver tasks
//! - One driver task owns each stream socket, writes go through its queue
//! - TLS is a handshake stage in front of the TCP path

pub mod acquire;
pub mod connection;
pub mod options;
pub mod resolver;
pub mod stream;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod unix;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ValidationError;

pub use connection::{Callback, Connection, ConnectionError, ConnectionEvent, ConnectionId, ConnectionState};
pub use options::{CertOptions, DatagramFlags, ServerOptions, TcpOptions, TlsOptions, UdpOptions, UnixOptions};
pub use resolver::{Resolver, SystemResolver};
pub use udp::DatagramContext;

/// Transport protocol of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Tls,
    Unix,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Tls => "tls",
            Protocol::Unix => "unix",
        }
    }

    /// Stream protocols produce a [`Connection`] per accepted peer.
    pub fn is_stream(&self) -> bool {
        !matches!(self, Protocol::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "tls" => Ok(Protocol::Tls),
            "unix" => Ok(Protocol::Unix),
            _ => Err(ValidationError::InvalidProtocol),
        }
    }
}

/// Address of the remote side of a connection or datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Inet(SocketAddr),
    /// Unix peers are usually unnamed.
    Unix(Option<PathBuf>),
}

impl PeerAddr {
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            PeerAddr::Inet(addr) => Some(addr.ip()),
            PeerAddr::Unix(_) => None,
        }
    }

    /// Numeric form reported by `remote_address`.
    pub fn numeric(&self) -> String {
        match self {
            PeerAddr::Inet(addr) => addr.ip().to_string(),
            PeerAddr::Unix(Some(path)) => path.display().to_string(),
            PeerAddr::Unix(None) => String::new(),
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{}", addr),
            PeerAddr::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            PeerAddr::Unix(None) => f.write_str("unix:(unnamed)"),
        }
    }
}

/// The object handed to data and lifecycle callbacks.
///
/// Implemented by [`Connection`] for stream protocols and by
/// [`DatagramContext`] for UDP, so a single handler works for both.
pub trait Peer {
    /// Queue bytes for the peer. Never blocks.
    fn write(&self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Begin closing. Idempotent; a no-op for datagrams.
    fn close(&self);

    /// Register a callback. Each event accepts exactly one handler.
    fn on(&self, callback: Callback) -> Result<(), ConnectionError>;

    /// Numeric peer address.
    fn remote_address(&self) -> &str;

    /// Peer host name when name resolution is on, numeric address otherwise.
    ///
    /// The lookup is lazy and blocking: the first call on a peer runs it on
    /// the calling thread, holding up the helper's other callbacks until the
    /// resolver answers. Servers that cannot afford that leave
    /// `resolve_name` off and resolve `remote_address` themselves.
    fn remote_host(&self) -> &str;

    fn protocol(&self) -> Protocol;
}
