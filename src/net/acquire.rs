//! Socket acquisition.
//!
//! # Responsibilities
//! - Create and bind sockets for every protocol (socket2)
//! - Route shared requests to the socket broker
//! - Report a taken address as `AddressInUse`
//!
//! # Design Decisions
//! - `SO_REUSEADDR` on TCP listeners only; `SO_REUSEPORT` is never set, so
//!   an exclusive bind really is exclusive
//! - IPv6 listeners are `IPV6_V6ONLY`; the address family follows the literal
//! - Sockets leave here non-blocking, ready for tokio's `from_std`

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};

use crate::broker::{BrokerError, ListenRequest, SocketBroker};
use crate::net::Protocol;

/// Listen queue depth when none is configured.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Obtains sockets for servers, locally or through the broker.
#[derive(Debug, Clone)]
pub struct SocketAcquirer {
    broker: Arc<dyn SocketBroker>,
}

impl SocketAcquirer {
    pub fn new(broker: Arc<dyn SocketBroker>) -> Self {
        Self { broker }
    }

    /// Shared requests go through the broker; exclusive ones bind here.
    pub fn acquire(&self, request: &ListenRequest, shared: bool) -> Result<Socket, BrokerError> {
        let socket = if shared {
            self.broker.listen(request)?
        } else {
            bind_socket(request).map_err(|e| BrokerError::from_bind(request, e))?
        };
        socket.set_nonblocking(true)?;
        Ok(socket)
    }
}

/// Create a socket for `request`: listening for stream protocols, bound for
/// udp.
pub fn bind_socket(request: &ListenRequest) -> io::Result<Socket> {
    match request.protocol {
        Protocol::Tcp | Protocol::Tls => bind_tcp(inet_addr(request)?, request.backlog),
        Protocol::Udp => bind_udp(inet_addr(request)?),
        Protocol::Unix => bind_unix(Path::new(&request.bind), request.backlog),
    }
}

fn inet_addr(request: &ListenRequest) -> io::Result<SocketAddr> {
    let ip: IpAddr = request.bind.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bind address must be an ip address literal, got {:?}", request.bind),
        )
    })?;
    Ok(SocketAddr::new(ip, request.port))
}

fn backlog(value: Option<u32>) -> i32 {
    value
        .map(|b| i32::try_from(b).unwrap_or(i32::MAX))
        .unwrap_or(DEFAULT_BACKLOG)
}

pub fn bind_tcp(addr: SocketAddr, queue: Option<u32>) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog(queue))?;
    Ok(socket)
}

pub fn bind_udp(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(SockProtocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

pub fn bind_unix(path: &Path, queue: Option<u32>) -> io::Result<Socket> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.listen(backlog(queue))?;
    Ok(socket)
}
