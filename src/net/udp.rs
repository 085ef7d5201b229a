//! UDP servers.
//!
//! # Responsibilities
//! - Receive datagrams (truncated to `max_bytes`) and hand each one to the
//!   server's handler with an ephemeral [`DatagramContext`]
//! - Send replies queued through the context back to the sender
//!
//! # Design Decisions
//! - No connection state: every packet gets a fresh context
//! - `before_close` and `close` do not exist for datagrams and are refused
//! - Replies leave from the receive task, so `write` never blocks

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use socket2::Socket;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use crate::net::connection::{
    lock, Callback, ConnectionError, ConnectionEvent, EventLane, SharedData, SharedEvent,
};
use crate::net::options::UdpOptions;
use crate::net::resolver::{HostName, Resolver};
use crate::net::{Peer, PeerAddr, Protocol};
use crate::observability::metrics;
use crate::server::Title;

struct Outgoing {
    data: Vec<u8>,
    context: DatagramContext,
}

struct ContextInner {
    peer: SocketAddr,
    host: HostName,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    write_complete: Mutex<Option<SharedEvent>>,
}

/// The peer of one received datagram.
///
/// Handed to the data handler in place of a connection. Replies written
/// here go back to the sender's address.
#[derive(Clone)]
pub struct DatagramContext {
    inner: Arc<ContextInner>,
}

impl DatagramContext {
    fn new(
        peer: SocketAddr,
        resolver: Option<Arc<dyn Resolver>>,
        outgoing: mpsc::UnboundedSender<Outgoing>,
    ) -> Self {
        let inner = ContextInner {
            peer,
            host: HostName::new(&PeerAddr::Inet(peer), resolver),
            outgoing,
            write_complete: Mutex::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Queue a reply datagram to the sender.
    pub fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let outgoing = Outgoing {
            data: data.to_vec(),
            context: self.clone(),
        };
        self.inner
            .outgoing
            .send(outgoing)
            .map_err(|_| ConnectionError::Closed)
    }

    pub fn on(&self, callback: Callback) -> Result<(), ConnectionError> {
        match callback {
            // The server's handler always occupies the data slot.
            Callback::Data(_) => Err(ConnectionError::RegisteredTwice(ConnectionEvent::Data)),
            Callback::WriteComplete(f) => {
                let mut slot = lock(&self.inner.write_complete);
                if slot.is_some() {
                    return Err(ConnectionError::RegisteredTwice(ConnectionEvent::WriteComplete));
                }
                *slot = Some(Arc::new(Mutex::new(f)));
                Ok(())
            }
            other => Err(ConnectionError::Unsupported(other.event())),
        }
    }

    pub fn on_write_complete(&self, f: impl FnMut(&dyn Peer) + Send + 'static) -> Result<(), ConnectionError> {
        self.on(Callback::write_complete(f))
    }

    pub fn remote_address(&self) -> &str {
        self.inner.host.numeric()
    }

    /// Sender host name. With `resolve_name` on, the first call does a
    /// blocking reverse lookup while the helper's callbacks wait.
    pub fn remote_host(&self) -> &str {
        self.inner.host.host()
    }

    fn dispatch_write_complete(&self, lane: &EventLane) {
        let handler = lock(&self.inner.write_complete).clone();
        if let Some(handler) = handler {
            lane.run(|| (&mut *lock(&handler))(self));
        }
    }
}

impl Peer for DatagramContext {
    fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        DatagramContext::write(self, data)
    }

    /// Datagrams have nothing to close.
    fn close(&self) {}

    fn on(&self, callback: Callback) -> Result<(), ConnectionError> {
        DatagramContext::on(self, callback)
    }

    fn remote_address(&self) -> &str {
        DatagramContext::remote_address(self)
    }

    fn remote_host(&self) -> &str {
        DatagramContext::remote_host(self)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }
}

impl fmt::Debug for DatagramContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramContext")
            .field("peer", &self.inner.peer)
            .finish()
    }
}

/// Everything the receive loop needs.
pub(crate) struct DatagramServer {
    pub(crate) title: Title,
    pub(crate) resolver: Option<Arc<dyn Resolver>>,
    pub(crate) max_bytes: usize,
    pub(crate) lane: EventLane,
    pub(crate) handler: SharedData,
}

/// Hand a bound socket to tokio, applying datagram flags. Must run inside a
/// runtime context.
pub(crate) fn into_socket(socket: Socket, options: &UdpOptions) -> io::Result<UdpSocket> {
    if options.flags.broadcast {
        socket.set_broadcast(true)?;
    }
    let socket: std::net::UdpSocket = socket.into();
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

/// Receive until `shutdown` fires.
pub(crate) async fn serve(socket: UdpSocket, server: DatagramServer, mut shutdown: broadcast::Receiver<()>) {
    let (outgoing, mut replies) = mpsc::unbounded_channel::<Outgoing>();
    let mut buf = vec![0u8; server.max_bytes];

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            Some(reply) = replies.recv() => {
                match socket.send_to(&reply.data, reply.context.peer()).await {
                    Ok(_) => reply.context.dispatch_write_complete(&server.lane),
                    Err(e) => tracing::debug!(
                        title = %server.title,
                        peer = %reply.context.peer(),
                        error = %e,
                        "Reply datagram not sent"
                    ),
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, peer)) => {
                    metrics::record_datagram_received(n);
                    let context = DatagramContext::new(peer, server.resolver.clone(), outgoing.clone());
                    server
                        .lane
                        .run(|| (&mut *lock(&server.handler))(&buf[..n], &context));
                }
                Err(e) => tracing::debug!(title = %server.title, error = %e, "Receive failed"),
            },
        }
    }
    tracing::debug!(title = %server.title, "Receive loop stopped");
}
