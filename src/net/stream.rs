//! Shared machinery of the stream protocols (tcp, tls, unix).
//!
//! # Responsibilities
//! - Run the accept loop until shutdown, backing off on accept errors
//! - Wrap each accepted stream in a [`Connection`] and spawn its driver
//! - Drive one connection: reads to the data callback, queued writes to the
//!   socket, ordered teardown
//!
//! # Design Decisions
//! - Queued commands win over reads (`biased` select), so a reply queued by
//!   a data callback is flushed before the next read is delivered
//! - Writes queued back to back are coalesced into one flush and one
//!   `write_complete`
//! - Socket writes are a select branch of their own, so a peer that stops
//!   reading never hides a close request from the driver
//! - Teardown order: `before_close`, final flush (bounded by
//!   `linger_timeout`, cut short by [`ConnectionTracker::abort_all`]),
//!   socket shutdown, `close`

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{broadcast, mpsc};

use crate::net::connection::{
    lock, Command, Connection, ConnectionEvent, ConnectionGuard, ConnectionState, ConnectionTracker,
    EventLane,
};
use crate::net::resolver::Resolver;
use crate::net::{PeerAddr, Protocol};
use crate::observability::metrics;
use crate::resilience::backoff::accept_backoff;
use crate::server::Title;

/// Bytes requested from the socket per read.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Invoked once for every accepted connection, before its first read.
pub type ConnectHandler = Arc<Mutex<Box<dyn FnMut(&Connection) + Send>>>;

/// Accepts a stream and reports the peer.
pub(crate) trait StreamListener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, PeerAddr)>> + Send;
}

/// Everything a stream server needs to turn accepted sockets into
/// connections.
pub(crate) struct StreamServer {
    pub(crate) title: Title,
    pub(crate) protocol: Protocol,
    pub(crate) resolver: Option<Arc<dyn Resolver>>,
    pub(crate) linger_timeout: Option<Duration>,
    pub(crate) lane: EventLane,
    pub(crate) tracker: ConnectionTracker,
    pub(crate) on_connect: ConnectHandler,
}

impl StreamServer {
    /// Wrap `stream` in a connection and spawn its driver task.
    pub(crate) fn spawn_connection<S>(&self, stream: S, peer: PeerAddr) -> Connection
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (connection, commands) = Connection::new(self.protocol, peer, self.resolver.clone());
        let guard = self.tracker.track(&connection);

        tracing::debug!(
            title = %self.title,
            connection_id = %connection.id(),
            peer = %connection.peer(),
            "Connection accepted"
        );
        metrics::record_connection_opened(self.protocol);

        self.lane.run(|| (&mut *lock(&self.on_connect))(&connection));
        if self.tracker.is_closing() {
            connection.close();
        }

        let driver = Driver {
            connection: connection.clone(),
            commands,
            lane: self.lane.clone(),
            linger_timeout: self.linger_timeout,
            guard,
        };
        tokio::spawn(driver.run(stream));
        connection
    }
}

/// Accept until `shutdown` fires. Accept errors never end the loop.
pub(crate) async fn accept_loop<L, F>(
    title: Title,
    listener: L,
    mut shutdown: broadcast::Receiver<()>,
    mut on_accept: F,
) where
    L: StreamListener,
    F: FnMut(L::Stream, PeerAddr) + Send,
{
    let mut failures: u32 = 0;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    failures = 0;
                    on_accept(stream, peer);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    metrics::record_accept_error(&title);
                    let delay = accept_backoff(failures);
                    tracing::warn!(
                        title = %title,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Accept failed"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
    tracing::debug!(title = %title, "Accept loop stopped");
}

#[derive(Debug)]
enum CloseReason {
    Local,
    PeerClosed,
    Io(io::Error),
}

struct Driver {
    connection: Connection,
    commands: mpsc::UnboundedReceiver<Command>,
    lane: EventLane,
    linger_timeout: Option<Duration>,
    guard: ConnectionGuard,
}

impl Driver {
    async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut outbox = Outbox::default();

        let reason = loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Write(data)) => outbox.push(&data),
                    Some(Command::Close) | None => break CloseReason::Local,
                },
                progress = send_some(&mut writer, &outbox), if outbox.has_pending() => match progress {
                    Ok(Progress::Wrote(0)) => break CloseReason::Io(io::ErrorKind::WriteZero.into()),
                    Ok(Progress::Wrote(n)) => outbox.advance(n),
                    Ok(Progress::Flushed) => {
                        outbox.clear();
                        self.connection.dispatch(&self.lane, ConnectionEvent::WriteComplete);
                    }
                    Err(e) => break CloseReason::Io(e),
                },
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break CloseReason::PeerClosed,
                    Ok(n) => {
                        metrics::record_bytes_received(self.connection.protocol(), n);
                        if !self.connection.dispatch_data(&self.lane, &buf[..n]) {
                            tracing::trace!(
                                connection_id = %self.connection.id(),
                                bytes = n,
                                "No data callback, discarding"
                            );
                        }
                    }
                    Err(e) => break CloseReason::Io(e),
                },
            }
        };

        drop(reader);
        self.finish(writer, outbox, reason).await;
    }

    async fn finish<S>(mut self, mut writer: WriteHalf<S>, mut outbox: Outbox, reason: CloseReason)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.connection.id();
        match &reason {
            CloseReason::Io(e) => tracing::debug!(connection_id = %id, error = %e, "Connection failed"),
            other => tracing::trace!(connection_id = %id, reason = ?other, "Connection closing"),
        }

        self.connection.set_state(ConnectionState::Closing);
        self.connection.dispatch(&self.lane, ConnectionEvent::BeforeClose);

        // Writes after this point fail instead of vanishing.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Write(data) = command {
                outbox.push(&data);
            }
        }

        if !matches!(reason, CloseReason::Io(_)) {
            let wrote = outbox.has_pending();
            let linger = self.linger_timeout;
            let flush = async {
                if outbox.is_writing() {
                    writer.write_all(outbox.unsent()).await?;
                }
                writer.flush().await?;
                writer.shutdown().await
            };
            let bounded = async {
                match linger {
                    Some(limit) => tokio::time::timeout(limit, flush)
                        .await
                        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "linger timeout"))),
                    None => flush.await,
                }
            };
            let flushed = tokio::select! {
                flushed = bounded => flushed,
                _ = self.guard.aborted() => {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "connection aborted"))
                }
            };
            match flushed {
                Ok(()) if wrote => {
                    self.connection.dispatch(&self.lane, ConnectionEvent::WriteComplete)
                }
                Ok(()) => {}
                Err(e) => tracing::debug!(connection_id = %id, error = %e, "Final flush failed"),
            }
        }

        drop(writer);
        self.connection.set_state(ConnectionState::Closed);
        metrics::record_connection_closed(self.connection.protocol());
        self.connection.dispatch(&self.lane, ConnectionEvent::Close);
        tracing::debug!(connection_id = %id, "Connection closed");
        drop(self.guard);
    }
}

enum Progress {
    Wrote(usize),
    Flushed,
}

/// One step towards an empty outbox: a single write, or the flush once
/// everything is written. Safe to cancel and call again.
async fn send_some<W: AsyncWrite + Unpin>(writer: &mut W, outbox: &Outbox) -> io::Result<Progress> {
    if outbox.is_writing() {
        writer.write(outbox.unsent()).await.map(Progress::Wrote)
    } else {
        writer.flush().await.map(|()| Progress::Flushed)
    }
}

/// Bytes queued for the socket. Everything queued before a flush completes
/// counts as one batch and earns one `write_complete`.
#[derive(Debug, Default)]
struct Outbox {
    buf: Vec<u8>,
    sent: usize,
}

impl Outbox {
    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn unsent(&self) -> &[u8] {
        &self.buf[self.sent..]
    }

    fn advance(&mut self, n: usize) {
        self.sent += n;
    }

    fn is_writing(&self) -> bool {
        self.sent < self.buf.len()
    }

    fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.sent = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionError;
    use crate::net::Peer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::duplex;

    fn server(on_connect: impl FnMut(&Connection) + Send + 'static) -> StreamServer {
        lingering(None, on_connect)
    }

    fn lingering(
        linger_timeout: Option<Duration>,
        on_connect: impl FnMut(&Connection) + Send + 'static,
    ) -> StreamServer {
        StreamServer {
            title: Title::new("stream_test").unwrap(),
            protocol: Protocol::Tcp,
            resolver: None,
            linger_timeout,
            lane: EventLane::new(),
            tracker: ConnectionTracker::new(),
            on_connect: Arc::new(Mutex::new(Box::new(on_connect))),
        }
    }

    fn peer() -> PeerAddr {
        PeerAddr::Inet("127.0.0.1:50000".parse().unwrap())
    }

    #[tokio::test]
    async fn echoes_and_says_goodbye() {
        let server = server(|conn| {
            conn.on_data(|data, peer| {
                peer.write(data).unwrap();
            })
            .unwrap();
            conn.on_before_close(|peer| {
                peer.write(b"closing\n").unwrap();
            })
            .unwrap();
        });

        let (mut client, socket) = duplex(4096);
        server.spawn_connection(socket, peer());

        client.write_all(b"yay\n").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"yay\n");

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"closing\n");

        server.tracker.wait_for_shutdown().await;
    }

    #[tokio::test]
    async fn close_fires_once_after_before_close() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let events = order.clone();
        let server = server(move |conn| {
            let before = events.clone();
            conn.on_before_close(move |_| before.lock().unwrap().push("before_close"))
                .unwrap();
            let close = events.clone();
            conn.on_close(move |_| close.lock().unwrap().push("close")).unwrap();
        });

        let (mut client, socket) = duplex(4096);
        let conn = server.spawn_connection(socket, peer());
        conn.close();
        conn.close();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        server.tracker.wait_for_shutdown().await;

        assert_eq!(*order.lock().unwrap(), vec!["before_close", "close"]);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.write(b"late").is_err());
    }

    #[tokio::test]
    async fn coalesced_writes_complete_once() {
        let completions = Arc::new(AtomicUsize::new(0));
        let seen = completions.clone();
        let server = server(move |conn| {
            let seen = seen.clone();
            conn.on_write_complete(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            conn.on_data(|_, peer| {
                peer.write(b"a").unwrap();
                peer.write(b"b").unwrap();
                peer.write(b"c").unwrap();
            })
            .unwrap();
        });

        let (mut client, socket) = duplex(4096);
        server.spawn_connection(socket, peer());
        client.write_all(b"go").await.unwrap();

        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"abc");

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        server.tracker.wait_for_shutdown().await;
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_from_data_callback_flushes_reply_first() {
        let server = server(|conn| {
            conn.on_data(|_, peer| {
                peer.write(b"ack\n").unwrap();
                peer.close();
            })
            .unwrap();
        });

        let (mut client, socket) = duplex(4096);
        server.spawn_connection(socket, peer());
        client.write_all(b"foo\n").await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"ack\n");
    }

    #[tokio::test]
    async fn tracker_sees_live_connections() {
        let server = server(|_| {});
        let (_client, socket) = duplex(64);
        let conn = server.spawn_connection(socket, peer());
        assert_eq!(server.tracker.active_count(), 1);

        server.tracker.close_all();
        server.tracker.wait_for_shutdown().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    async fn wait_for_state(conn: &Connection, state: ConnectionState) {
        for _ in 0..200 {
            if conn.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("connection never reached {state:?}");
    }

    #[tokio::test]
    async fn stalled_peer_cannot_hold_close_past_linger() {
        let closes = Arc::new(AtomicUsize::new(0));
        let seen = closes.clone();
        let server = lingering(Some(Duration::from_millis(50)), move |conn| {
            let seen = seen.clone();
            conn.on_close(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            conn.write(&vec![b'x'; 1 << 20]).unwrap();
        });

        // Never read from the client end.
        let (_client, socket) = duplex(64);
        let conn = server.spawn_connection(socket, peer());
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();

        tokio::time::timeout(Duration::from_secs(2), server.tracker.wait_for_shutdown())
            .await
            .expect("close waited on a peer that never reads");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn abort_ends_unbounded_flush_and_refuses_late_writes() {
        let closes = Arc::new(AtomicUsize::new(0));
        let seen = closes.clone();
        let server = server(move |conn| {
            let seen = seen.clone();
            conn.on_close(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            conn.write(&vec![b'x'; 64 * 1024]).unwrap();
        });

        let (_client, socket) = duplex(64);
        let conn = server.spawn_connection(socket, peer());
        conn.close();
        wait_for_state(&conn, ConnectionState::Closing).await;

        assert!(matches!(conn.write(b"late"), Err(ConnectionError::Closed)));
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        server.tracker.abort_all();
        tokio::time::timeout(Duration::from_secs(2), server.tracker.wait_for_shutdown())
            .await
            .expect("abort left the connection open");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
