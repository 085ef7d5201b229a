//! TCP servers.

use std::future::Future;
use std::io;
use std::sync::Arc;

use socket2::Socket;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::net::stream::{accept_loop, StreamListener, StreamServer};
use crate::net::PeerAddr;

impl StreamListener for TcpListener {
    type Stream = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, PeerAddr)>> + Send {
        async move {
            let (stream, addr) = TcpListener::accept(self).await?;
            Ok((stream, PeerAddr::Inet(addr)))
        }
    }
}

/// Hand a listening socket to tokio. Must run inside a runtime context.
pub(crate) fn into_listener(socket: Socket) -> io::Result<TcpListener> {
    let listener: std::net::TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

/// Accept connections until `shutdown` fires.
pub(crate) async fn serve(
    listener: TcpListener,
    server: Arc<StreamServer>,
    shutdown: broadcast::Receiver<()>,
) {
    accept_loop(server.title.clone(), listener, shutdown, move |stream, peer| {
        server.spawn_connection(stream, peer);
    })
    .await
}
