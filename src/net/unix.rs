//! Unix-domain stream servers.
//!
//! Same connection semantics as TCP. Peers are usually unnamed, so
//! `remote_address` is empty unless the client bound a path.

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;

use socket2::Socket;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use crate::net::stream::{accept_loop, StreamListener, StreamServer};
use crate::net::PeerAddr;

impl StreamListener for UnixListener {
    type Stream = UnixStream;

    fn accept(&self) -> impl Future<Output = io::Result<(UnixStream, PeerAddr)>> + Send {
        async move {
            let (stream, addr) = UnixListener::accept(self).await?;
            Ok((stream, PeerAddr::Unix(addr.as_pathname().map(Path::to_path_buf))))
        }
    }
}

/// Hand a listening socket to tokio. Must run inside a runtime context.
pub(crate) fn into_listener(socket: Socket) -> io::Result<UnixListener> {
    let listener: std::os::unix::net::UnixListener = socket.into();
    listener.set_nonblocking(true)?;
    UnixListener::from_std(listener)
}

pub(crate) async fn serve(
    listener: UnixListener,
    server: Arc<StreamServer>,
    shutdown: broadcast::Receiver<()>,
) {
    accept_loop(server.title.clone(), listener, shutdown, move |stream, peer| {
        server.spawn_connection(stream, peer);
    })
    .await
}
