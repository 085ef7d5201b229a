//! In-process socket broker.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use socket2::Socket;

use crate::broker::{BrokerError, ListenKey, ListenRequest, SocketBroker};
use crate::net::acquire::bind_socket;
use crate::net::connection::lock;
use crate::net::Protocol;

/// Keeps one socket per key and hands out duplicates of it.
///
/// Requests for port 0 always bind a fresh socket; there is nothing to
/// share before the kernel picks a port.
#[derive(Debug, Default)]
pub struct InProcessBroker {
    sockets: Mutex<HashMap<ListenKey, Socket>>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct sockets held.
    pub fn len(&self) -> usize {
        lock(&self.sockets).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SocketBroker for InProcessBroker {
    fn listen(&self, request: &ListenRequest) -> Result<Socket, BrokerError> {
        let key = request.key();
        let mut sockets = lock(&self.sockets);

        if let Some(existing) = sockets.get(&key) {
            tracing::debug!(key = %key, "Sharing existing socket");
            return Ok(existing.try_clone()?);
        }

        let socket = bind_socket(request).map_err(|e| BrokerError::from_bind(request, e))?;
        if request.port == 0 && request.protocol != Protocol::Unix {
            return Ok(socket);
        }

        let handed_out = socket.try_clone()?;
        tracing::info!(key = %key, "Shared socket created");
        sockets.insert(key, socket);
        Ok(handed_out)
    }
}

impl Drop for InProcessBroker {
    fn drop(&mut self) {
        let sockets = self.sockets.get_mut().unwrap_or_else(|e| e.into_inner());
        for key in sockets.keys().filter(|k| k.protocol == Protocol::Unix) {
            if let Err(e) = fs::remove_file(Path::new(&key.bind)) {
                tracing::debug!(path = %key.bind, error = %e, "Could not remove socket file");
            }
        }
    }
}
