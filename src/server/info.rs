//! Running-server records.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::lifecycle::Shutdown;
use crate::net::connection::{lock, ConnectionTracker};
use crate::net::Protocol;
use crate::server::{ServerError, Title};

/// Description of a running server. Clones share the running server.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub title: Title,
    pub protocol: Protocol,
    /// Bind address as requested, or the socket path for unix.
    pub bind: String,
    /// Port as requested. For unix servers it is recorded only.
    pub port: u16,
    pub shared: bool,
    /// Address actually bound; differs from `port` when it was 0.
    pub local_addr: Option<SocketAddr>,
    pub(crate) handle: Arc<ServerHandle>,
}

impl ServerInfo {
    /// Live connections; always 0 for udp.
    pub fn active_connections(&self) -> usize {
        self.handle
            .tracker
            .as_ref()
            .map(ConnectionTracker::active_count)
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.handle.closed.load(Ordering::SeqCst)
    }
}

/// Owns the accept/receive task of one server.
#[derive(Debug)]
pub(crate) struct ServerHandle {
    pub(crate) title: Title,
    pub(crate) shutdown: Shutdown,
    pub(crate) task: Mutex<Option<JoinHandle<()>>>,
    /// `None` for udp.
    pub(crate) tracker: Option<ConnectionTracker>,
    /// Socket file to remove on close; set for exclusive unix servers.
    pub(crate) socket_path: Option<PathBuf>,
    pub(crate) closed: AtomicBool,
}

impl ServerHandle {
    pub(crate) fn new(
        title: Title,
        shutdown: Shutdown,
        task: JoinHandle<()>,
        tracker: Option<ConnectionTracker>,
        socket_path: Option<PathBuf>,
    ) -> Self {
        Self {
            title,
            shutdown,
            task: Mutex::new(Some(task)),
            tracker,
            socket_path,
            closed: AtomicBool::new(false),
        }
    }

    /// Stop accepting, close every connection and wait up to `drain` for
    /// their close callbacks.
    pub(crate) async fn close(&self, drain: Duration) -> Result<(), ServerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.trigger();

        let task = lock(&self.task).take();
        let stopped = match task {
            Some(task) => task.await.map_err(|e| ServerError::Task {
                title: self.title.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(()),
        };

        if let Some(tracker) = &self.tracker {
            tracker.close_all();
            if tokio::time::timeout(drain, tracker.wait_for_shutdown()).await.is_err() {
                tracing::warn!(
                    title = %self.title,
                    remaining = tracker.active_count(),
                    "Connections still open after drain timeout, aborting"
                );
                tracker.abort_all();
                if tokio::time::timeout(drain, tracker.wait_for_shutdown()).await.is_err() {
                    tracing::warn!(
                        title = %self.title,
                        remaining = tracker.active_count(),
                        "Connections still open after abort"
                    );
                }
            }
        }

        self.remove_socket_file();
        tracing::info!(title = %self.title, "Server closed");
        stopped
    }

    /// Close without waiting. Used when no async context is available.
    pub(crate) fn abort(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.trigger();
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        if let Some(tracker) = &self.tracker {
            tracker.abort_all();
        }
        self.remove_socket_file();
    }

    fn remove_socket_file(&self) {
        if let Some(path) = &self.socket_path {
            if let Err(e) = fs::remove_file(path) {
                tracing::debug!(path = %path.display(), error = %e, "Could not remove socket file");
            }
        }
    }
}
