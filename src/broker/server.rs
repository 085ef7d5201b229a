//! Cross-process broker: serves an [`InProcessBroker`] on a Unix
//! rendezvous socket.

use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::broker::protocol::{decode_line, send_with_fd, BrokerResponse, MAX_MESSAGE_BYTES};
use crate::broker::{BrokerClient, BrokerError, InProcessBroker, ListenRequest, SocketBroker};

/// How long one request may take to arrive or be answered.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers listen requests from any process that can reach `path`.
///
/// A dedicated thread accepts requests and hands each one to a short-lived
/// thread of its own, so a slow client never blocks the others. Dropping
/// the server stops accepting and removes the rendezvous file.
#[derive(Debug)]
pub struct BrokerServer {
    path: PathBuf,
    broker: Arc<InProcessBroker>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl BrokerServer {
    /// Serve a fresh broker at `path`.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_broker(path, Arc::new(InProcessBroker::new()))
    }

    /// Serve `broker` at `path`, so in-process and remote callers share the
    /// same sockets.
    pub fn with_broker(path: impl Into<PathBuf>, broker: Arc<InProcessBroker>) -> io::Result<Self> {
        let path = path.into();
        let listener = UnixListener::bind(&path)?;
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let broker = broker.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("listenkit-broker".to_string())
                .spawn(move || serve(listener, broker, stop))?
        };

        tracing::info!(path = %path.display(), "Socket broker listening");
        Ok(Self {
            path,
            broker,
            stop,
            thread: Some(thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The broker behind this server, for use within the same process.
    pub fn broker(&self) -> Arc<InProcessBroker> {
        self.broker.clone()
    }

    pub fn client(&self) -> BrokerClient {
        BrokerClient::new(&self.path)
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the blocking accept.
        let _ = UnixStream::connect(&self.path);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Socket broker thread panicked");
            }
        }
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "Could not remove broker socket");
        }
    }
}

fn serve(listener: UnixListener, broker: Arc<InProcessBroker>, stop: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let broker = broker.clone();
                let spawned = thread::Builder::new()
                    .name("listenkit-broker-conn".to_string())
                    .spawn(move || {
                        if let Err(e) = handle(&stream, &broker) {
                            tracing::warn!(error = %e, "Broker request failed");
                        }
                    });
                if let Err(e) = spawned {
                    tracing::warn!(error = %e, "Could not start broker request thread");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Broker accept failed"),
        }
    }
    tracing::debug!("Socket broker stopped");
}

fn handle(stream: &UnixStream, broker: &InProcessBroker) -> Result<(), BrokerError> {
    stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
    stream.set_write_timeout(Some(REQUEST_TIMEOUT))?;

    let mut line = Vec::new();
    BufReader::new(stream)
        .take(MAX_MESSAGE_BYTES as u64)
        .read_until(b'\n', &mut line)?;

    let result = decode_line::<ListenRequest>(&line).and_then(|request| {
        tracing::debug!(request = %request, "Broker listen request");
        broker.listen(&request)
    });

    match result {
        Ok(socket) => {
            let reply = BrokerResponse::Ok.to_line()?;
            send_with_fd(stream.as_raw_fd(), &reply, Some(socket.as_raw_fd()))?;
        }
        Err(e) => {
            tracing::debug!(error = %e, "Broker refused request");
            let reply = BrokerResponse::from_error(&e).to_line()?;
            send_with_fd(stream.as_raw_fd(), &reply, None)?;
        }
    }
    Ok(())
}
