//! The per-plugin-instance server facade.
//!
//! # Responsibilities
//! - Validate server definitions before touching sockets
//! - Acquire sockets (exclusive or through the injected broker)
//! - Start accept/receive loops on the injected tokio runtime
//! - Keep the registry of running servers and shut them down
//!
//! # Design Decisions
//! - The broker, resolver and runtime handle are injected, never global
//! - All callbacks of one helper run one at a time (one [`EventLane`])
//! - Dropping the helper aborts whatever is still running; call
//!   [`ServerHelper::shutdown`] for an orderly close

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_rustls::TlsAcceptor;

use crate::broker::{ListenRequest, SocketBroker};
use crate::config::{validate_connection_server, validate_server, ServerConfig, ValidationError};
use crate::lifecycle::Shutdown;
use crate::net::acquire::SocketAcquirer;
use crate::net::connection::{lock, ConnectionTracker, DataCallback, EventLane, SharedData};
use crate::net::options::{ServerOptions, TcpOptions, TlsOptions, UdpOptions, UnixOptions};
use crate::net::resolver::{Resolver, SystemResolver};
use crate::net::stream::{ConnectHandler, StreamServer};
use crate::net::udp::DatagramServer;
use crate::net::{tcp, tls, udp, unix, Connection, Peer, Protocol};
use crate::observability::metrics;
use crate::server::info::ServerHandle;
use crate::server::{ServerError, ServerInfo, ServerRegistry, Title};

/// Default time `shutdown` waits for connections to finish closing.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The primary data handler of a server.
///
/// Either receives only the bytes, or the bytes and the peer they came
/// from (a [`Connection`] or a datagram context).
pub enum DataHandler {
    Data(Box<dyn FnMut(&[u8]) + Send>),
    WithPeer(DataCallback),
}

impl DataHandler {
    pub fn data(f: impl FnMut(&[u8]) + Send + 'static) -> Self {
        DataHandler::Data(Box::new(f))
    }

    pub fn with_peer(f: impl FnMut(&[u8], &dyn Peer) + Send + 'static) -> Self {
        DataHandler::WithPeer(Box::new(f))
    }

    fn into_shared(self) -> SharedData {
        let callback: DataCallback = match self {
            DataHandler::Data(mut f) => Box::new(move |data: &[u8], _: &dyn Peer| f(data)),
            DataHandler::WithPeer(f) => f,
        };
        Arc::new(Mutex::new(callback))
    }
}

impl std::fmt::Debug for DataHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataHandler::Data(_) => f.write_str("DataHandler::Data"),
            DataHandler::WithPeer(_) => f.write_str("DataHandler::WithPeer"),
        }
    }
}

enum Launch {
    Datagram(SharedData),
    Stream(ConnectHandler),
}

/// Builder for [`ServerHelper`].
pub struct ServerHelperBuilder {
    broker: Arc<dyn SocketBroker>,
    runtime: Option<Handle>,
    resolver: Option<Arc<dyn Resolver>>,
    drain_timeout: Duration,
}

impl ServerHelperBuilder {
    /// Runtime that runs the servers. Defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Resolver for servers with `resolve_name`. Defaults to
    /// [`SystemResolver`].
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ServerHelper, ServerError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| ServerError::NoRuntime)?,
        };
        Ok(ServerHelper {
            runtime,
            acquirer: SocketAcquirer::new(self.broker),
            resolver: self.resolver.unwrap_or_else(|| Arc::new(SystemResolver)),
            lane: EventLane::new(),
            drain_timeout: self.drain_timeout,
            registry: Mutex::new(ServerRegistry::new()),
        })
    }
}

/// Creates and owns the servers of one plugin instance.
pub struct ServerHelper {
    runtime: Handle,
    acquirer: SocketAcquirer,
    resolver: Arc<dyn Resolver>,
    lane: EventLane,
    drain_timeout: Duration,
    registry: Mutex<ServerRegistry>,
}

impl ServerHelper {
    pub fn builder(broker: Arc<dyn SocketBroker>) -> ServerHelperBuilder {
        ServerHelperBuilder {
            broker,
            runtime: None,
            resolver: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Helper on the current runtime with default settings.
    pub fn new(broker: Arc<dyn SocketBroker>) -> Result<Self, ServerError> {
        Self::builder(broker).build()
    }

    /// Start a server whose received bytes go to `handler`.
    ///
    /// For stream protocols the handler becomes the data callback of every
    /// accepted connection; for udp it gets every datagram.
    pub fn create_server(
        &self,
        title: &str,
        port: u16,
        options: impl Into<ServerOptions>,
        handler: DataHandler,
    ) -> Result<ServerInfo, ServerError> {
        let title = Title::new(title)?;
        let options = options.into();
        options.validate()?;

        let handler = handler.into_shared();
        let launch = match options.protocol() {
            Protocol::Udp => Launch::Datagram(handler),
            _ => {
                let on_connect: ConnectHandler = Arc::new(Mutex::new(Box::new(move |conn: &Connection| {
                    if let Err(e) = conn.install_data(handler.clone()) {
                        tracing::debug!(connection_id = %conn.id(), error = %e, "Data handler not installed");
                    }
                })));
                Launch::Stream(on_connect)
            }
        };
        self.start(title, port, options, launch)
    }

    /// Start a stream server that hands every accepted [`Connection`] to
    /// `on_connect`, which registers the callbacks it needs.
    pub fn create_connection_server(
        &self,
        title: &str,
        port: u16,
        options: impl Into<ServerOptions>,
        on_connect: impl FnMut(&Connection) + Send + 'static,
    ) -> Result<ServerInfo, ServerError> {
        let title = Title::new(title)?;
        let options = options.into();
        if !options.protocol().is_stream() {
            return Err(ValidationError::ConnectionForDatagram.into());
        }
        options.validate()?;

        let on_connect: ConnectHandler = Arc::new(Mutex::new(Box::new(on_connect)));
        self.start(title, port, options, Launch::Stream(on_connect))
    }

    pub fn create_tcp(
        &self,
        title: &str,
        port: u16,
        options: TcpOptions,
        handler: DataHandler,
    ) -> Result<ServerInfo, ServerError> {
        self.create_server(title, port, options, handler)
    }

    pub fn create_udp(
        &self,
        title: &str,
        port: u16,
        options: UdpOptions,
        handler: DataHandler,
    ) -> Result<ServerInfo, ServerError> {
        self.create_server(title, port, options, handler)
    }

    pub fn create_tls(
        &self,
        title: &str,
        port: u16,
        options: TlsOptions,
        handler: DataHandler,
    ) -> Result<ServerInfo, ServerError> {
        self.create_server(title, port, options, handler)
    }

    pub fn create_unix(
        &self,
        title: &str,
        port: u16,
        options: UnixOptions,
        handler: DataHandler,
    ) -> Result<ServerInfo, ServerError> {
        self.create_server(title, port, options, handler)
    }

    /// [`create_server`](Self::create_server) for an untyped config entry.
    pub fn create_server_from_config(
        &self,
        config: &ServerConfig,
        handler: DataHandler,
    ) -> Result<ServerInfo, ServerError> {
        let spec = validate_server(config)?;
        self.create_server(spec.title.as_str(), spec.port, spec.options, handler)
    }

    /// [`create_connection_server`](Self::create_connection_server) for an
    /// untyped config entry.
    pub fn create_connection_server_from_config(
        &self,
        config: &ServerConfig,
        on_connect: impl FnMut(&Connection) + Send + 'static,
    ) -> Result<ServerInfo, ServerError> {
        let spec = validate_connection_server(config)?;
        self.create_connection_server(spec.title.as_str(), spec.port, spec.options, on_connect)
    }

    /// Running servers in registration order.
    pub fn servers(&self) -> Vec<ServerInfo> {
        lock(&self.registry).iter().cloned().collect()
    }

    pub fn server(&self, title: &str) -> Option<ServerInfo> {
        lock(&self.registry).get(title).cloned()
    }

    /// Close one server and its connections. Returns false if no server has
    /// that title.
    pub async fn close_server(&self, title: &str) -> Result<bool, ServerError> {
        let removed = lock(&self.registry).remove(title);
        match removed {
            Some(info) => {
                info.handle.close(self.drain_timeout).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every server, in creation order. Every server is attempted;
    /// the first failure is returned.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        let registry = std::mem::take(&mut *lock(&self.registry));
        if registry.is_empty() {
            return Ok(());
        }
        tracing::info!(servers = registry.len(), "Shutting down servers");
        match registry.shutdown_all(self.drain_timeout).await.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    fn start(
        &self,
        title: Title,
        port: u16,
        options: ServerOptions,
        launch: Launch,
    ) -> Result<ServerInfo, ServerError> {
        let mut registry = lock(&self.registry);
        if registry.contains(&title) {
            return Err(ValidationError::DuplicateTitle(title.to_string()).into());
        }

        let protocol = options.protocol();
        let shared = options.shared();
        let request = ListenRequest {
            protocol,
            bind: options.bind(),
            port,
            backlog: options.backlog(),
        };

        let acceptor = match &options {
            ServerOptions::Tls(o) => Some(TlsAcceptor::from(tls::load_tls_config(
                &o.certopts.cert_path,
                &o.certopts.private_key_path,
            )?)),
            _ => None,
        };

        let socket = self.acquirer.acquire(&request, shared)?;
        let resolver = options.resolve_name().then(|| self.resolver.clone());
        let shutdown = Shutdown::new();
        let stop = shutdown.subscribe();
        let _runtime = self.runtime.enter();

        let mut socket_path: Option<PathBuf> = None;
        let (task, local_addr, tracker) = match launch {
            Launch::Datagram(handler) => {
                let ServerOptions::Udp(udp_options) = &options else {
                    return Err(ValidationError::InvalidProtocol.into());
                };
                let socket = udp::into_socket(socket, udp_options)?;
                let local_addr = socket.local_addr().ok();
                let server = DatagramServer {
                    title: title.clone(),
                    resolver,
                    max_bytes: udp_options.max_bytes,
                    lane: self.lane.clone(),
                    handler,
                };
                (self.runtime.spawn(udp::serve(socket, server, stop)), local_addr, None)
            }
            Launch::Stream(on_connect) => {
                let tracker = ConnectionTracker::new();
                let server = Arc::new(StreamServer {
                    title: title.clone(),
                    protocol,
                    resolver,
                    linger_timeout: options.linger_timeout(),
                    lane: self.lane.clone(),
                    tracker: tracker.clone(),
                    on_connect,
                });
                let (task, local_addr) = match (&options, acceptor) {
                    (ServerOptions::Tcp(_), _) => {
                        let listener = tcp::into_listener(socket)?;
                        let local_addr = listener.local_addr().ok();
                        (self.runtime.spawn(tcp::serve(listener, server, stop)), local_addr)
                    }
                    (ServerOptions::Tls(_), Some(acceptor)) => {
                        let listener = tcp::into_listener(socket)?;
                        let local_addr = listener.local_addr().ok();
                        (self.runtime.spawn(tls::serve(listener, acceptor, server, stop)), local_addr)
                    }
                    (ServerOptions::Unix(o), _) => {
                        if !shared {
                            socket_path = Some(o.path.clone());
                        }
                        let listener = unix::into_listener(socket)?;
                        (self.runtime.spawn(unix::serve(listener, server, stop)), None)
                    }
                    _ => return Err(ValidationError::ConnectionForDatagram.into()),
                };
                (task, local_addr, Some(tracker))
            }
        };

        let info = ServerInfo {
            title: title.clone(),
            protocol,
            bind: request.bind,
            port,
            shared,
            local_addr,
            handle: Arc::new(ServerHandle::new(title.clone(), shutdown, task, tracker, socket_path)),
        };
        registry.register(info.clone())?;

        metrics::record_server_created(protocol);
        tracing::info!(
            title = %title,
            protocol = %protocol,
            bind = %info.bind,
            port = port,
            shared = shared,
            "Server listening"
        );
        Ok(info)
    }
}

impl Drop for ServerHelper {
    fn drop(&mut self) {
        let registry = self.registry.get_mut().unwrap_or_else(|e| e.into_inner());
        for server in registry.iter() {
            server.handle.abort();
        }
    }
}

impl std::fmt::Debug for ServerHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHelper")
            .field("servers", &lock(&self.registry).len())
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}
