//! Connection state machine, callback slots and lifecycle tracking.
//!
//! # Responsibilities
//! - Track connection state (Open → Closing → Closed)
//! - Hold at most one callback per lifecycle event
//! - Queue writes for the driver task that owns the socket
//! - Generate unique connection IDs for tracing
//! - Track live connections per server for shutdown
//!
//! # Design Decisions
//! - A second registration for the same event is an error, never an overwrite
//! - Callbacks never run from `write`, `close` or `on`; only the driver task
//!   dispatches them, so registering from inside a callback cannot deadlock
//! - Callback invocations of one helper instance are serialized by an
//!   [`EventLane`]

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::net::resolver::{HostName, Resolver};
use crate::net::{Peer, PeerAddr, Protocol};

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading and writing.
    Open,
    /// Shutting down; still writable so `before_close` can say goodbye.
    Closing,
    /// Socket shut down. Terminal.
    Closed,
}

/// Events a callback can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Data,
    WriteComplete,
    BeforeClose,
    Close,
}

impl ConnectionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionEvent::Data => "data",
            ConnectionEvent::WriteComplete => "write_complete",
            ConnectionEvent::BeforeClose => "before_close",
            ConnectionEvent::Close => "close",
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by connection operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("{0} callback can be registered just once, but registered twice")]
    RegisteredTwice(ConnectionEvent),

    #[error("{0} callback is not available for udp")]
    Unsupported(ConnectionEvent),

    #[error("connection is already closed")]
    Closed,
}

pub type DataCallback = Box<dyn FnMut(&[u8], &dyn Peer) + Send>;
pub type EventCallback = Box<dyn FnMut(&dyn Peer) + Send>;

pub(crate) type SharedData = Arc<Mutex<DataCallback>>;
pub(crate) type SharedEvent = Arc<Mutex<EventCallback>>;

/// A callback together with the event it is for.
pub enum Callback {
    Data(DataCallback),
    WriteComplete(EventCallback),
    BeforeClose(EventCallback),
    Close(EventCallback),
}

impl Callback {
    pub fn data(f: impl FnMut(&[u8], &dyn Peer) + Send + 'static) -> Self {
        Callback::Data(Box::new(f))
    }

    pub fn write_complete(f: impl FnMut(&dyn Peer) + Send + 'static) -> Self {
        Callback::WriteComplete(Box::new(f))
    }

    pub fn before_close(f: impl FnMut(&dyn Peer) + Send + 'static) -> Self {
        Callback::BeforeClose(Box::new(f))
    }

    pub fn close(f: impl FnMut(&dyn Peer) + Send + 'static) -> Self {
        Callback::Close(Box::new(f))
    }

    pub fn event(&self) -> ConnectionEvent {
        match self {
            Callback::Data(_) => ConnectionEvent::Data,
            Callback::WriteComplete(_) => ConnectionEvent::WriteComplete,
            Callback::BeforeClose(_) => ConnectionEvent::BeforeClose,
            Callback::Close(_) => ConnectionEvent::Close,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback").field(&self.event()).finish()
    }
}

/// Serializes callback execution for one helper instance.
#[derive(Debug, Clone, Default)]
pub struct EventLane(Arc<Mutex<()>>);

impl EventLane {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _turn = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Work for the driver task.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Write(Vec<u8>),
    Close,
}

#[derive(Default)]
struct Slots {
    data: Option<SharedData>,
    write_complete: Option<SharedEvent>,
    before_close: Option<SharedEvent>,
    close: Option<SharedEvent>,
}

impl Slots {
    fn event_slot(&mut self, event: ConnectionEvent) -> &mut Option<SharedEvent> {
        match event {
            ConnectionEvent::WriteComplete => &mut self.write_complete,
            ConnectionEvent::BeforeClose => &mut self.before_close,
            // Data has its own slot type; callers route it separately.
            ConnectionEvent::Data | ConnectionEvent::Close => &mut self.close,
        }
    }
}

struct Inner {
    id: ConnectionId,
    protocol: Protocol,
    peer: PeerAddr,
    host: HostName,
    state: Mutex<ConnectionState>,
    close_requested: AtomicBool,
    slots: Mutex<Slots>,
    commands: mpsc::UnboundedSender<Command>,
}

/// One accepted stream connection.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub(crate) fn new(
        protocol: Protocol,
        peer: PeerAddr,
        resolver: Option<Arc<dyn Resolver>>,
    ) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let host = HostName::new(&peer, resolver);
        let inner = Inner {
            id: ConnectionId::new(),
            protocol,
            peer,
            host,
            state: Mutex::new(ConnectionState::Open),
            close_requested: AtomicBool::new(false),
            slots: Mutex::new(Slots::default()),
            commands,
        };
        (Self { inner: Arc::new(inner) }, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.inner.peer
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// Queue bytes for sending. Returns immediately.
    pub fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        self.inner
            .commands
            .send(Command::Write(data.to_vec()))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Start closing. Calling it again, or while closing, does nothing.
    pub fn close(&self) {
        if self.state() != ConnectionState::Open {
            return;
        }
        if self.inner.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.commands.send(Command::Close);
    }

    /// Register a callback for its event.
    pub fn on(&self, callback: Callback) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        match callback {
            Callback::Data(f) => self.install_data(Arc::new(Mutex::new(f))),
            Callback::WriteComplete(f) => self.install_event(ConnectionEvent::WriteComplete, f),
            Callback::BeforeClose(f) => self.install_event(ConnectionEvent::BeforeClose, f),
            Callback::Close(f) => self.install_event(ConnectionEvent::Close, f),
        }
    }

    pub fn on_data(&self, f: impl FnMut(&[u8], &dyn Peer) + Send + 'static) -> Result<(), ConnectionError> {
        self.on(Callback::data(f))
    }

    pub fn on_write_complete(&self, f: impl FnMut(&dyn Peer) + Send + 'static) -> Result<(), ConnectionError> {
        self.on(Callback::write_complete(f))
    }

    pub fn on_before_close(&self, f: impl FnMut(&dyn Peer) + Send + 'static) -> Result<(), ConnectionError> {
        self.on(Callback::before_close(f))
    }

    pub fn on_close(&self, f: impl FnMut(&dyn Peer) + Send + 'static) -> Result<(), ConnectionError> {
        self.on(Callback::close(f))
    }

    pub fn remote_address(&self) -> &str {
        self.inner.host.numeric()
    }

    /// Peer host name. With `resolve_name` on, the first call does a
    /// blocking reverse lookup on the calling thread; callbacks of the
    /// same helper wait for it. Later calls return the cached name.
    pub fn remote_host(&self) -> &str {
        self.inner.host.host()
    }

    /// Install a data callback that may be shared with other connections,
    /// as the primary handler of a server is.
    pub(crate) fn install_data(&self, handler: SharedData) -> Result<(), ConnectionError> {
        let mut slots = lock(&self.inner.slots);
        if slots.data.is_some() {
            return Err(ConnectionError::RegisteredTwice(ConnectionEvent::Data));
        }
        slots.data = Some(handler);
        Ok(())
    }

    fn install_event(&self, event: ConnectionEvent, f: EventCallback) -> Result<(), ConnectionError> {
        let mut slots = lock(&self.inner.slots);
        let slot = slots.event_slot(event);
        if slot.is_some() {
            return Err(ConnectionError::RegisteredTwice(event));
        }
        *slot = Some(Arc::new(Mutex::new(f)));
        Ok(())
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *lock(&self.inner.state) = state;
    }

    /// Deliver received bytes. Returns false when no data callback is set.
    pub(crate) fn dispatch_data(&self, lane: &EventLane, data: &[u8]) -> bool {
        let handler = lock(&self.inner.slots).data.clone();
        match handler {
            Some(handler) => {
                lane.run(|| (&mut *lock(&handler))(data, self));
                true
            }
            None => false,
        }
    }

    /// Fire a lifecycle event if a callback is registered for it.
    pub(crate) fn dispatch(&self, lane: &EventLane, event: ConnectionEvent) {
        debug_assert!(event != ConnectionEvent::Data);
        let handler = lock(&self.inner.slots).event_slot(event).clone();
        if let Some(handler) = handler {
            lane.run(|| (&mut *lock(&handler))(self));
        }
    }
}

impl Peer for Connection {
    fn write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        Connection::write(self, data)
    }

    fn close(&self) {
        Connection::close(self)
    }

    fn on(&self, callback: Callback) -> Result<(), ConnectionError> {
        Connection::on(self, callback)
    }

    fn remote_address(&self) -> &str {
        Connection::remote_address(self)
    }

    fn remote_host(&self) -> &str {
        Connection::remote_host(self)
    }

    fn protocol(&self) -> Protocol {
        self.inner.protocol
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("protocol", &self.inner.protocol)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Tracks the live connections of one server for shutdown.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    live: Arc<Mutex<HashMap<ConnectionId, Connection>>>,
    /// Current live count, observed by `wait_for_shutdown`.
    count: Arc<watch::Sender<usize>>,
    closing: Arc<AtomicBool>,
    /// Set once pending output should be abandoned.
    aborted: Arc<watch::Sender<bool>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        let (aborted, _) = watch::channel(false);
        Self {
            live: Arc::new(Mutex::new(HashMap::new())),
            count: Arc::new(count),
            closing: Arc::new(AtomicBool::new(false)),
            aborted: Arc::new(aborted),
        }
    }

    /// Record a live connection. Returns a guard that forgets it on drop.
    pub fn track(&self, connection: &Connection) -> ConnectionGuard {
        let mut live = lock(&self.live);
        live.insert(connection.id(), connection.clone());
        self.count.send_replace(live.len());
        ConnectionGuard {
            tracker: self.clone(),
            id: connection.id(),
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.live).len()
    }

    /// Ask every live connection to close. Connections tracked afterwards
    /// are reported by [`is_closing`](Self::is_closing).
    pub fn close_all(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let live: Vec<Connection> = lock(&self.live).values().cloned().collect();
        for connection in live {
            connection.close();
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Close every connection and cut short final flushes still waiting
    /// on a peer. Close callbacks still run.
    pub fn abort_all(&self) {
        self.close_all();
        self.aborted.send_replace(true);
    }

    /// Resolves once [`abort_all`](Self::abort_all) has been called.
    pub async fn aborted(&self) {
        let mut aborted = self.aborted.subscribe();
        let _ = aborted.wait_for(|a| *a).await;
    }

    /// Wait until every tracked connection has been released.
    pub async fn wait_for_shutdown(&self) {
        let mut count = self.count.subscribe();
        let _ = count.wait_for(|n| *n == 0).await;
    }

    fn release(&self, id: ConnectionId) {
        let mut live = lock(&self.live);
        live.remove(&id);
        self.count.send_replace(live.len());
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) async fn aborted(&self) {
        self.tracker.aborted().await
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release(self.id);
        tracing::trace!(connection_id = %self.id, "Connection released");
    }
}
