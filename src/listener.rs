//! TLS listener
//!
//! Accepts transport connections and runs the server side handshake on each.
//! [`TlsListener::accept`] does one connection on the calling thread;
//! [`TlsListener::spawn`] runs an accept loop with one thread per handshake
//! and reports outcomes over a channel.

use crate::config::{ServerContext, TlsConfig};
use crate::connection::TlsStream;
use crate::error::TlsError;
use crate::transport::{memory_pair, poll_readable, MemoryTransport, Transport};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default listen(2) backlog
pub const DEFAULT_BACKLOG: i32 = 128;

/// Default bound on handshakes running at once
pub const DEFAULT_MAX_CONCURRENT_HANDSHAKES: usize = 64;

/// Source of incoming transport connections
pub trait TransportListener: Send + 'static {
    type Transport: Transport + Send + 'static;

    /// Wait up to `timeout` for a connection
    ///
    /// Returns `Ok(None)` when the timeout elapsed. `None` waits forever.
    fn accept_timeout(&self, timeout: Option<Duration>) -> io::Result<Option<Self::Transport>>;
}

impl TransportListener for TcpListener {
    type Transport = TcpStream;

    fn accept_timeout(&self, timeout: Option<Duration>) -> io::Result<Option<TcpStream>> {
        if !poll_readable(self.as_raw_fd(), timeout)? {
            return Ok(None);
        }

        let (stream, peer) = self.accept()?;
        stream.set_nodelay(true)?;
        debug!(%peer, "Accepted TCP connection");
        Ok(Some(stream))
    }
}

#[derive(Default)]
struct Pending {
    queue: VecDeque<MemoryTransport>,
    closed: bool,
}

#[derive(Default)]
struct MemoryShared {
    pending: Mutex<Pending>,
    ready: Condvar,
}

impl MemoryShared {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-process listener, paired with a [`MemoryConnector`]
pub struct MemoryListener {
    shared: Arc<MemoryShared>,
}

/// Dials a [`MemoryListener`]
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<MemoryShared>,
}

/// Create a connected in-memory listener/connector pair
pub fn memory_listener() -> (MemoryListener, MemoryConnector) {
    let shared = Arc::new(MemoryShared::default());
    (MemoryListener { shared: shared.clone() }, MemoryConnector { shared })
}

impl MemoryConnector {
    /// Open a connection; the listener gets the other end
    pub fn connect(&self) -> io::Result<MemoryTransport> {
        let (local, remote) = memory_pair();
        let mut pending = self.shared.lock();
        if pending.closed {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        pending.queue.push_back(remote);
        drop(pending);
        self.shared.ready.notify_one();
        Ok(local)
    }
}

impl TransportListener for MemoryListener {
    type Transport = MemoryTransport;

    fn accept_timeout(&self, timeout: Option<Duration>) -> io::Result<Option<MemoryTransport>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pending = self.shared.lock();
        loop {
            if let Some(transport) = pending.queue.pop_front() {
                return Ok(Some(transport));
            }
            pending = match deadline {
                None => self.shared.ready.wait(pending).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.shared
                        .ready
                        .wait_timeout(pending, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut pending = self.shared.lock();
        pending.closed = true;
        pending.queue.clear();
    }
}

/// Accept loop settings
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// listen(2) backlog for TCP listeners
    pub backlog: i32,
    /// Handshakes allowed to run at once; further connections wait
    pub max_concurrent_handshakes: usize,
    /// How often the accept loop checks for shutdown
    pub poll_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            backlog: DEFAULT_BACKLOG,
            max_concurrent_handshakes: DEFAULT_MAX_CONCURRENT_HANDSHAKES,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Outcome of one accepted connection
pub enum ListenerEvent<T: Transport> {
    Established(TlsStream<T>),
    /// The handshake failed; the stream is kept for inspection
    Failed { error: TlsError, stream: TlsStream<T> },
}

/// Counting semaphore for in-flight handshakes
struct HandshakeSlots {
    active: Mutex<usize>,
    freed: Condvar,
    max: usize,
}

impl HandshakeSlots {
    fn new(max: usize) -> Self {
        HandshakeSlots { active: Mutex::new(0), freed: Condvar::new(), max: max.max(1) }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until a slot is free without taking it; false once `stop` is set
    fn wait_free(&self, stop: &AtomicBool, poll: Duration) -> bool {
        let mut active = self.lock();
        while *active >= self.max {
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            active = self
                .freed
                .wait_timeout(active, poll)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }

    /// Count an accepted connection until the guard drops
    ///
    /// Only the accept loop claims slots, right after `wait_free`.
    fn claim(self: &Arc<Self>) -> SlotGuard {
        *self.lock() += 1;
        SlotGuard(self.clone())
    }

    fn active(&self) -> usize {
        *self.lock()
    }
}

struct SlotGuard(Arc<HandshakeSlots>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        *self.0.lock() -= 1;
        self.0.freed.notify_one();
    }
}

/// Accepts connections and hands back established TLS streams
pub struct TlsListener<L: TransportListener> {
    listener: L,
    config: TlsConfig,
    settings: ListenerConfig,
}

impl TlsListener<TcpListener> {
    /// Bind a TCP listener with default settings
    pub fn bind<A: ToSocketAddrs>(addr: A, config: TlsConfig) -> Result<Self, TlsError> {
        Self::bind_with(addr, config, ListenerConfig::default())
    }

    /// Bind a TCP listener (SO_REUSEADDR, configurable backlog)
    pub fn bind_with<A: ToSocketAddrs>(
        addr: A,
        config: TlsConfig,
        settings: ListenerConfig,
    ) -> Result<Self, TlsError> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TlsError::InvalidConfig("Listen address resolved to nothing".to_string()))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(settings.backlog)?;
        let listener: TcpListener = socket.into();

        info!(addr = %listener.local_addr()?, backlog = settings.backlog, "TLS listener bound");
        let mut listener = Self::from_listener(listener, config)?;
        listener.settings = settings;
        Ok(listener)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TlsError> {
        Ok(self.listener.local_addr()?)
    }
}

impl<L: TransportListener> TlsListener<L> {
    /// Wrap an existing listener
    pub fn from_listener(listener: L, config: TlsConfig) -> Result<Self, TlsError> {
        if !config.is_server() {
            return Err(TlsError::InvalidConfig(
                "Listener needs a server configuration".to_string(),
            ));
        }
        Ok(TlsListener { listener, config, settings: ListenerConfig::default() })
    }

    pub fn with_settings(mut self, settings: ListenerConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    pub fn settings(&self) -> &ListenerConfig {
        &self.settings
    }

    /// Serve `hostname` (exact or `*.domain`) with its own certificate
    ///
    /// Takes effect for handshakes whose ClientHello arrives afterwards.
    pub fn add_context(&self, hostname: &str, context: ServerContext) -> Result<(), TlsError> {
        self.config.sni_contexts().add(hostname, context)?;
        debug!(hostname, "Added SNI context");
        Ok(())
    }

    /// Accept one connection and complete its handshake
    pub fn accept(&self) -> Result<TlsStream<L::Transport>, TlsError> {
        let transport = loop {
            if let Some(transport) = self.listener.accept_timeout(None)? {
                break transport;
            }
        };
        let mut stream = TlsStream::server(transport, self.config.clone())?;
        stream.handshake()?;
        Ok(stream)
    }

    /// Run the accept loop on a background thread
    ///
    /// Every accepted connection gets its own handshake thread; at most
    /// `max_concurrent_handshakes` run at once. Outcomes arrive on the
    /// returned channel.
    pub fn spawn(self) -> Result<(ListenerHandle, Receiver<ListenerEvent<L::Transport>>), TlsError> {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let slots = Arc::new(HandshakeSlots::new(self.settings.max_concurrent_handshakes));

        let thread = {
            let stop = stop.clone();
            let slots = slots.clone();
            thread::Builder::new()
                .name("vtls-accept".to_string())
                .spawn(move || self.accept_loop(&stop, &slots, tx))?
        };

        Ok((ListenerHandle { stop, slots, thread: Some(thread) }, rx))
    }

    fn accept_loop(
        self,
        stop: &AtomicBool,
        slots: &Arc<HandshakeSlots>,
        tx: Sender<ListenerEvent<L::Transport>>,
    ) {
        let poll = self.settings.poll_interval;
        while !stop.load(Ordering::SeqCst) {
            if !slots.wait_free(stop, poll) {
                break;
            }
            let transport = match self.listener.accept_timeout(Some(poll)) {
                Ok(Some(transport)) => transport,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    thread::sleep(poll);
                    continue;
                }
            };
            let slot = slots.claim();

            let config = self.config.clone();
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name("vtls-handshake".to_string())
                .spawn(move || {
                    let _slot = slot;
                    handshake_one(transport, config, &tx);
                });
            if let Err(e) = spawned {
                warn!(error = %e, "Could not spawn handshake thread");
            }
        }
        debug!("Accept loop stopped");
    }
}

fn handshake_one<T: Transport>(transport: T, config: TlsConfig, tx: &Sender<ListenerEvent<T>>) {
    let mut stream = match TlsStream::server(transport, config) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Could not create server connection");
            return;
        }
    };
    let event = match stream.handshake() {
        Ok(()) => ListenerEvent::Established(stream),
        Err(error) => ListenerEvent::Failed { error, stream },
    };
    // Nobody listening any more is not an error.
    let _ = tx.send(event);
}

/// Controls a spawned accept loop
pub struct ListenerHandle {
    stop: Arc<AtomicBool>,
    slots: Arc<HandshakeSlots>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Handshakes currently running
    pub fn active_handshakes(&self) -> usize {
        self.slots.active()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Stop accepting and wait for the accept loop to exit
    ///
    /// Handshakes already running finish on their own threads.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.slots.freed.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsVersion;
    use crate::handshake::HandshakeState;
    use crate::test_support::ca_and_identity;
    use crate::verify::TrustAnchors;
    use std::sync::atomic::AtomicUsize;

    fn client() -> TlsConfig {
        TlsConfig::client().verify_peer(false).build().unwrap()
    }

    #[test]
    fn test_spawned_listener_reports_established() {
        let (listener, connector) = memory_listener();
        let server = TlsConfig::server().build().unwrap();
        let (handle, events) = TlsListener::from_listener(listener, server).unwrap().spawn().unwrap();

        let clients: Vec<_> = (0..3)
            .map(|_| {
                let connector = connector.clone();
                thread::spawn(move || client().connect(connector.connect().unwrap()).unwrap())
            })
            .collect();

        for _ in 0..3 {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                ListenerEvent::Established(stream) => {
                    assert_eq!(stream.state(), HandshakeState::Established);
                }
                ListenerEvent::Failed { error, .. } => panic!("handshake failed: {}", error),
            }
        }
        for c in clients {
            c.join().unwrap();
        }
        assert!(handle.is_running());
        handle.shutdown();
    }

    #[test]
    fn test_failure_event_carries_stream() {
        let (listener, connector) = memory_listener();
        let server = TlsConfig::server().version(TlsVersion::Tls12).build().unwrap();
        let (handle, events) = TlsListener::from_listener(listener, server).unwrap().spawn().unwrap();

        let tls13_only = TlsConfig::client()
            .version(TlsVersion::Tls13)
            .verify_peer(false)
            .build()
            .unwrap();
        let err = tls13_only.connect(connector.connect().unwrap()).err().unwrap();
        assert!(matches!(err, TlsError::AlertReceived(_)));

        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            ListenerEvent::Failed { error, stream } => {
                assert!(matches!(error, TlsError::Negotiation(_)));
                assert_eq!(stream.state(), HandshakeState::Failed);
                assert_eq!(stream.info().alert.as_deref(), Some("protocol_version"));
            }
            ListenerEvent::Established(_) => panic!("handshake should fail"),
        }
        handle.shutdown();
    }

    #[test]
    fn test_sni_context_selection() {
        let (listener, connector) = memory_listener();
        let tls = TlsListener::from_listener(listener, TlsConfig::server().build().unwrap()).unwrap();
        let (ca, identity) = ca_and_identity(&["*.example.com"]);
        tls.add_context("*.example.com", ServerContext::new(identity)).unwrap();

        let server = thread::spawn(move || tls.accept().unwrap());
        let client = TlsConfig::client()
            .servername("api.example.com")
            .trust_anchors(TrustAnchors::new(vec![ca]))
            .build()
            .unwrap();
        let stream = client.connect(connector.connect().unwrap()).unwrap();
        assert!(stream.authorized());
        let leaf = stream.peer_certificate_chain().unwrap().leaf().unwrap();
        assert_eq!(leaf.subject.common_name.as_deref(), Some("*.example.com"));

        let accepted = server.join().unwrap();
        assert_eq!(accepted.servername(), Some("api.example.com"));
    }

    #[test]
    fn test_sni_callback_selects_context() {
        let (ca, identity) = ca_and_identity(&["dynamic.example.net"]);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let server = TlsConfig::server()
            .sni_callback(move |name| {
                seen.fetch_add(1, Ordering::SeqCst);
                (name == "dynamic.example.net").then(|| ServerContext::new(identity.clone()))
            })
            .build()
            .unwrap();

        let (listener, connector) = memory_listener();
        let tls = TlsListener::from_listener(listener, server).unwrap();
        // The callback wins over a map entry for the same name.
        let (_, shadowed) = ca_and_identity(&["dynamic.example.net"]);
        tls.add_context("dynamic.example.net", ServerContext::new(shadowed)).unwrap();
        let server = thread::spawn(move || {
            for _ in 0..2 {
                tls.accept().unwrap();
            }
        });

        let client = TlsConfig::client()
            .servername("dynamic.example.net")
            .trust_anchors(TrustAnchors::new(vec![ca]))
            .build()
            .unwrap();
        let stream = client.connect(connector.connect().unwrap()).unwrap();
        assert!(stream.authorized());

        // Declined names fall through to the default identity.
        let other = TlsConfig::client()
            .servername("other.test")
            .verify_peer(false)
            .build()
            .unwrap();
        let stream = other.connect(connector.connect().unwrap()).unwrap();
        let leaf = stream.peer_certificate_chain().unwrap().leaf().unwrap();
        assert_eq!(leaf.subject.common_name.as_deref(), Some("localhost"));

        server.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_name_gets_default_context() {
        let (listener, connector) = memory_listener();
        let tls = TlsListener::from_listener(listener, TlsConfig::server().build().unwrap()).unwrap();
        let (_, identity) = ca_and_identity(&["example.com"]);
        tls.add_context("example.com", ServerContext::new(identity)).unwrap();

        let server = thread::spawn(move || tls.accept().unwrap());
        let client = TlsConfig::client()
            .servername("other.test")
            .verify_peer(false)
            .build()
            .unwrap();
        let stream = client.connect(connector.connect().unwrap()).unwrap();
        let leaf = stream.peer_certificate_chain().unwrap().leaf().unwrap();
        assert_eq!(leaf.subject.common_name.as_deref(), Some("localhost"));
        server.join().unwrap();
    }

    #[test]
    fn test_tcp_bind_and_accept() {
        let listener = TlsListener::bind("127.0.0.1:0", TlsConfig::server().build().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let mut stream = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            let n = stream.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"Hello");
            stream.write(b"World").unwrap();
            stream.close().unwrap();
        });

        let tcp = TcpStream::connect(addr).unwrap();
        let mut stream = client().connect(tcp).unwrap();
        stream.write(b"Hello").unwrap();
        let mut buf = [0u8; 5];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"World");
        let mut rest = [0u8; 1];
        assert_eq!(stream.read(&mut rest).unwrap(), 0);

        server.join().unwrap();
    }

    #[test]
    fn test_handshake_slots() {
        let slots = Arc::new(HandshakeSlots::new(1));
        let stop = AtomicBool::new(false);
        assert!(slots.wait_free(&stop, Duration::from_millis(10)));
        assert_eq!(slots.active(), 0);
        let first = slots.claim();
        assert_eq!(slots.active(), 1);

        let waiter = {
            let slots = slots.clone();
            thread::spawn(move || {
                let stop = AtomicBool::new(false);
                slots.wait_free(&stop, Duration::from_millis(10))
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(slots.active(), 1);
        drop(first);
        assert!(waiter.join().unwrap());
        assert_eq!(slots.active(), 0);

        let _held = slots.claim();
        stop.store(true, Ordering::SeqCst);
        assert!(!slots.wait_free(&stop, Duration::from_millis(10)));
    }

    fn wait_for_active(handle: &ListenerHandle, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.active_handshakes() != expected {
            assert!(Instant::now() < deadline, "active handshakes stuck at {}", handle.active_handshakes());
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_active_handshakes_counts_accepted_connections() {
        let (listener, connector) = memory_listener();
        let settings = ListenerConfig { poll_interval: Duration::from_millis(10), ..Default::default() };
        let (handle, events) = TlsListener::from_listener(listener, TlsConfig::server().build().unwrap())
            .unwrap()
            .with_settings(settings)
            .spawn()
            .unwrap();

        // An idle accept loop holds no slot.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.active_handshakes(), 0);

        // A connection that never sends its ClientHello holds one.
        let silent = connector.connect().unwrap();
        wait_for_active(&handle, 1);

        drop(silent);
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            ListenerEvent::Failed { .. } => {}
            ListenerEvent::Established(_) => panic!("handshake should fail"),
        }
        wait_for_active(&handle, 0);
        handle.shutdown();
    }

    #[test]
    fn test_tcp_accept_timeout_waits_full_duration() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let start = Instant::now();
        assert!(listener.accept_timeout(Some(Duration::from_micros(500))).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_micros(500));

        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        assert!(listener.accept_timeout(Some(Duration::from_secs(5))).unwrap().is_some());
    }

    #[test]
    fn test_connector_refused_after_listener_drop() {
        let (listener, connector) = memory_listener();
        drop(listener);
        assert_eq!(connector.connect().err().unwrap().kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_client_config_rejected() {
        let (listener, _) = memory_listener();
        assert!(TlsListener::from_listener(listener, client()).is_err());
    }
}
