//! The single-threaded readiness loop that drives the relay.
//!
//! One thread owns the poller, the listener and the [`ConnectionRegistry`].
//! Each iteration blocks in `Poll::poll` with no timeout, then accepts new
//! connections and runs one dispatch unit for every ready session in
//! ascending slot order. Nothing is spawned per connection and nothing is
//! shared, so there are no locks. Every broadcast is written to each
//! recipient in full before the loop moves on, so a peer that stops reading
//! holds up the whole relay until it catches up.

use std::{
    io,
    net::{self, SocketAddr},
    sync::Arc,
    time::Duration,
};

use mio::{
    Events, Interest, Poll, Token, Waker,
    net::{TcpListener, TcpStream},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    line::{DEFAULT_MAX_LINE_LEN, Fill, LineError},
    registry::{ConnectionRegistry, RegistryError},
    router,
    session::Outcome,
};

/// Maximum simultaneous clients when none is configured.
pub const DEFAULT_CAPACITY: usize = 5;

const LISTENER: Token = Token(usize::MAX);
const SHUTDOWN: Token = Token(usize::MAX - 1);
const EVENTS_CAPACITY: usize = 128;
/// How soon to try the listener again after `accept` failed with connections
/// possibly still queued.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to set up the listening socket")]
    Listen(#[source] io::Error),
    #[error("failed to create the readiness poller")]
    Poller(#[source] io::Error),
    #[error("waiting for readiness failed")]
    Poll(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Hard upper bound on connected clients; further connections are closed on accept.
    pub capacity: usize,
    /// Longest line a client may leave unterminated before it is disconnected.
    pub max_line_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// Stops a running [`EventLoop`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

pub struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    registry: ConnectionRegistry<TcpStream>,
    waker: Arc<Waker>,
    /// Set while the accept backlog may hold connections no event will report.
    accept_stalled: bool,
}

impl EventLoop {
    /// Binds `addr` and prepares a loop around the new listener.
    pub fn bind(addr: SocketAddr, config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).map_err(RelayError::Listen)?;
        Self::with_listener(listener, config)
    }

    /// Wraps a listener that was bound elsewhere.
    pub fn new(listener: net::TcpListener, config: RelayConfig) -> Result<Self, RelayError> {
        listener.set_nonblocking(true).map_err(RelayError::Listen)?;
        Self::with_listener(TcpListener::from_std(listener), config)
    }

    fn with_listener(mut listener: TcpListener, config: RelayConfig) -> Result<Self, RelayError> {
        let poll = Poll::new().map_err(RelayError::Poller)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(RelayError::Listen)?;
        let waker = Waker::new(poll.registry(), SHUTDOWN).map_err(RelayError::Poller)?;
        let watcher = poll.registry().try_clone().map_err(RelayError::Poller)?;

        Ok(Self {
            poll,
            listener,
            registry: ConnectionRegistry::new(watcher, config.capacity, config.max_line_len),
            waker: Arc::new(waker),
            accept_stalled: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: Arc::clone(&self.waker),
        }
    }

    /// Runs until a [`ShutdownHandle`] fires or polling fails.
    pub fn run(mut self) -> Result<(), RelayError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut ready = ReadySet::new(self.registry.capacity());

        loop {
            let timeout = self.poll_timeout(&ready);
            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(RelayError::Poll(err));
            }
            ready.collect(&events);

            if ready.shutdown {
                info!(clients = self.registry.len(), "relay shutting down");
                return Ok(());
            }

            if ready.listener || self.accept_stalled {
                self.accept_pending();
            }
            if ready.listener {
                ready.remaining -= 1;
            }
            if ready.remaining == 0 {
                continue;
            }

            self.dispatch_ready(&mut ready);
        }
    }

    /// No timeout unless some work is owed without an event to announce it.
    fn poll_timeout(&self, ready: &ReadySet) -> Option<Duration> {
        if ready.has_deferred() {
            Some(Duration::ZERO)
        } else if self.accept_stalled {
            Some(ACCEPT_RETRY)
        } else {
            None
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.register(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.accept_stalled = false;
                    break;
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue;
                }
                Err(err) => {
                    if self.accept_stalled {
                        debug!(error = ?err, "accept still failing");
                    } else {
                        warn!(error = ?err, "failed to accept connection, will retry");
                    }
                    self.accept_stalled = true;
                    break;
                }
            }
        }
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) {
        match self.registry.add(stream, Some(peer)) {
            Ok(slot) => info!(slot, %peer, "client connected"),
            Err(RegistryError::CapacityExceeded { capacity }) => {
                warn!(%peer, capacity, "relay is full, connection rejected");
            }
            Err(err) => warn!(%peer, error = ?err, "failed to register connection"),
        }
    }

    fn dispatch_ready(&mut self, ready: &mut ReadySet) {
        let Some(max_slot) = self.registry.max_slot() else {
            return;
        };

        for slot in 0..=max_slot {
            if ready.remaining == 0 {
                break;
            }
            if !ready.take(slot) {
                continue;
            }
            ready.remaining -= 1;
            // A broadcast earlier in this scan may already have torn it down.
            if self.registry.is_active(slot) && self.service_input(slot) {
                ready.defer(slot);
            }
        }
    }

    /// One unit of work for a ready session.
    ///
    /// Returns `true` when the read budget ran out and the socket may still
    /// hold bytes.
    fn service_input(&mut self, slot: usize) -> bool {
        let Some(session) = self.registry.get_mut(slot) else {
            return false;
        };
        let fill = session.fill_inbound();

        // Lines that arrived before an EOF or error are still honoured.
        loop {
            let Some(session) = self.registry.get_mut(slot) else {
                return false;
            };
            let Some(line) = session.next_line() else {
                break;
            };
            match session.advance(&line) {
                Outcome::Joined { name, announcement } => {
                    info!(slot, %name, "{}", announcement.trim_end());
                    self.broadcast(&announcement, slot);
                }
                Outcome::Relay(text) => {
                    info!(slot, "{}", text.trim_end());
                    self.broadcast(&text, slot);
                }
                Outcome::Disconnect => {
                    self.teardown(slot, "client said goodbye");
                    return false;
                }
            }
        }

        match fill {
            Ok(Fill::Open) => false,
            Ok(Fill::Throttled) => true,
            Ok(Fill::Eof) => {
                self.teardown(slot, "connection closed by peer");
                false
            }
            Err(LineError::TooLong { limit }) => {
                warn!(slot, limit, "line too long, dropping client");
                self.teardown(slot, "line too long");
                false
            }
            Err(LineError::Io(error)) => {
                debug!(slot, ?error, "read failed");
                self.teardown(slot, "read failed");
                false
            }
        }
    }

    fn broadcast(&mut self, text: &str, sender: usize) {
        for failed in router::broadcast(&mut self.registry, text, sender) {
            self.teardown(failed, "write failed");
        }
    }

    /// Removes the session silently; other clients are never told.
    fn teardown(&mut self, slot: usize, reason: &str) {
        if let Some(departure) = self.registry.remove(slot) {
            info!(
                slot,
                peer = ?departure.peer,
                name = departure.identity.as_deref().unwrap_or("<unnamed>"),
                reason,
                "client disconnected"
            );
        }
    }
}

/// Everything one wake-up reported, indexed by slot.
///
/// `remaining` counts distinct ready handles (listener included) so the
/// slot scan can stop as soon as every one of them has been served. Slots
/// deferred during a scan are ready again on the next collect.
struct ReadySet {
    listener: bool,
    shutdown: bool,
    slots: Vec<bool>,
    deferred: Vec<bool>,
    remaining: usize,
}

impl ReadySet {
    fn new(capacity: usize) -> Self {
        Self {
            listener: false,
            shutdown: false,
            slots: vec![false; capacity],
            deferred: vec![false; capacity],
            remaining: 0,
        }
    }

    fn collect(&mut self, events: &Events) {
        self.listener = false;
        self.shutdown = false;
        for (ready, deferred) in self.slots.iter_mut().zip(self.deferred.iter_mut()) {
            *ready = std::mem::take(deferred);
        }
        self.remaining = self.slots.iter().filter(|ready| **ready).count();

        for event in events.iter() {
            match event.token() {
                LISTENER => self.listener = true,
                SHUTDOWN => self.shutdown = true,
                // Sessions only ask for readable events; a hang-up or error
                // also surfaces through the read.
                Token(slot) => {
                    if let Some(ready) = self.slots.get_mut(slot) {
                        if !*ready {
                            *ready = true;
                            self.remaining += 1;
                        }
                    }
                }
            }
        }

        if self.listener {
            self.remaining += 1;
        }
    }

    fn take(&mut self, slot: usize) -> bool {
        self.slots.get_mut(slot).map(std::mem::take).unwrap_or(false)
    }

    fn defer(&mut self, slot: usize) {
        if let Some(deferred) = self.deferred.get_mut(slot) {
            *deferred = true;
        }
    }

    fn has_deferred(&self) -> bool {
        self.deferred.contains(&true)
    }
}
