//! Fixed-capacity slot table of live sessions.
//!
//! The registry is the only place that touches the readiness watch set for
//! client connections: a stream is registered when it is bound to a slot and
//! deregistered before the slot is freed, so a token is watched iff its slot
//! holds an active session. Slot indices double as `mio` tokens.

use std::{io, net::SocketAddr};

use mio::{Interest, Registry, Token};
use thiserror::Error;
use tracing::debug;

use crate::session::{ClientSession, Connection};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection capacity of {capacity} reached")]
    CapacityExceeded { capacity: usize },
    #[error("failed to watch connection for readiness")]
    Watch(#[source] io::Error),
}

/// A session that has been torn down and whose slot is free again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub slot: usize,
    pub peer: Option<SocketAddr>,
    pub identity: Option<String>,
}

enum Slot<S> {
    Free,
    Occupied(ClientSession<S>),
}

impl<S> Slot<S> {
    fn is_free(&self) -> bool {
        matches!(self, Slot::Free)
    }

    fn session(&self) -> Option<&ClientSession<S>> {
        match self {
            Slot::Occupied(session) => Some(session),
            Slot::Free => None,
        }
    }

    fn session_mut(&mut self) -> Option<&mut ClientSession<S>> {
        match self {
            Slot::Occupied(session) => Some(session),
            Slot::Free => None,
        }
    }
}

pub struct ConnectionRegistry<S> {
    slots: Box<[Slot<S>]>,
    /// Highest occupied slot; bounds every scan over the table.
    max_slot: Option<usize>,
    active: usize,
    watcher: Registry,
    max_line_len: usize,
}

impl<S: Connection> ConnectionRegistry<S> {
    pub fn new(watcher: Registry, capacity: usize, max_line_len: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::Free).collect();
        Self {
            slots,
            max_slot: None,
            active: 0,
            watcher,
            max_line_len,
        }
    }

    /// Binds `stream` to the first free slot and starts watching it.
    ///
    /// On failure the stream is dropped, which closes the connection, and no
    /// existing entry is touched.
    pub fn add(&mut self, mut stream: S, peer: Option<SocketAddr>) -> Result<usize, RegistryError> {
        let slot = self
            .slots
            .iter()
            .position(Slot::is_free)
            .ok_or(RegistryError::CapacityExceeded {
                capacity: self.capacity(),
            })?;

        self.watcher
            .register(&mut stream, Token(slot), Interest::READABLE)
            .map_err(RegistryError::Watch)?;

        self.slots[slot] = Slot::Occupied(ClientSession::new(slot, stream, peer, self.max_line_len));
        self.active += 1;
        self.max_slot = Some(self.max_slot.map_or(slot, |max| max.max(slot)));
        Ok(slot)
    }

    /// Unwatches and closes the session in `slot`, then frees the slot.
    ///
    /// Other slots keep their indices. Returns `None` if the slot was free.
    pub fn remove(&mut self, slot: usize) -> Option<Departure> {
        let entry = self.slots.get_mut(slot)?;
        let Slot::Occupied(mut session) = std::mem::replace(entry, Slot::Free) else {
            return None;
        };

        if let Err(error) = self.watcher.deregister(session.stream_mut()) {
            debug!(slot, ?error, "failed to deregister connection");
        }
        let peer = session.peer();
        let identity = session.close();
        drop(session);

        self.active -= 1;
        if self.max_slot == Some(slot) {
            self.max_slot = self.slots[..slot].iter().rposition(|entry| !entry.is_free());
        }

        Some(Departure {
            slot,
            peer,
            identity,
        })
    }
}

impl<S> ConnectionRegistry<S> {
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn max_slot(&self) -> Option<usize> {
        self.max_slot
    }

    pub fn is_active(&self, slot: usize) -> bool {
        self.get(slot).is_some()
    }

    pub fn get(&self, slot: usize) -> Option<&ClientSession<S>> {
        self.slots.get(slot).and_then(Slot::session)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ClientSession<S>> {
        self.slots.get_mut(slot).and_then(Slot::session_mut)
    }

    /// Active sessions in ascending slot order.
    ///
    /// The iterator is lazy and bounded by `max_slot`; calling this again
    /// restarts from slot 0.
    pub fn iter_active(&self) -> impl Iterator<Item = &ClientSession<S>> {
        self.slots[..self.scan_end()].iter().filter_map(Slot::session)
    }

    fn scan_end(&self) -> usize {
        self.max_slot.map_or(0, |max| max + 1)
    }
}
