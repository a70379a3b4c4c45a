//! Per-connection state and the line protocol state machine.

use std::{
    io::{self, Read, Write},
    net::SocketAddr,
};

use mio::{event::Source, net::TcpStream};

use crate::line::{Fill, LineBuffer, LineError};

/// The exact line a client sends to leave. `BYE\r\n` or `BYE` alone do not count.
pub const SENTINEL: &str = "BYE\n";

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Anything the relay can watch for readiness and exchange bytes with.
pub trait Connection: Read + Write + Source {
    /// Writes all of `buf`, waiting for the peer to make room whenever the
    /// socket is full. The connection is non-blocking again on return.
    fn write_all_waiting(&mut self, buf: &[u8]) -> io::Result<()>;
}

impl Connection for TcpStream {
    fn write_all_waiting(&mut self, buf: &[u8]) -> io::Result<()> {
        // The duplicate shares the file status flags, so this blocks `self` too.
        let mut blocking = blocking_view(self)?;
        blocking.set_nonblocking(false)?;
        let written = blocking.write_all(buf).and_then(|()| blocking.flush());
        blocking.set_nonblocking(true)?;
        written
    }
}

#[cfg(unix)]
fn blocking_view(stream: &TcpStream) -> io::Result<std::net::TcpStream> {
    use std::os::fd::AsFd;
    Ok(std::net::TcpStream::from(stream.as_fd().try_clone_to_owned()?))
}

#[cfg(windows)]
fn blocking_view(stream: &TcpStream) -> io::Result<std::net::TcpStream> {
    use std::os::windows::io::AsSocket;
    Ok(std::net::TcpStream::from(stream.as_socket().try_clone_to_owned()?))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, waiting for the first line, which becomes the display name.
    Unnamed,
    Named(String),
    Closed,
}

/// What a single inbound line asks the relay to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The client named itself; the announcement goes to everyone else.
    Joined { name: String, announcement: String },
    /// A chat line to relay to everyone else.
    Relay(String),
    /// The client said goodbye. Nothing is broadcast.
    Disconnect,
}

pub fn join_announcement(name: &str) -> String {
    format!("{name} has joined\n")
}

/// `line` keeps its terminator, so the relayed text ends the way the sender's did.
pub fn relayed_message(name: &str, line: &str) -> String {
    format!("Message from {name}: {line}")
}

pub struct ClientSession<S> {
    slot: usize,
    stream: S,
    peer: Option<SocketAddr>,
    state: SessionState,
    inbound: LineBuffer,
}

impl<S> ClientSession<S> {
    pub(crate) fn new(slot: usize, stream: S, peer: Option<SocketAddr>, max_line_len: usize) -> Self {
        Self {
            slot,
            stream,
            peer,
            state: SessionState::Unnamed,
            inbound: LineBuffer::new(max_line_len),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn identity(&self) -> Option<&str> {
        match &self.state {
            SessionState::Named(name) => Some(name),
            _ => None,
        }
    }

    pub fn pending_input(&self) -> usize {
        self.inbound.len()
    }

    /// Advances the state machine by one complete line.
    pub fn advance(&mut self, line: &str) -> Outcome {
        match &self.state {
            SessionState::Unnamed => {
                let name = line.trim_end_matches(LINE_ENDINGS).to_string();
                let announcement = join_announcement(&name);
                self.state = SessionState::Named(name.clone());
                Outcome::Joined { name, announcement }
            }
            SessionState::Named(_) if line == SENTINEL => {
                self.close();
                Outcome::Disconnect
            }
            SessionState::Named(name) => Outcome::Relay(relayed_message(name, line)),
            SessionState::Closed => Outcome::Disconnect,
        }
    }

    pub(crate) fn next_line(&mut self) -> Option<String> {
        if self.state == SessionState::Closed {
            return None;
        }
        self.inbound.next_line()
    }

    /// Moves the session to `Closed` and drops any buffered input.
    ///
    /// Returns the identity it had, if any.
    pub(crate) fn close(&mut self) -> Option<String> {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        self.inbound.clear();
        match previous {
            SessionState::Named(name) => Some(name),
            _ => None,
        }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: Read> ClientSession<S> {
    pub(crate) fn fill_inbound(&mut self) -> Result<Fill, LineError> {
        self.inbound.fill_from(&mut self.stream)
    }
}

impl<S: Connection> ClientSession<S> {
    /// Writes `text` to the peer in full before returning.
    ///
    /// Nothing is kept back for later: if the socket fills up, this waits
    /// until the peer has read enough to take the rest.
    pub(crate) fn deliver(&mut self, text: &str) -> io::Result<()> {
        let mut remaining = text.as_bytes();
        while !remaining.is_empty() {
            match self.stream.write(remaining) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(written) => remaining = &remaining[written..],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return self.stream.write_all_waiting(remaining);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        self.stream.flush()
    }
}
