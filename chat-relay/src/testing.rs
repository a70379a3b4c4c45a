//! In-memory stand-in for a non-blocking TCP stream.

use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{self, Read, Write},
    rc::Rc,
};

use mio::{Interest, Registry, Token, event::Source};

use crate::session::Connection;

/// Cloning shares the underlying buffers, so a test can keep one handle
/// while the registry owns another.
#[derive(Clone, Default)]
pub(crate) struct MockStream {
    state: Rc<RefCell<MockState>>,
}

#[derive(Default)]
struct MockState {
    input: VecDeque<u8>,
    output: Vec<u8>,
    input_closed: bool,
    fail_reads: bool,
    fail_writes: bool,
    write_budget: Option<usize>,
    stalls: usize,
    interest: Option<Interest>,
}

impl MockStream {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_input(&self, text: &str) {
        self.state.borrow_mut().input.extend(text.as_bytes());
    }

    pub(crate) fn close_input(&self) {
        self.state.borrow_mut().input_closed = true;
    }

    pub(crate) fn fail_reads(&self) {
        self.state.borrow_mut().fail_reads = true;
    }

    pub(crate) fn fail_writes(&self) {
        self.state.borrow_mut().fail_writes = true;
    }

    /// Limits how many more bytes the "socket" accepts before it would block.
    pub(crate) fn set_write_budget(&self, budget: Option<usize>) {
        self.state.borrow_mut().write_budget = budget;
    }

    pub(crate) fn take_output(&self) -> String {
        let bytes = std::mem::take(&mut self.state.borrow_mut().output);
        String::from_utf8(bytes).expect("relay writes utf-8")
    }

    /// How many times a writer had to wait for the "peer" to drain the socket.
    pub(crate) fn stalls(&self) -> usize {
        self.state.borrow().stalls
    }

    pub(crate) fn interest(&self) -> Option<Interest> {
        self.state.borrow().interest
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.fail_reads {
            return Err(io::Error::from(io::ErrorKind::ConnectionReset));
        }
        if state.input.is_empty() {
            if state.input_closed {
                return Ok(0);
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let count = buf.len().min(state.input.len());
        for (slot, byte) in buf.iter_mut().zip(state.input.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.fail_writes {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let accepted = match state.write_budget {
            Some(0) => return Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Some(budget) => budget.min(buf.len()),
            None => buf.len(),
        };
        if let Some(budget) = state.write_budget.as_mut() {
            *budget -= accepted;
        }
        state.output.extend_from_slice(&buf[..accepted]);
        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connection for MockStream {
    /// Stands in for the peer catching up: everything left is accepted at once.
    fn write_all_waiting(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_writes {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        state.stalls += 1;
        state.output.extend_from_slice(buf);
        Ok(())
    }
}

impl Source for MockStream {
    fn register(&mut self, _: &Registry, _: Token, interests: Interest) -> io::Result<()> {
        self.state.borrow_mut().interest = Some(interests);
        Ok(())
    }

    fn reregister(&mut self, _: &Registry, _: Token, interests: Interest) -> io::Result<()> {
        self.state.borrow_mut().interest = Some(interests);
        Ok(())
    }

    fn deregister(&mut self, _: &Registry) -> io::Result<()> {
        self.state.borrow_mut().interest = None;
        Ok(())
    }
}

/// A registry handle for tests; the returned `Poll` must outlive it.
pub(crate) fn watcher() -> (mio::Poll, Registry) {
    let poll = mio::Poll::new().expect("create poll");
    let registry = poll.registry().try_clone().expect("clone registry");
    (poll, registry)
}
