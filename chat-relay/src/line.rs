//! Newline framing over a non-blocking byte stream.
//!
//! A readiness event only says "some bytes are available". A line may be
//! split across several events, or several lines may arrive in one, so each
//! session keeps a [`LineBuffer`] that accumulates raw bytes and hands out
//! complete lines. Whatever follows the last terminator is carried over to
//! the next event.

use std::io::{self, Read};

use thiserror::Error;

/// Upper bound for a pending line when none is configured.
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Most bytes one call to [`LineBuffer::fill_from`] takes from a reader.
pub const READ_BUDGET: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// What the stream looked like once it had been drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The socket has no more bytes right now but is still open.
    Open,
    /// The peer closed its side of the connection.
    Eof,
    /// The read budget ran out first; the socket may still hold bytes.
    Throttled,
}

#[derive(Debug, Error)]
pub enum LineError {
    #[error("pending line exceeds {limit} bytes without a terminator")]
    TooLong { limit: usize },
    #[error("failed to read from connection")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line_len: usize,
}

impl LineBuffer {
    pub fn new(max_line_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_len,
        }
    }

    /// Reads until the source would block, reports EOF, or [`READ_BUDGET`]
    /// bytes have been taken.
    ///
    /// Readiness notifications are edge-triggered, so a caller that gets
    /// [`Fill::Throttled`] must come back to this reader without waiting for
    /// another wake-up.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> Result<Fill, LineError> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut taken = 0;
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(read) => {
                    self.pending.extend_from_slice(&chunk[..read]);
                    self.check_unterminated_len()?;
                    taken += read;
                    if taken >= READ_BUDGET {
                        return Ok(Fill::Throttled);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::Open),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(LineError::Io(err)),
            }
        }
    }

    /// Pops the oldest complete line, terminator included.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|byte| *byte == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn check_unterminated_len(&self) -> Result<(), LineError> {
        let tail = match self.pending.iter().rposition(|byte| *byte == b'\n') {
            Some(last) => self.pending.len() - last - 1,
            None => self.pending.len(),
        };
        if tail > self.max_line_len {
            return Err(LineError::TooLong {
                limit: self.max_line_len,
            });
        }
        Ok(())
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LEN)
    }
}
