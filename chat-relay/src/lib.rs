//! Line-oriented chat relay driven by a single readiness loop.
//!
//! Clients connect over TCP, send their name as the first line and then chat
//! line by line. Every line is relayed to all other connected clients until
//! the sender types `BYE`. The server side runs on one thread: a `mio` poll
//! multiplexes the listener and every client socket, so there is no thread
//! per connection and no locking.
//!
//! - [`event_loop`] owns the poller and the listener, accepts clients and
//!   dispatches ready sessions.
//! - [`registry`] is the fixed-capacity slot table of live sessions.
//! - [`session`] holds per-client state and the name/message/`BYE` state
//!   machine.
//! - [`router`] fans a generated line out to everyone except the sender.
//! - [`line`] frames raw socket bytes into newline-terminated lines.
//! - [`client`] is the interactive terminal peer; [`cli`] parses arguments
//!   for both modes.

pub mod cli;
pub mod client;
pub mod event_loop;
pub mod line;
pub mod registry;
pub mod router;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use event_loop::{EventLoop, RelayConfig, RelayError, ShutdownHandle};
