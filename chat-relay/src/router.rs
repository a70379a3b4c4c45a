//! Fan-out of generated lines to every session except the sender.

use tracing::debug;

use crate::{registry::ConnectionRegistry, session::Connection};

/// Delivers `text` to every active session other than `sender`.
///
/// Recipients are visited in ascending slot order and each one is written in
/// full before the next is touched. A recipient that is slow to read holds up
/// the rest of the broadcast, and the loop with it, but a broadcast is always
/// complete before the caller can start another.
///
/// Returns the slots whose connection failed while writing; the caller tears
/// them down.
pub fn broadcast<S: Connection>(
    registry: &mut ConnectionRegistry<S>,
    text: &str,
    sender: usize,
) -> Vec<usize> {
    let recipients: Vec<usize> = registry
        .iter_active()
        .map(|session| session.slot())
        .filter(|slot| *slot != sender)
        .collect();

    let mut failed = Vec::new();
    for slot in recipients {
        let Some(session) = registry.get_mut(slot) else {
            continue;
        };
        if let Err(error) = session.deliver(text) {
            debug!(slot, ?error, "failed to deliver line");
            failed.push(slot);
        }
    }
    failed
}
