//! Application protocol seam.
//!
//! The reactor calls into application code through exactly three lifecycle
//! callbacks; everything else (framing, request parsing, timeouts) is
//! layered on top of them by the application.

use std::io;

use crate::reactor::transport::Transport;

/// The application-supplied handler for one connection.
///
/// One instance exists per connection, produced by the factory installed on
/// the listening watcher (or passed explicitly for outbound and adopted
/// connections). All callbacks run synchronously on the loop thread; a
/// callback that blocks stalls the entire loop.
pub trait Protocol {
    /// The connection is established. The handle may be cloned and stored
    /// for writing from later callbacks or timers.
    fn connected(&mut self, _transport: Transport) {}

    /// Bytes arrived. `data` is everything drained from the socket this
    /// cycle; no framing is applied.
    fn received(&mut self, data: &[u8]);

    /// The connection is gone. `Some(error)` for an abnormal close, `None`
    /// for a clean one. Delivered exactly once, last.
    fn disconnected(&mut self, _error: Option<io::Error>) {}
}

/// Produces a fresh [`Protocol`] instance per accepted connection.
pub type ProtocolFactory = Box<dyn FnMut() -> Box<dyn Protocol>>;
