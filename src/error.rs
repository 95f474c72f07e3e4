//! Crate-level error type.
//!
//! Splits failures the way the reactor treats them: construction and polling
//! errors are fatal to the loop, registration preconditions fail at the call
//! site, and socket-level failures of the public API carry the underlying
//! OS error. Per-connection I/O errors never appear here; they reach the
//! application exactly once through [`Protocol::disconnected`].
//!
//! [`Protocol::disconnected`]: crate::Protocol::disconnected

use std::io;

use thiserror::Error;

/// Errors surfaced by the reactor's public API.
#[derive(Debug, Error)]
pub enum Error {
    /// The selector backend could not be created. The loop cannot run.
    #[error("selector backend initialization failed: {0}")]
    BackendInit(#[source] io::Error),

    /// The blocking wait failed with something other than an interruption.
    #[error("polling wait failed: {0}")]
    Poll(#[source] io::Error),

    /// A listening watcher was registered before a protocol factory was
    /// installed with `set_protocol` or `set_protocol_factory`.
    #[error("no protocol factory installed on listening watcher")]
    MissingFactory,

    /// A socket operation issued through the public API failed.
    #[error("socket operation failed: {0}")]
    Socket(#[from] io::Error),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
