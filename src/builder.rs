//! Fluent builder for reactor construction.
//!
//! Provides a builder pattern interface for creating and configuring
//! [`Reactor`] instances; every knob has a default suited to a small
//! server, so `Reactor::new()` is the common path.

use std::time::Duration;

use crate::error::Result;
use crate::reactor::core::Reactor;

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) events_capacity: usize,
    pub(crate) read_chunk: usize,
    pub(crate) max_outbound: usize,
    pub(crate) backlog: i32,
    pub(crate) watchdog: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            events_capacity: 64,
            read_chunk: 4096,
            max_outbound: 8 * 1024 * 1024,
            backlog: 128,
            watchdog: Duration::from_secs(1),
        }
    }
}

/// Builder for constructing [`Reactor`] instances with a fluent API.
///
/// # Example
/// ```ignore
/// let reactor = ReactorBuilder::new()
///     .events_capacity(256)
///     .max_outbound(1024 * 1024)
///     .build()?;
/// ```
#[derive(Default)]
pub struct ReactorBuilder {
    config: Config,
}

impl ReactorBuilder {
    /// Creates a builder holding the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial capacity of the native event buffer (grows on demand).
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity.max(1);
        self
    }

    /// Size of the per-receive scratch chunk used when draining sockets.
    pub fn read_chunk(mut self, bytes: usize) -> Self {
        self.config.read_chunk = bytes.max(1);
        self
    }

    /// Per-transport cap on buffered outbound bytes; writes beyond it fail.
    pub fn max_outbound(mut self, bytes: usize) -> Self {
        self.config.max_outbound = bytes;
        self
    }

    /// Listen backlog used by [`Reactor::listen`].
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// Upper bound on the blocking wait of a single cycle.
    pub fn watchdog(mut self, cap: Duration) -> Self {
        self.config.watchdog = cap;
        self
    }

    /// Builds the reactor, creating the platform selector backend.
    pub fn build(self) -> Result<Reactor> {
        Reactor::with_config(self.config)
    }
}
