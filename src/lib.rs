//! Single-threaded, callback-driven I/O reactor.
//!
//! An event loop multiplexes readiness notifications for many sockets
//! through the platform polling mechanism (kqueue on macOS/BSD, epoll on
//! Linux) and delivers them to application-supplied [`Protocol`] handlers
//! without blocking per-connection.
//!
//! # Architecture
//!
//! - **Reactor**: registry of watchers plus double-buffered pending queues;
//!   drives poll/invoke cycles
//! - **ConnectionWatcher**: a listening socket plus a protocol factory
//! - **Transport**: per-connection handle with a partial-write continuation
//!   state machine
//! - **Protocol**: the three application callbacks — connected, received,
//!   disconnected
//! - **Selector backends**: interest-set reification and bounded blocking
//!   poll, one implementation per platform
//!
//! # Example
//!
//! ```ignore
//! use evloop::{Protocol, Reactor, Transport};
//!
//! #[derive(Default)]
//! struct Echo {
//!     transport: Option<Transport>,
//! }
//!
//! impl Protocol for Echo {
//!     fn connected(&mut self, transport: Transport) {
//!         self.transport = Some(transport);
//!     }
//!
//!     fn received(&mut self, data: &[u8]) {
//!         if let Some(transport) = &self.transport {
//!             let _ = transport.write(data);
//!         }
//!     }
//! }
//!
//! fn main() -> evloop::Result<()> {
//!     let mut reactor = Reactor::new()?;
//!     let addr = reactor.listen::<Echo>("127.0.0.1:8080".parse().unwrap())?;
//!     println!("echoing on {addr}");
//!     reactor.start()
//! }
//! ```

mod builder;
mod error;
mod reactor;

pub use builder::ReactorBuilder;
pub use error::{Error, Result};
pub use reactor::core::Reactor;
pub use reactor::handle::StopHandle;
pub use reactor::interest::EventMask;
pub use reactor::protocol::Protocol;
pub use reactor::socket::Socket;
pub use reactor::transport::Transport;
pub use reactor::watcher::ConnectionWatcher;
