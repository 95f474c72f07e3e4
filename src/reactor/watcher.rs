//! Watchers: the registered units of interest.
//!
//! A watcher binds one socket handle to either a listening socket plus a
//! protocol factory ([`ConnectionWatcher`]) or an established connection
//! plus a live protocol instance ([`IoWatcher`]). The loop holds watchers
//! behind `Rc<RefCell<..>>` so the registry and the pending queues can point
//! at the same instance; the tagged enum keeps dispatch a plain match.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use log::trace;

use crate::reactor::protocol::{Protocol, ProtocolFactory};
use crate::reactor::socket::Socket;
use crate::reactor::transport::Transport;

pub(crate) type WatcherRef = Rc<RefCell<Watcher>>;

pub(crate) enum Watcher {
    Listener(ConnectionWatcher),
    Io(IoWatcher),
}

impl Watcher {
    pub(crate) fn fd(&self) -> RawFd {
        match self {
            Watcher::Listener(listener) => listener.socket.handle(),
            Watcher::Io(io) => io.fd,
        }
    }

    pub(crate) fn is_queued(&self) -> bool {
        match self {
            Watcher::Listener(listener) => listener.queued,
            Watcher::Io(io) => io.queued,
        }
    }

    pub(crate) fn set_queued(&mut self, queued: bool) {
        match self {
            Watcher::Listener(listener) => listener.queued = queued,
            Watcher::Io(io) => io.queued = queued,
        }
    }

    /// Delivers this watcher's buffered effects to the application.
    pub(crate) fn invoke(&mut self) {
        match self {
            Watcher::Listener(listener) => listener.invoke(),
            Watcher::Io(io) => io.invoke(),
        }
    }
}

/// A watcher bound to a listening socket.
///
/// Install a protocol factory, then hand the watcher to
/// [`Reactor::register`]; each accepted connection gets a fresh protocol
/// instance from the factory.
///
/// [`Reactor::register`]: crate::Reactor::register
pub struct ConnectionWatcher {
    socket: Socket,
    factory: Option<ProtocolFactory>,
    incoming: VecDeque<WatcherRef>,
    pub(crate) active: bool,
    queued: bool,
}

impl ConnectionWatcher {
    /// Wraps an already-listening socket.
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            factory: None,
            incoming: VecDeque::new(),
            active: false,
            queued: false,
        }
    }

    /// Binds a listening socket on `addr` (backlog 128) and wraps it.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(Socket::listen(addr, 128)?))
    }

    /// Installs a factory producing a default-constructed `P` per accepted
    /// connection.
    pub fn set_protocol<P>(&mut self)
    where
        P: Protocol + Default + 'static,
    {
        self.factory = Some(Box::new(|| Box::new(P::default())));
    }

    /// Installs an explicit factory closure, for protocols that capture
    /// shared state.
    pub fn set_protocol_factory<F>(&mut self, mut factory: F)
    where
        F: FnMut() -> Box<dyn Protocol> + 'static,
    {
        self.factory = Some(Box::new(move || factory()));
    }

    /// The address the underlying socket is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub(crate) fn has_factory(&self) -> bool {
        self.factory.is_some()
    }

    pub(crate) fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Produces a fresh protocol instance. Registration refuses listeners
    /// with no factory, so one is always present here.
    pub(crate) fn make_protocol(&mut self) -> Box<dyn Protocol> {
        let factory = self
            .factory
            .as_mut()
            .expect("listener registered without a protocol factory");
        factory()
    }

    pub(crate) fn push_incoming(&mut self, watcher: WatcherRef) {
        self.incoming.push_back(watcher);
    }

    /// Drains the accepted-connection queue, delivering one `connected` per
    /// connection in FIFO order.
    fn invoke(&mut self) {
        while let Some(accepted) = self.incoming.pop_front() {
            if let Watcher::Io(io) = &mut *accepted.borrow_mut() {
                io.deliver_connected();
            }
        }
    }
}

/// Either the live transport or the captured disconnect cause — never both.
pub(crate) enum Link {
    Live(Transport),
    Closed(Option<io::Error>),
}

/// A watcher bound to one established connection.
pub(crate) struct IoWatcher {
    fd: RawFd,
    link: Link,
    protocol: Option<Box<dyn Protocol>>,
    pub(crate) output: Vec<u8>,
    pub(crate) active: bool,
    queued: bool,
    /// A `connected` delivery is owed on the next invoke (outbound and
    /// adopted connections; accepted ones are greeted by their listener).
    pub(crate) greet: bool,
    /// Non-blocking connect still in flight; resolved by the first writable
    /// event.
    pub(crate) establishing: bool,
}

impl IoWatcher {
    pub(crate) fn new(transport: Transport, protocol: Box<dyn Protocol>) -> Self {
        Self {
            fd: transport.handle(),
            link: Link::Live(transport),
            protocol: Some(protocol),
            output: Vec::new(),
            active: true,
            queued: false,
            greet: false,
            establishing: false,
        }
    }

    pub(crate) fn transport(&self) -> Option<Transport> {
        match &self.link {
            Link::Live(transport) => Some(transport.clone()),
            Link::Closed(_) => None,
        }
    }

    /// Severs the live link: invalidates the transport (closing the socket)
    /// and stores the disconnect cause. The first cause wins; later calls
    /// are no-ops so interleaved read/write errors cannot double-report.
    pub(crate) fn shut(&mut self, error: Option<io::Error>) {
        match &self.link {
            Link::Live(transport) => {
                transport.inner().borrow_mut().invalidate();
            }
            Link::Closed(_) => return,
        }
        self.link = Link::Closed(error);
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.link, Link::Closed(_))
    }

    pub(crate) fn deliver_connected(&mut self) {
        if let (Some(protocol), Link::Live(transport)) = (self.protocol.as_mut(), &self.link) {
            protocol.connected(transport.clone());
        }
    }

    /// Delivers buffered effects in order: owed greeting, received bytes,
    /// terminal disconnect.
    ///
    /// Data and disconnect may both be pending when a connection reads bytes
    /// and dies within one cycle; with one pending-queue entry per watcher
    /// per cycle, both are delivered here, data first. The disconnect branch
    /// fires at most once per connection.
    fn invoke(&mut self) {
        if self.greet {
            self.greet = false;
            self.deliver_connected();
        }

        if !self.output.is_empty() {
            if let Some(protocol) = self.protocol.as_mut() {
                protocol.received(&self.output);
            }
            self.output.clear();
        }

        if self.active && self.is_closed() {
            self.active = false;
            let error = match &mut self.link {
                Link::Closed(error) => error.take(),
                Link::Live(_) => None,
            };
            trace!("fd {} delivering disconnect", self.fd);
            if let Some(protocol) = self.protocol.as_mut() {
                protocol.disconnected(error);
            }
            self.dispose();
        }
    }

    /// Releases the read buffer and the owned protocol instance. The
    /// `protocol` sentinel makes a second disposal a no-op.
    pub(crate) fn dispose(&mut self) {
        if self.protocol.is_none() {
            return;
        }
        self.protocol = None;
        self.output = Vec::new();
        if let Link::Live(transport) = &self.link {
            transport.inner().borrow_mut().invalidate();
        }
        self.active = false;
    }
}
