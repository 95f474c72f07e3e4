//! The reactor: registry, deferred-invocation queues, and the cycle driver.
//!
//! Each cycle: drain deferred commands, block on the selector up to the
//! computed bound, translate readiness into scheduled watchers, then swap
//! the pending queues and invoke the batch. Detection and delivery are kept
//! apart so callbacks can mutate the watcher set mid-cycle: anything a
//! callback schedules lands in the other queue and runs the next cycle.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::cell::RefCell;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::builder::Config;
use crate::error::{Error, Result};
use crate::reactor::handle::{Command, ReactorHandle, StopHandle};
use crate::reactor::interest::EventMask;
use crate::reactor::protocol::Protocol;
use crate::reactor::selector::{RawEvent, Selector, SysSelector, block_time};
use crate::reactor::socket::Socket;
use crate::reactor::transport::{Feed, Transport, TransportInner};
use crate::reactor::watcher::{ConnectionWatcher, IoWatcher, Watcher, WatcherRef};

struct Timer {
    deadline: Instant,
    callback: Box<dyn FnOnce()>,
}

/// A single-threaded event loop multiplexing readiness for many sockets.
///
/// One thread owns a reactor end to end; the blocking wait inside
/// [`Reactor::turn`] is the sole suspension point. All protocol callbacks
/// run synchronously on that thread.
///
/// # Example
///
/// ```ignore
/// let mut reactor = Reactor::new()?;
/// let addr = reactor.listen::<Echo>("127.0.0.1:0".parse()?)?;
/// reactor.start()?;
/// ```
pub struct Reactor {
    selector: SysSelector,
    registry: HashMap<RawFd, WatcherRef>,
    /// Filled while handling readiness and deferred commands.
    pending: Vec<WatcherRef>,
    /// The other buffer; swapped in at the fixed point before delivery.
    deferred: Vec<WatcherRef>,
    events: Vec<RawEvent>,
    read_scratch: Vec<u8>,
    timers: Vec<Timer>,
    handle: ReactorHandle,
    /// Handles killed during the current cycle; readiness reported for them
    /// later in the same batch is stale, not an inconsistency.
    reaped: Vec<RawFd>,
    running: bool,
    config: Config,
}

impl Reactor {
    /// Creates a reactor with default configuration.
    ///
    /// Fails with [`Error::BackendInit`] when the platform selector cannot
    /// be created; a loop without a working backend cannot run.
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    pub(crate) fn with_config(config: Config) -> Result<Self> {
        let selector = SysSelector::new(config.events_capacity).map_err(Error::BackendInit)?;

        Ok(Self {
            selector,
            registry: HashMap::new(),
            pending: Vec::new(),
            deferred: Vec::new(),
            events: Vec::new(),
            read_scratch: vec![0u8; config.read_chunk],
            timers: Vec::new(),
            handle: ReactorHandle::new(),
            reaped: Vec::new(),
            running: false,
            config,
        })
    }

    /// Registers a listening watcher.
    ///
    /// Fails with [`Error::MissingFactory`] when no protocol factory has
    /// been installed — the precondition is enforced here so the accept
    /// path can rely on it.
    pub fn register(&mut self, mut watcher: ConnectionWatcher) -> Result<()> {
        if !watcher.has_factory() {
            return Err(Error::MissingFactory);
        }

        let fd = watcher.socket().handle();
        self.selector
            .reify(fd, EventMask::empty(), EventMask::ACCEPT)
            .map_err(Error::Socket)?;
        watcher.active = true;

        debug!("fd {} registered for accept", fd);
        self.insert(fd, Rc::new(RefCell::new(Watcher::Listener(watcher))));
        Ok(())
    }

    /// Binds a listener on `addr` serving default-constructed `P` protocols
    /// and registers it, returning the bound address.
    pub fn listen<P>(&mut self, addr: SocketAddr) -> Result<SocketAddr>
    where
        P: Protocol + Default + 'static,
    {
        let socket = Socket::listen(addr, self.config.backlog).map_err(Error::Socket)?;
        let bound = socket.local_addr().map_err(Error::Socket)?;
        let mut watcher = ConnectionWatcher::new(socket);
        watcher.set_protocol::<P>();
        self.register(watcher)?;
        Ok(bound)
    }

    /// Adopts an already-established connection.
    ///
    /// The watcher is registered for read interest and `connected` is
    /// delivered on the next cycle.
    pub fn attach(&mut self, socket: Socket, protocol: Box<dyn Protocol>) -> Result<Transport> {
        let fd = socket.handle();
        self.selector
            .reify(fd, EventMask::empty(), EventMask::READ)
            .map_err(Error::Socket)?;

        let transport = Transport::new(TransportInner::new(
            socket,
            EventMask::READ,
            self.config.max_outbound,
            self.handle.clone(),
        ));
        let mut watcher = IoWatcher::new(transport.clone(), protocol);
        watcher.greet = true;

        debug!("fd {} attached", fd);
        let rc = Rc::new(RefCell::new(Watcher::Io(watcher)));
        self.insert(fd, rc.clone());
        self.schedule(&rc);
        Ok(transport)
    }

    /// Starts a non-blocking connect to `addr`.
    ///
    /// `connected` is delivered once the socket reports writable with no
    /// pending error; a failed establishment delivers
    /// `disconnected(Some(error))` with no prior `connected`.
    pub fn connect(&mut self, addr: SocketAddr, protocol: Box<dyn Protocol>) -> Result<Transport> {
        let socket = Socket::connect(addr).map_err(Error::Socket)?;
        let fd = socket.handle();
        let mask = EventMask::READ | EventMask::WRITE;
        self.selector
            .reify(fd, EventMask::empty(), mask)
            .map_err(Error::Socket)?;

        let transport = Transport::new(TransportInner::new(
            socket,
            mask,
            self.config.max_outbound,
            self.handle.clone(),
        ));
        let mut watcher = IoWatcher::new(transport.clone(), protocol);
        watcher.greet = true;
        watcher.establishing = true;

        debug!("fd {} connecting to {}", fd, addr);
        self.insert(fd, Rc::new(RefCell::new(Watcher::Io(watcher))));
        Ok(transport)
    }

    /// Schedules `callback` to run once `delay` has elapsed, after the
    /// delivery pass of the cycle in which it expires.
    pub fn add_timer<F>(&mut self, delay: Duration, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.timers.push(Timer {
            deadline: Instant::now() + delay,
            callback: Box::new(callback),
        });
    }

    /// A cloneable handle for requesting shutdown from inside callbacks.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.handle.clone())
    }

    /// Runs cycles until [`Reactor::stop`] or a stop handle fires.
    pub fn start(&mut self) -> Result<()> {
        self.running = true;
        debug!("reactor started");
        while self.running {
            self.turn(None)?;
        }
        debug!("reactor stopped");
        Ok(())
    }

    /// Ends the loop before the next cycle.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Number of live watchers in the registry.
    pub fn watcher_count(&self) -> usize {
        self.registry.len()
    }

    /// Runs one cycle: command drain, bounded wait, dispatch, delivery,
    /// timers. Returns the number of watchers invoked.
    ///
    /// `max_wait` further bounds the blocking time below the watchdog cap;
    /// tests step the loop with small values.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> Result<usize> {
        self.reaped.clear();
        self.drain_commands();

        let mut timeout = block_time(self.next_timer_remaining(), self.config.watchdog);
        if let Some(limit) = max_wait {
            timeout = timeout.min(limit);
        }

        self.events.clear();
        self.selector
            .wait(&mut self.events, timeout)
            .map_err(Error::Poll)?;
        trace!("poll returned {} events", self.events.len());

        let events = mem::take(&mut self.events);
        for event in &events {
            self.dispatch(*event);
        }
        self.events = events;

        // Fixed point between poll-phase and invoke-phase: swap the queue
        // roles. Watchers scheduled from here on belong to the next cycle.
        debug_assert!(self.deferred.is_empty());
        mem::swap(&mut self.pending, &mut self.deferred);

        let invoked = self.deferred.len();
        for watcher in &self.deferred {
            watcher.borrow_mut().set_queued(false);
            watcher.borrow_mut().invoke();
        }
        self.deferred.clear();

        self.fire_timers();
        Ok(invoked)
    }

    fn insert(&mut self, fd: RawFd, watcher: WatcherRef) {
        let previous = self.registry.insert(fd, watcher);
        assert!(
            previous.is_none(),
            "handle {} already bound to a live watcher",
            fd
        );
    }

    /// Appends a watcher to the pending queue, once per cycle.
    fn schedule(&mut self, watcher: &WatcherRef) {
        {
            let mut inner = watcher.borrow_mut();
            if inner.is_queued() {
                return;
            }
            inner.set_queued(true);
            trace!("fd {} scheduled for delivery", inner.fd());
        }
        self.pending.push(watcher.clone());
    }

    fn drain_commands(&mut self) {
        // Snapshot the count: commands pushed while processing run next
        // cycle.
        let count = self.handle.len();
        for _ in 0..count {
            let Some(command) = self.handle.pop() else {
                break;
            };
            match command {
                Command::Reify { fd, old, new } => {
                    if !self.registry.contains_key(&fd) {
                        continue;
                    }
                    if let Err(err) = self.selector.reify(fd, old, new) {
                        warn!("interest update failed for fd {}: {}", fd, err);
                        self.kill(fd, Some(err));
                    }
                }
                Command::Kill { fd, error } => self.kill(fd, error),
                Command::Stop => self.running = false,
            }
        }
    }

    fn dispatch(&mut self, event: RawEvent) {
        let Some(watcher) = self.registry.get(&event.fd).cloned() else {
            if self.reaped.contains(&event.fd) {
                // The handle died earlier in this batch.
                return;
            }
            panic!(
                "readiness event for unregistered handle {}: registry inconsistency",
                event.fd
            );
        };

        let is_listener = matches!(&*watcher.borrow(), Watcher::Listener(_));
        if is_listener {
            if event.error {
                warn!("error event on listening fd {}", event.fd);
                self.kill(event.fd, None);
            } else {
                self.accept_connections(&watcher);
            }
            return;
        }

        self.handle_io_event(&watcher, event);
    }

    /// Accepts until would-block, registering one new watcher per
    /// connection and scheduling the listener once for delivery this cycle.
    fn accept_connections(&mut self, listener: &WatcherRef) {
        loop {
            let accepted = {
                let inner = listener.borrow();
                let Watcher::Listener(watcher) = &*inner else {
                    return;
                };
                watcher.socket().accept()
            };

            match accepted {
                Ok(Some((socket, peer))) => {
                    let fd = socket.handle();
                    if let Err(err) =
                        self.selector.reify(fd, EventMask::empty(), EventMask::READ)
                    {
                        warn!("registration failed for connection from {}: {}", peer, err);
                        continue;
                    }

                    let protocol = {
                        let mut inner = listener.borrow_mut();
                        let Watcher::Listener(watcher) = &mut *inner else {
                            return;
                        };
                        watcher.make_protocol()
                    };
                    let transport = Transport::new(TransportInner::new(
                        socket,
                        EventMask::READ,
                        self.config.max_outbound,
                        self.handle.clone(),
                    ));
                    let accepted = Rc::new(RefCell::new(Watcher::Io(IoWatcher::new(
                        transport, protocol,
                    ))));

                    debug!("fd {} accepted from {}", fd, peer);
                    self.insert(fd, accepted.clone());
                    {
                        let mut inner = listener.borrow_mut();
                        if let Watcher::Listener(watcher) = &mut *inner {
                            watcher.push_incoming(accepted);
                        }
                    }
                    self.schedule(listener);
                }
                Ok(None) => return,
                Err(err) => {
                    // EMFILE and friends: nothing to tear down, try again on
                    // the next readiness report.
                    warn!("accept failed: {}", err);
                    return;
                }
            }
        }
    }

    fn handle_io_event(&mut self, watcher: &WatcherRef, event: RawEvent) {
        let fd = event.fd;
        let mut kill: Option<Option<io::Error>> = None;
        let mut deliver = false;

        {
            let mut inner = watcher.borrow_mut();
            let Watcher::Io(io) = &mut *inner else {
                return;
            };
            let Some(transport) = io.transport() else {
                return;
            };

            // Resolve an in-flight connect: any readiness settles it.
            if io.establishing {
                if event.error || event.eof {
                    let cause = transport
                        .inner()
                        .borrow()
                        .socket
                        .take_error()
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| io::ErrorKind::ConnectionRefused.into());
                    kill = Some(Some(cause));
                } else {
                    let outcome = transport.inner().borrow().socket.take_error();
                    match outcome {
                        Ok(None) => {
                            io.establishing = false;
                            transport.inner().borrow_mut().write_ready = true;
                            deliver = true;
                            debug!("fd {} established", fd);
                        }
                        Ok(Some(err)) | Err(err) => kill = Some(Some(err)),
                    }
                }
            }

            // Hard error on an established connection.
            if kill.is_none() && !io.establishing && event.error {
                let cause = transport.inner().borrow().socket.take_error().ok().flatten();
                kill = Some(cause);
            }

            // Read path: drain fully, the registration is edge-triggered.
            if kill.is_none() && !io.establishing && event.readable {
                loop {
                    let received = transport.inner().borrow().socket.recv(&mut self.read_scratch);
                    match received {
                        Ok(0) => {
                            kill = Some(None);
                            break;
                        }
                        Ok(n) => io.output.extend_from_slice(&self.read_scratch[..n]),
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            kill = Some(Some(err));
                            break;
                        }
                    }
                }
                if !io.output.is_empty() {
                    // Captured bytes are delivered this cycle even when the
                    // peer vanished mid-read.
                    deliver = true;
                }
            }

            // Peer hangup without data to drain.
            if kill.is_none() && !io.establishing && event.eof {
                kill = Some(None);
            }

            // Write path: mark writable and continue any pending flush.
            if kill.is_none() && !io.establishing && event.writable {
                let mut state = transport.inner().borrow_mut();
                state.write_ready = true;
                if let Feed::Failed(err) = state.feed() {
                    kill = Some(Some(err));
                }
            }
        }

        match kill {
            Some(error) => self.kill(fd, error),
            None => {
                if deliver {
                    self.schedule(watcher);
                }
            }
        }
    }

    /// Tears down the watcher bound to `fd` and schedules exactly one
    /// disconnect delivery. A handle that is no longer registered makes
    /// this a no-op, so interleaved error paths cannot double-kill.
    fn kill(&mut self, fd: RawFd, error: Option<io::Error>) {
        let Some(watcher) = self.registry.remove(&fd) else {
            return;
        };

        debug!("fd {} killed (error: {})", fd, error.is_some());
        let schedule = {
            let mut inner = watcher.borrow_mut();
            match &mut *inner {
                Watcher::Io(io) => {
                    let mask = io
                        .transport()
                        .map(|t| t.inner().borrow().mask)
                        .unwrap_or_default();
                    let _ = self.selector.deregister(fd, mask);
                    io.shut(error);
                    true
                }
                Watcher::Listener(listener) => {
                    listener.active = false;
                    let _ = self.selector.deregister(fd, EventMask::ACCEPT);
                    false
                }
            }
        };

        self.reaped.push(fd);
        if schedule {
            self.schedule(&watcher);
        }
    }

    fn next_timer_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers
            .iter()
            .map(|timer| timer.deadline.saturating_duration_since(now))
            .min()
    }

    fn fire_timers(&mut self) {
        if self.timers.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        let mut index = 0;
        while index < self.timers.len() {
            if self.timers[index].deadline <= now {
                due.push(self.timers.swap_remove(index));
            } else {
                index += 1;
            }
        }

        due.sort_by_key(|timer| timer.deadline);
        for timer in due {
            (timer.callback)();
        }
    }
}
