//! Per-connection transport and the partial-write continuation machine.
//!
//! A transport rides on one socket handle and tracks outbound progress
//! through three states: `Connected` (no undelivered outbound bytes),
//! `WritePending` (buffered bytes waiting for a writable event), and the
//! terminal `Disconnected`. Inability to flush is represented as a state
//! transition, never as blocking: the loop does not wait for any single
//! socket to become writable.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use log::trace;

use crate::reactor::handle::{Command, ReactorHandle};
use crate::reactor::interest::EventMask;
use crate::reactor::socket::Socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Connected,
    WritePending,
    Disconnected,
}

/// Outcome of a flush attempt.
pub(crate) enum Feed {
    /// The outbound buffer is empty; write interest has been dropped.
    Flushed,
    /// Bytes remain and write interest is registered; the next writable
    /// event continues the flush.
    Scheduled,
    /// A disconnect-class error occurred; the caller transitions the
    /// connection to `Disconnected`.
    Failed(io::Error),
}

pub(crate) struct TransportInner {
    pub(crate) socket: Socket,
    out: Vec<u8>,
    pub(crate) write_ready: bool,
    pub(crate) mask: EventMask,
    phase: Phase,
    closing: bool,
    max_outbound: usize,
    handle: ReactorHandle,
}

impl TransportInner {
    pub(crate) fn new(
        socket: Socket,
        mask: EventMask,
        max_outbound: usize,
        handle: ReactorHandle,
    ) -> Self {
        Self {
            socket,
            out: Vec::new(),
            write_ready: false,
            mask,
            phase: Phase::Connected,
            closing: false,
            max_outbound,
            handle,
        }
    }

    /// Attempts to flush buffered outbound bytes.
    ///
    /// Drives the `Connected → WritePending → Connected` transitions; a hard
    /// send error is returned as [`Feed::Failed`] and the caller schedules
    /// the kill.
    pub(crate) fn feed(&mut self) -> Feed {
        if self.phase == Phase::Disconnected {
            return Feed::Flushed;
        }

        loop {
            if self.out.is_empty() {
                if self.phase == Phase::WritePending {
                    self.phase = Phase::Connected;
                }
                self.drop_write_interest();
                if self.closing {
                    // Graceful close: all queued bytes are out, now tear down.
                    self.closing = false;
                    self.handle.push(Command::Kill {
                        fd: self.socket.handle(),
                        error: None,
                    });
                }
                return Feed::Flushed;
            }

            if !self.write_ready {
                self.phase = Phase::WritePending;
                self.request_write_interest();
                return Feed::Scheduled;
            }

            match self.socket.send(&self.out) {
                Ok(0) => {
                    self.write_ready = false;
                }
                Ok(n) => {
                    trace!("fd {} flushed {} of {} bytes", self.socket.handle(), n, self.out.len());
                    self.out.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.write_ready = false;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Feed::Failed(err),
            }
        }
    }

    pub(crate) fn queue(&mut self, data: &[u8]) -> io::Result<()> {
        if self.out.len().saturating_add(data.len()) > self.max_outbound {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "outbound buffer limit exceeded",
            ));
        }
        self.out.extend_from_slice(data);
        Ok(())
    }

    /// Terminal teardown: invalidates the transport and releases the socket.
    /// Idempotent; the watcher's disposal path may hit it twice.
    pub(crate) fn invalidate(&mut self) {
        self.phase = Phase::Disconnected;
        self.write_ready = false;
        self.closing = false;
        self.out.clear();
        self.socket.close();
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn has_backlog(&self) -> bool {
        !self.out.is_empty()
    }

    fn request_write_interest(&mut self) {
        if self.mask.wants_write() {
            return;
        }
        let old = self.mask;
        self.mask |= EventMask::WRITE;
        self.handle.push(Command::Reify {
            fd: self.socket.handle(),
            old,
            new: self.mask,
        });
    }

    fn drop_write_interest(&mut self) {
        if !self.mask.wants_write() {
            return;
        }
        let old = self.mask;
        self.mask -= EventMask::WRITE;
        self.handle.push(Command::Reify {
            fd: self.socket.handle(),
            old,
            new: self.mask,
        });
    }
}

/// Cheaply cloneable handle to one connection's transport.
///
/// Handed to [`Protocol::connected`]; protocols clone and keep it to write
/// from later callbacks or timers. All operations are non-blocking.
///
/// [`Protocol::connected`]: crate::Protocol::connected
#[derive(Clone)]
pub struct Transport {
    inner: Rc<RefCell<TransportInner>>,
}

impl Transport {
    pub(crate) fn new(inner: TransportInner) -> Self {
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    pub(crate) fn inner(&self) -> &Rc<RefCell<TransportInner>> {
        &self.inner
    }

    /// Queues `data` for delivery, sending immediately when the socket is
    /// writable.
    ///
    /// Bytes the kernel does not accept are buffered and flushed as writable
    /// events arrive. Exceeding the configured outbound cap fails with
    /// [`io::ErrorKind::WriteZero`]; writing to a closed or closing
    /// connection fails with [`io::ErrorKind::NotConnected`]. A hard send
    /// error fails the call, and the underlying error is delivered once
    /// through `disconnected`.
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.borrow_mut();
        if inner.phase == Phase::Disconnected || inner.closing {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport is closed",
            ));
        }

        inner.queue(data)?;
        match inner.feed() {
            Feed::Flushed | Feed::Scheduled => Ok(()),
            Feed::Failed(err) => {
                let fd = inner.socket.handle();
                inner.handle.push(Command::Kill {
                    fd,
                    error: Some(err),
                });
                Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "connection failed during write",
                ))
            }
        }
    }

    /// Closes the connection once all queued outbound bytes have flushed.
    ///
    /// `disconnected(None)` is delivered exactly once on a later cycle.
    /// Writes issued after `close` fail with `NotConnected`.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.phase == Phase::Disconnected || inner.closing {
            return;
        }
        inner.closing = true;
        if !inner.has_backlog() {
            inner.closing = false;
            let fd = inner.socket.handle();
            inner.handle.push(Command::Kill { fd, error: None });
        }
    }

    /// The native descriptor this connection rides on.
    pub fn handle(&self) -> RawFd {
        self.inner.borrow().socket.handle()
    }

    /// Whether the connection is still live (not closed or closing).
    pub fn is_open(&self) -> bool {
        let inner = self.inner.borrow();
        inner.phase != Phase::Disconnected && !inner.closing
    }

    /// Whether a partial write is waiting on a writable event.
    pub fn is_write_pending(&self) -> bool {
        self.inner.borrow().phase == Phase::WritePending
    }

    /// Number of outbound bytes buffered but not yet accepted by the kernel.
    pub fn queued_bytes(&self) -> usize {
        self.inner.borrow().out.len()
    }

    /// The peer's address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.borrow().socket.peer_addr()
    }

    /// The local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.borrow().socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_pair() -> (Socket, Socket) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0, "socketpair() failed");
        (
            Socket::from_raw(fds[0]).unwrap(),
            Socket::from_raw(fds[1]).unwrap(),
        )
    }

    fn transport(socket: Socket, handle: ReactorHandle) -> Transport {
        Transport::new(TransportInner::new(
            socket,
            EventMask::READ,
            8 * 1024 * 1024,
            handle,
        ))
    }

    #[test]
    fn write_while_not_writable_buffers_and_requests_interest() {
        let (a, _b) = socket_pair();
        let handle = ReactorHandle::new();
        let t = transport(a, handle.clone());

        t.write(b"hello").unwrap();

        assert!(t.is_write_pending());
        assert_eq!(t.queued_bytes(), 5);
        match handle.pop() {
            Some(Command::Reify { old, new, .. }) => {
                assert!(!old.wants_write());
                assert!(new.wants_write());
            }
            _ => panic!("expected a reify command"),
        }
    }

    #[test]
    fn writable_event_flushes_and_drops_interest() {
        let (a, b) = socket_pair();
        let handle = ReactorHandle::new();
        let t = transport(a, handle.clone());

        t.write(b"ping").unwrap();
        assert!(t.is_write_pending());
        let _ = handle.pop();

        {
            let mut inner = t.inner().borrow_mut();
            inner.write_ready = true;
            assert!(matches!(inner.feed(), Feed::Flushed));
        }

        assert!(!t.is_write_pending());
        assert_eq!(t.queued_bytes(), 0);
        match handle.pop() {
            Some(Command::Reify { new, .. }) => assert!(!new.wants_write()),
            _ => panic!("expected a reify command dropping write interest"),
        }

        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn close_with_empty_backlog_requests_kill() {
        let (a, _b) = socket_pair();
        let handle = ReactorHandle::new();
        let t = transport(a, handle.clone());

        t.close();

        match handle.pop() {
            Some(Command::Kill { error, .. }) => assert!(error.is_none()),
            _ => panic!("expected a kill command"),
        }
        assert!(t.write(b"x").is_err());
    }

    #[test]
    fn close_with_backlog_defers_kill_until_flushed() {
        let (a, _b) = socket_pair();
        let handle = ReactorHandle::new();
        let t = transport(a, handle.clone());

        t.write(b"tail").unwrap();
        let _ = handle.pop();
        t.close();
        assert!(handle.pop().is_none());

        {
            let mut inner = t.inner().borrow_mut();
            inner.write_ready = true;
            assert!(matches!(inner.feed(), Feed::Flushed));
        }

        let mut saw_kill = false;
        while let Some(command) = handle.pop() {
            if matches!(command, Command::Kill { .. }) {
                saw_kill = true;
            }
        }
        assert!(saw_kill);
    }

    #[test]
    fn outbound_cap_is_enforced() {
        let (a, _b) = socket_pair();
        let handle = ReactorHandle::new();
        let t = Transport::new(TransportInner::new(a, EventMask::READ, 8, handle));

        assert!(t.write(b"12345678").is_ok());
        let err = t.write(b"9").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn invalidate_is_idempotent() {
        let (a, _b) = socket_pair();
        let handle = ReactorHandle::new();
        let t = transport(a, handle);

        t.inner().borrow_mut().invalidate();
        t.inner().borrow_mut().invalidate();

        assert!(!t.is_open());
        assert_eq!(t.queued_bytes(), 0);
    }
}
