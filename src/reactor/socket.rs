//! Non-blocking TCP socket wrapper.
//!
//! Thin layer over the libc socket calls the reactor consumes: listen,
//! accept, connect, send, receive. Every socket is switched to non-blocking
//! mode on creation; operations that would block surface
//! [`io::ErrorKind::WouldBlock`] instead of suspending the thread.

use libc::{
    AF_INET, AF_INET6, EINPROGRESS, F_GETFL, F_SETFL, O_NONBLOCK, SO_ERROR, SO_REUSEADDR,
    SOCK_STREAM, SOL_SOCKET, accept, bind, c_int, c_void, close, connect, fcntl, getpeername,
    getsockname, getsockopt, in6_addr, in_addr, listen, recv, send, setsockopt, sockaddr,
    sockaddr_in, sockaddr_in6, sockaddr_storage, socket, socklen_t,
};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

/// Sentinel for a socket whose descriptor has already been released.
const CLOSED: RawFd = -1;

/// A non-blocking TCP socket owning its file descriptor.
///
/// The descriptor is closed on drop; [`Socket::close`] may be called earlier
/// and is idempotent.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Wraps an existing descriptor and switches it to non-blocking mode.
    ///
    /// The socket takes ownership: the descriptor is closed when the socket
    /// is dropped.
    pub fn from_raw(fd: RawFd) -> io::Result<Self> {
        let sock = Self { fd };
        sock.set_nonblocking()?;
        Ok(sock)
    }

    /// Creates a listening socket bound to `addr`.
    ///
    /// Sets `SO_REUSEADDR`, binds, and listens with the given backlog. Bind
    /// to port 0 and read back [`Self::local_addr`] to let the OS pick a
    /// port.
    pub fn listen(addr: SocketAddr, backlog: i32) -> io::Result<Self> {
        let sock = Self::open(addr)?;

        let one: c_int = 1;
        let ret = unsafe {
            setsockopt(
                sock.fd,
                SOL_SOCKET,
                SO_REUSEADDR,
                &one as *const _ as *const c_void,
                mem::size_of::<c_int>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let (storage, len) = sockaddr_from(addr);
        let ret = unsafe { bind(sock.fd, &storage as *const _ as *const sockaddr, len) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let ret = unsafe { listen(sock.fd, backlog) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(sock)
    }

    /// Starts a non-blocking connect to `addr`.
    ///
    /// Returns as soon as the attempt is in flight; `EINPROGRESS` is not an
    /// error. Whether the connection was actually established is reported by
    /// the first write-readiness event together with [`Self::take_error`].
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let sock = Self::open(addr)?;

        let (storage, len) = sockaddr_from(addr);
        let ret = unsafe { connect(sock.fd, &storage as *const _ as *const sockaddr, len) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(EINPROGRESS) {
                return Err(err);
            }
        }

        Ok(sock)
    }

    fn open(addr: SocketAddr) -> io::Result<Self> {
        let family = match addr {
            SocketAddr::V4(_) => AF_INET,
            SocketAddr::V6(_) => AF_INET6,
        };

        let fd = unsafe { socket(family, SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Self::from_raw(fd)
    }

    /// Accepts one pending connection, already switched to non-blocking.
    ///
    /// Returns `Ok(None)` when no connection is queued.
    pub fn accept(&self) -> io::Result<Option<(Socket, SocketAddr)>> {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

        let fd = unsafe { accept(self.fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            };
        }

        let sock = Socket::from_raw(fd)?;
        let peer = socketaddr_from(&storage);
        Ok(Some((sock, peer)))
    }

    /// Receives into `buf`. `Ok(0)` means the peer performed an orderly
    /// shutdown; `WouldBlock` means nothing is queued right now.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { recv(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Sends as much of `buf` as the kernel accepts, returning the count.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { send(self.fd, buf.as_ptr() as *const c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Reads and clears the pending socket error (`SO_ERROR`).
    ///
    /// Used to resolve the outcome of a non-blocking connect once the socket
    /// reports writable.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: c_int = 0;
        let mut len = mem::size_of::<c_int>() as socklen_t;
        let ret = unsafe {
            getsockopt(
                self.fd,
                SOL_SOCKET,
                SO_ERROR,
                &mut err as *mut _ as *mut c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }

    /// Returns the locally bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
        let ret =
            unsafe { getsockname(self.fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(socketaddr_from(&storage))
    }

    /// Returns the peer's address.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
        let ret =
            unsafe { getpeername(self.fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(socketaddr_from(&storage))
    }

    /// The native descriptor this socket rides on.
    pub fn handle(&self) -> RawFd {
        self.fd
    }

    /// Whether the descriptor has been released.
    pub fn is_closed(&self) -> bool {
        self.fd == CLOSED
    }

    /// Releases the descriptor. Safe to call more than once.
    pub fn close(&mut self) {
        if self.fd != CLOSED {
            unsafe {
                close(self.fd);
            }
            self.fd = CLOSED;
        }
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        let flags = unsafe { fcntl(self.fd, F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let ret = unsafe { fcntl(self.fd, F_SETFL, flags | O_NONBLOCK) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

fn sockaddr_from(addr: SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut _ as *mut sockaddr_in;
            unsafe {
                (*sin).sin_family = AF_INET as _;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                };
            }
            (storage, mem::size_of::<sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut _ as *mut sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = AF_INET6 as _;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_addr = in6_addr {
                    s6_addr: v6.ip().octets(),
                };
            }
            (storage, mem::size_of::<sockaddr_in6>() as socklen_t)
        }
    }
}

fn socketaddr_from(storage: &sockaddr_storage) -> SocketAddr {
    match storage.ss_family as c_int {
        AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const sockaddr_in6) };
            SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            ))
        }
        _ => {
            let sin = unsafe { &*(storage as *const _ as *const sockaddr_in) };
            SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            ))
        }
    }
}
