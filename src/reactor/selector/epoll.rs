//! epoll backend (Linux).
//!
//! Interest deltas are applied eagerly through `epoll_ctl` — the add,
//! modify, or delete operation falls out of the old/new mask transition.
//! Registrations are edge-triggered (`EPOLLET`); the read path drains the
//! socket fully on each event and the write path flushes until would-block.

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLET, EPOLLHUP,
    EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use log::trace;

use crate::reactor::interest::EventMask;
use crate::reactor::selector::{RawEvent, Selector};

pub(crate) struct Epoll {
    epoll: RawFd,
    events: Vec<epoll_event>,
}

impl Epoll {
    pub(crate) fn new(events_capacity: usize) -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let events = vec![unsafe { mem::zeroed::<epoll_event>() }; events_capacity.max(1)];

        Ok(Self { epoll, events })
    }

    fn native_mask(mask: EventMask) -> u32 {
        let mut bits = EPOLLET as u32;
        if mask.wants_read() {
            bits |= EPOLLIN as u32 | EPOLLRDHUP as u32;
        }
        if mask.wants_write() {
            bits |= EPOLLOUT as u32;
        }
        bits
    }
}

impl Selector for Epoll {
    fn reify(&mut self, fd: RawFd, old: EventMask, new: EventMask) -> io::Result<()> {
        trace!("epoll reify fd {} {:?} -> {:?}", fd, old, new);

        let op = match (!old.is_empty(), !new.is_empty()) {
            (false, false) => return Ok(()),
            (false, true) => EPOLL_CTL_ADD,
            (true, true) => EPOLL_CTL_MOD,
            (true, false) => EPOLL_CTL_DEL,
        };

        let mut event = epoll_event {
            events: Self::native_mask(new),
            u64: fd as u64,
        };

        let ret = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd, old: EventMask) -> io::Result<()> {
        if old.is_empty() {
            return Ok(());
        }

        // ENOENT/EBADF just mean the kernel already forgot the handle
        // (closing an fd removes it from the interest list).
        let ret = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::EBADF) => {}
                _ => return Err(err),
            }
        }
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<RawEvent>, timeout: Duration) -> io::Result<()> {
        // Round up so a sub-millisecond deadline still blocks rather than
        // spinning at timeout zero.
        let mut millis = timeout.as_millis();
        if timeout.subsec_nanos() % 1_000_000 != 0 {
            millis += 1;
        }
        let millis = millis.min(i32::MAX as u128) as i32;

        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                millis,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        let n = n as usize;
        for native in &self.events[..n] {
            let bits = native.events;
            let mut event = RawEvent::new(native.u64 as RawFd);
            if bits & EPOLLIN as u32 != 0 {
                event.readable = true;
            }
            if bits & EPOLLOUT as u32 != 0 {
                event.writable = true;
            }
            if bits & (EPOLLHUP as u32 | EPOLLRDHUP as u32) != 0 {
                event.eof = true;
            }
            if bits & EPOLLERR as u32 != 0 {
                event.error = true;
            }
            events.push(event);
        }

        // A full buffer suggests more readiness than we could carry.
        if n == self.events.len() {
            let grown = self.events.len() * 2;
            self.events.resize(grown, unsafe { mem::zeroed() });
        }

        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll);
        }
    }
}
