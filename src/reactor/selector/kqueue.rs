//! kqueue backend (macOS, FreeBSD, OpenBSD).
//!
//! Interest-set edits are staged into a changelist and submitted together
//! with the next `kevent` wait call, so updating kernel-side registrations
//! costs one syscall per cycle instead of one per change. Read
//! registrations use `EV_CLEAR`: readiness is edge-triggered and the read
//! path drains the socket fully on each event.

use libc::{
    EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_WRITE, kevent,
    kqueue, timespec,
};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use log::trace;

use crate::reactor::interest::EventMask;
use crate::reactor::selector::{RawEvent, Selector};

pub(crate) struct Kqueue {
    queue: RawFd,
    changes: Vec<kevent>,
    events: Vec<kevent>,
}

impl Kqueue {
    pub(crate) fn new(events_capacity: usize) -> io::Result<Self> {
        let queue = unsafe { kqueue() };
        if queue < 0 {
            return Err(io::Error::last_os_error());
        }

        let events = vec![unsafe { mem::zeroed::<kevent>() }; events_capacity.max(1)];

        Ok(Self {
            queue,
            changes: Vec::new(),
            events,
        })
    }

    fn stage(&mut self, fd: RawFd, filter: i16, flags: u16) {
        self.changes.push(kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        });
    }
}

impl Selector for Kqueue {
    fn reify(&mut self, fd: RawFd, old: EventMask, new: EventMask) -> io::Result<()> {
        trace!("kqueue reify fd {} {:?} -> {:?}", fd, old, new);

        if new.wants_read() && !old.wants_read() {
            self.stage(fd, EVFILT_READ, EV_ADD | EV_ENABLE | EV_CLEAR);
        } else if !new.wants_read() && old.wants_read() {
            self.stage(fd, EVFILT_READ, EV_DELETE);
        }

        if new.wants_write() && !old.wants_write() {
            self.stage(fd, EVFILT_WRITE, EV_ADD | EV_ENABLE | EV_CLEAR);
        } else if !new.wants_write() && old.wants_write() {
            self.stage(fd, EVFILT_WRITE, EV_DELETE);
        }

        Ok(())
    }

    fn deregister(&mut self, fd: RawFd, old: EventMask) -> io::Result<()> {
        // Drop staged edits for a handle that is going away.
        self.changes.retain(|change| change.ident != fd as usize);

        let mut deletes = [unsafe { mem::zeroed::<kevent>() }; 2];
        let mut count = 0;
        if old.wants_read() {
            deletes[count] = kevent {
                ident: fd as usize,
                filter: EVFILT_READ,
                flags: EV_DELETE,
                fflags: 0,
                data: 0,
                udata: ptr::null_mut(),
            };
            count += 1;
        }
        if old.wants_write() {
            deletes[count] = kevent {
                ident: fd as usize,
                filter: EVFILT_WRITE,
                flags: EV_DELETE,
                fflags: 0,
                data: 0,
                udata: ptr::null_mut(),
            };
            count += 1;
        }
        if count == 0 {
            return Ok(());
        }

        // ENOENT/EBADF just mean the kernel already forgot the handle
        // (closing an fd removes its kevents).
        let ret = unsafe {
            kevent(
                self.queue,
                deletes.as_ptr(),
                count as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
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
        let ts = timespec {
            tv_sec: timeout.as_secs() as _,
            tv_nsec: timeout.subsec_nanos() as _,
        };

        let n = unsafe {
            kevent(
                self.queue,
                self.changes.as_ptr(),
                self.changes.len() as i32,
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                &ts,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                // The changelist is processed before the wait blocks, so the
                // staged edits are already applied; only the wait was cut
                // short.
                self.changes.clear();
                return Ok(());
            }
            return Err(err);
        }

        // Changes are one-shot per cycle.
        self.changes.clear();

        let n = n as usize;
        for native in &self.events[..n] {
            let mut event = RawEvent::new(native.ident as RawFd);
            match native.filter {
                EVFILT_READ => event.readable = true,
                EVFILT_WRITE => event.writable = true,
                _ => {}
            }
            if native.flags & EV_EOF != 0 {
                event.eof = true;
            }
            if native.flags & EV_ERROR != 0 {
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

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.queue);
        }
    }
}
