//! Deferred command channel between transports and the owning loop.
//!
//! Callbacks run while the loop is mid-cycle, so they cannot touch the
//! registry or the selector directly. Instead every transport carries a
//! clone of this handle and pushes commands; the loop drains them at the top
//! of the next cycle. Single-threaded, so a shared queue suffices where a
//! channel would be needed across threads.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::reactor::interest::EventMask;

pub(crate) enum Command {
    /// Apply an interest-set delta for `fd` on the selector.
    Reify {
        fd: RawFd,
        old: EventMask,
        new: EventMask,
    },
    /// Tear down the watcher bound to `fd` and deliver its disconnect.
    Kill {
        fd: RawFd,
        error: Option<io::Error>,
    },
    /// End the loop after the current cycle.
    Stop,
}

/// Shared command queue; cloned into every transport the loop creates.
#[derive(Clone, Default)]
pub(crate) struct ReactorHandle {
    commands: Rc<RefCell<VecDeque<Command>>>,
}

impl ReactorHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, command: Command) {
        self.commands.borrow_mut().push_back(command);
    }

    pub(crate) fn pop(&self) -> Option<Command> {
        self.commands.borrow_mut().pop_front()
    }

    /// Number of commands queued right now. Drains snapshot this so that
    /// commands pushed while processing run in the next cycle.
    pub(crate) fn len(&self) -> usize {
        self.commands.borrow().len()
    }
}

/// Requests loop shutdown from inside a callback.
///
/// Obtained from [`Reactor::stop_handle`]; cheap to clone. The loop finishes
/// the cycle in progress and then returns from `start`.
///
/// [`Reactor::stop_handle`]: crate::Reactor::stop_handle
#[derive(Clone)]
pub struct StopHandle {
    inner: ReactorHandle,
}

impl StopHandle {
    pub(crate) fn new(inner: ReactorHandle) -> Self {
        Self { inner }
    }

    /// Asks the loop to stop after the current cycle.
    pub fn stop(&self) {
        self.inner.push(Command::Stop);
    }
}
