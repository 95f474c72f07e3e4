//! Selector backends: interest-set reification and blocking poll.
//!
//! One polling strategy is chosen at compile time per platform:
//! - [`kqueue`]: macOS and the BSDs
//! - [`epoll`]: Linux
//!
//! Both satisfy the same [`Selector`] contract; the loop composes the
//! concrete type directly, so the per-event hot path is a plain match with
//! no dynamic dispatch.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::reactor::interest::EventMask;

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
pub(crate) mod kqueue;

#[cfg(target_os = "linux")]
pub(crate) mod epoll;

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd"))]
pub(crate) use kqueue::Kqueue as SysSelector;

#[cfg(target_os = "linux")]
pub(crate) use epoll::Epoll as SysSelector;

/// One native readiness report, translated out of backend representation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawEvent {
    pub(crate) fd: RawFd,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    /// Peer hangup reported by the kernel. Buffered bytes may still be
    /// readable; the read path drains before the kill lands.
    pub(crate) eof: bool,
    /// Hard error condition, including failed staged registrations.
    pub(crate) error: bool,
}

impl RawEvent {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            readable: false,
            writable: false,
            eof: false,
            error: false,
        }
    }
}

/// The contract every polling backend satisfies.
pub(crate) trait Selector {
    /// Applies an interest-set delta for `fd`.
    ///
    /// Additive and modifying deltas may be staged and applied as part of
    /// the next [`Selector::wait`] call; failures are surfaced, never
    /// dropped (either here or as an error event on the owning watcher).
    fn reify(&mut self, fd: RawFd, old: EventMask, new: EventMask) -> io::Result<()>;

    /// Removes every registration for `fd`, purging staged changes.
    ///
    /// Applied eagerly: cancellation is synchronous. A handle the kernel no
    /// longer knows (already closed) is not an error.
    fn deregister(&mut self, fd: RawFd, old: EventMask) -> io::Result<()>;

    /// Applies staged changes, blocks up to `timeout` for readiness, and
    /// appends translated events to `events`.
    ///
    /// A signal-interrupted wait is not an error: the call returns with no
    /// events and the loop re-enters its cycle. Any other failure is fatal
    /// to the loop.
    fn wait(&mut self, events: &mut Vec<RawEvent>, timeout: Duration) -> io::Result<()>;
}

/// Computes the blocking timeout for one cycle: the time until the next
/// timer deadline, capped by the watchdog so the loop periodically
/// reconsiders scheduling chores even when no native event arrives.
pub(crate) fn block_time(next_timer: Option<Duration>, watchdog: Duration) -> Duration {
    match next_timer {
        Some(remaining) => remaining.min(watchdog),
        None => watchdog,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WATCHDOG: Duration = Duration::from_secs(1);

    #[test]
    fn block_time_defaults_to_the_watchdog_cap() {
        assert_eq!(block_time(None, WATCHDOG), WATCHDOG);
    }

    #[test]
    fn block_time_is_capped_for_distant_timers() {
        assert_eq!(block_time(Some(Duration::from_secs(60)), WATCHDOG), WATCHDOG);
    }

    #[test]
    fn block_time_tracks_near_timers() {
        let near = Duration::from_millis(10);
        assert_eq!(block_time(Some(near), WATCHDOG), near);
    }

    #[test]
    fn block_time_never_goes_negative() {
        // An expired deadline arrives as a zero remainder.
        assert_eq!(block_time(Some(Duration::ZERO), WATCHDOG), Duration::ZERO);
    }
}
