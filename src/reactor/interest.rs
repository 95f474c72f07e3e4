//! Interest-set flags for event registration.

use bitflags::bitflags;

bitflags! {
    /// The set of event kinds a watcher asks the backend to report for its
    /// socket handle.
    ///
    /// `ACCEPT` is read-readiness on a listening socket; backends register
    /// it with the same native read filter as `READ`, the distinction only
    /// matters for dispatch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u8 {
        /// Interest in read events on an established connection.
        const READ = 0b001;

        /// Interest in write events.
        const WRITE = 0b010;

        /// Interest in incoming connections on a listening socket.
        const ACCEPT = 0b100;
    }
}

impl Default for EventMask {
    fn default() -> Self {
        Self::empty()
    }
}

impl EventMask {
    /// Whether this mask requires a native read-filter registration.
    pub fn wants_read(self) -> bool {
        self.intersects(Self::READ | Self::ACCEPT)
    }

    /// Whether this mask requires a native write-filter registration.
    pub fn wants_write(self) -> bool {
        self.contains(Self::WRITE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_counts_as_read_interest() {
        assert!(EventMask::ACCEPT.wants_read());
        assert!(!EventMask::ACCEPT.wants_write());
    }

    #[test]
    fn mask_deltas() {
        let mask = EventMask::READ;
        let with_write = mask | EventMask::WRITE;

        assert!(with_write.wants_read());
        assert!(with_write.wants_write());
        assert_eq!(with_write - EventMask::WRITE, EventMask::READ);
        assert!(EventMask::empty().is_empty());
    }
}
