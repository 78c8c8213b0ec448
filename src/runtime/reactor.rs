//! Descriptor registry
//!
//! The reactor tracks:
//! - Which descriptors have handlers and in which order they were registered
//! - At most one read handler and one write handler per descriptor
//!
//! Setting a handler replaces the previous one; clearing both drops the
//! descriptor from the registry entirely.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use super::event_loop::Interest;
use super::SharedHandler;

/// Direction a handler watches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Handlers registered for one descriptor
#[derive(Default)]
struct Entry {
    read: Option<SharedHandler>,
    write: Option<SharedHandler>,
}

impl Entry {
    fn slot(&mut self, direction: Direction) -> &mut Option<SharedHandler> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    fn interest(&self) -> Interest {
        let mut interest = Interest::NONE;
        if self.read.is_some() {
            interest |= Interest::READABLE;
        }
        if self.write.is_some() {
            interest |= Interest::WRITABLE;
        }
        interest
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

/// Per-context descriptor registry
pub struct Reactor {
    entries: HashMap<RawFd, Entry>,
    /// Descriptors in first-registration order
    order: Vec<RawFd>,
}

impl Reactor {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Install or clear the handler for one direction, returning the
    /// handler it replaced.
    pub fn set(
        &mut self,
        fd: RawFd,
        direction: Direction,
        handler: Option<SharedHandler>,
    ) -> Option<SharedHandler> {
        match handler {
            Some(handler) => {
                if !self.entries.contains_key(&fd) {
                    self.order.push(fd);
                }
                let entry = self.entries.entry(fd).or_default();
                entry.slot(direction).replace(handler)
            }
            None => {
                let entry = self.entries.get_mut(&fd)?;
                let previous = entry.slot(direction).take();
                if entry.is_empty() {
                    self.remove(fd);
                }
                previous
            }
        }
    }

    /// Current handler for one direction
    pub fn handler(&self, fd: RawFd, direction: Direction) -> Option<SharedHandler> {
        let entry = self.entries.get(&fd)?;
        match direction {
            Direction::Read => entry.read.clone(),
            Direction::Write => entry.write.clone(),
        }
    }

    /// Drop every handler for `fd`. Returns whether anything was registered.
    pub fn remove(&mut self, fd: RawFd) -> bool {
        if self.entries.remove(&fd).is_some() {
            self.order.retain(|&other| other != fd);
            true
        } else {
            false
        }
    }

    /// Descriptors with at least one handler, in registration order
    pub fn interests(&self) -> impl Iterator<Item = (RawFd, Interest)> + '_ {
        self.order
            .iter()
            .filter_map(|fd| self.entries.get(fd).map(|e| (*fd, e.interest())))
    }

    /// Interest currently registered for `fd`
    pub fn interest(&self, fd: RawFd) -> Interest {
        self.entries
            .get(&fd)
            .map(|e| e.interest())
            .unwrap_or(Interest::NONE)
    }

    /// Number of descriptors with handlers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{share, Handler, Runtime};
    use std::rc::Rc;

    fn noop() -> SharedHandler {
        let handler: Handler = Box::new(|_rt: &mut Runtime| Ok(()));
        share(handler)
    }

    #[test]
    fn test_reactor_set_clear() {
        let mut reactor = Reactor::new();

        assert!(reactor.set(5, Direction::Read, Some(noop())).is_none());
        assert_eq!(reactor.interest(5), Interest::READABLE);

        reactor.set(5, Direction::Write, Some(noop()));
        assert_eq!(reactor.interest(5), Interest::READABLE | Interest::WRITABLE);

        assert!(reactor.set(5, Direction::Read, None).is_some());
        assert_eq!(reactor.interest(5), Interest::WRITABLE);

        reactor.set(5, Direction::Write, None);
        assert!(reactor.is_empty());

        // Clearing again is a no-op
        assert!(reactor.set(5, Direction::Write, None).is_none());
    }

    #[test]
    fn test_reactor_replace_returns_previous() {
        let mut reactor = Reactor::new();
        let first = noop();
        reactor.set(3, Direction::Read, Some(first.clone()));
        let replaced = reactor.set(3, Direction::Read, Some(noop())).unwrap();
        assert!(Rc::ptr_eq(&replaced, &first));
        assert_eq!(reactor.len(), 1);
    }

    #[test]
    fn test_reactor_registration_order() {
        let mut reactor = Reactor::new();
        reactor.set(9, Direction::Read, Some(noop()));
        reactor.set(4, Direction::Write, Some(noop()));
        reactor.set(7, Direction::Read, Some(noop()));
        reactor.set(9, Direction::Write, Some(noop()));

        let fds: Vec<_> = reactor.interests().map(|(fd, _)| fd).collect();
        assert_eq!(fds, vec![9, 4, 7]);

        reactor.remove(4);
        let fds: Vec<_> = reactor.interests().map(|(fd, _)| fd).collect();
        assert_eq!(fds, vec![9, 7]);
    }
}
