//! Readiness primitive
//!
//! A thin layer over `poll(2)`. The poll set is rebuilt by the caller on
//! every iteration from whatever currently holds a handler, so there is no
//! kernel-side registration to keep in sync with the registry.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Position of a descriptor in the current poll set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

/// Interest / readiness flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(pub u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b0_0001);
    pub const WRITABLE: Interest = Interest(0b0_0010);
    pub const ERROR: Interest = Interest(0b0_0100);
    pub const HUP: Interest = Interest(0b0_1000);
    /// The descriptor is not open (`POLLNVAL`).
    pub const INVALID: Interest = Interest(0b1_0000);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub fn is_hup(&self) -> bool {
        self.0 & Self::HUP.0 != 0
    }

    pub fn is_invalid(&self) -> bool {
        self.0 & Self::INVALID.0 != 0
    }

    /// Whether a read handler should run: data, hang-up or error.
    pub fn wants_read_dispatch(&self) -> bool {
        self.is_readable() || self.is_hup() || self.is_error()
    }

    /// Whether a write handler should run: writable or error.
    pub fn wants_write_dispatch(&self) -> bool {
        self.is_writable() || self.is_error()
    }
}

impl std::ops::BitOr for Interest {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Interest(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for Interest {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Interest(self.0 & rhs.0)
    }
}

impl std::ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A readiness event from one poll
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub readiness: Interest,
}

/// Outcome of one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Some descriptors are ready (possibly zero on timeout)
    Ready(usize),
    /// The wait was cut short by a signal
    Interrupted,
}

/// poll(2) based event loop
pub struct EventLoop {
    fds: Vec<libc::pollfd>,
}

impl EventLoop {
    /// Create an empty poll set
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    /// Create an empty poll set sized for `capacity` descriptors
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fds: Vec::with_capacity(capacity),
        }
    }

    /// Drop every entry; called at the start of each iteration
    pub fn clear(&mut self) {
        self.fds.clear();
    }

    /// Add a descriptor to the poll set
    pub fn register(&mut self, fd: RawFd, interest: Interest) -> Token {
        let mut events = 0;
        if interest.is_readable() {
            events |= libc::POLLIN;
        }
        if interest.is_writable() {
            events |= libc::POLLOUT;
        }
        self.fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        Token(self.fds.len() - 1)
    }

    /// Number of descriptors in the poll set
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Block until a descriptor is ready or `timeout` elapses.
    ///
    /// `None` blocks indefinitely. Events are appended in poll-set order,
    /// which is registration order.
    pub fn poll(
        &mut self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<WaitOutcome> {
        let timeout_ms = timeout.map(duration_to_poll_ms).unwrap_or(-1);

        let count = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(WaitOutcome::Interrupted);
            }
            return Err(err);
        }

        for (i, pfd) in self.fds.iter().enumerate() {
            if pfd.revents != 0 {
                events.push(Event {
                    token: Token(i),
                    readiness: revents_to_interest(pfd.revents),
                });
            }
        }

        Ok(WaitOutcome::Ready(count as usize))
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Round up to whole milliseconds so a sub-millisecond timer deadline does
/// not turn into a busy zero-timeout poll.
fn duration_to_poll_ms(d: Duration) -> libc::c_int {
    let ms = d.as_nanos().div_ceil(1_000_000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

fn revents_to_interest(revents: libc::c_short) -> Interest {
    let mut interest = Interest::NONE;
    if revents & libc::POLLIN != 0 {
        interest |= Interest::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        interest |= Interest::WRITABLE;
    }
    if revents & libc::POLLERR != 0 {
        interest |= Interest::ERROR;
    }
    if revents & libc::POLLHUP != 0 {
        interest |= Interest::HUP;
    }
    if revents & libc::POLLNVAL != 0 {
        interest |= Interest::INVALID;
    }
    interest
}
