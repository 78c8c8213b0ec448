//! Errno-style results
//!
//! Every call that models an OS system call returns a [`SysResult`]. The
//! error side carries the positive errno; [`Errno::code`] gives the negative
//! integer form that script code branches on.

use std::fmt;
use std::io;

/// An OS error number (always positive).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

/// Result type for OS-level operations.
pub type SysResult<T> = Result<T, Errno>;

impl Errno {
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const EACCES: Errno = Errno(libc::EACCES);
    pub const EINTR: Errno = Errno(libc::EINTR);
    pub const EAGAIN: Errno = Errno(libc::EAGAIN);
    pub const ECHILD: Errno = Errno(libc::ECHILD);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EOVERFLOW: Errno = Errno(libc::EOVERFLOW);

    /// Read the calling thread's current errno.
    pub fn last() -> Self {
        Errno(
            io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO),
        )
    }

    /// Negative integer form (`-errno`).
    pub fn code(self) -> i32 {
        -self.0
    }

    /// Build from a negative (or positive) errno code.
    pub fn from_code(code: i32) -> Self {
        Errno(code.abs())
    }

    pub fn is_would_block(self) -> bool {
        self.0 == libc::EAGAIN || self.0 == libc::EWOULDBLOCK
    }

    pub fn is_interrupted(self) -> bool {
        self.0 == libc::EINTR
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, io::Error::from_raw_os_error(self.0))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", io::Error::from_raw_os_error(self.0), self.0)
    }
}

impl std::error::Error for Errno {}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<Errno> for io::Error {
    fn from(errno: Errno) -> Self {
        io::Error::from_raw_os_error(errno.0)
    }
}

impl From<nix::errno::Errno> for Errno {
    fn from(errno: nix::errno::Errno) -> Self {
        Errno(errno as i32)
    }
}

/// Flatten a [`SysResult`] into the raw integer convention:
/// the value on success, `-errno` on failure.
pub trait RawResult {
    fn into_raw(self) -> i64;
}

impl<T: Into<i64>> RawResult for SysResult<T> {
    fn into_raw(self) -> i64 {
        match self {
            Ok(v) => v.into(),
            Err(e) => e.code() as i64,
        }
    }
}

/// Map a libc return value to a [`SysResult`], reading errno on `-1`.
pub(crate) fn check(ret: libc::c_int) -> SysResult<libc::c_int> {
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

/// Same as [`check`] for `ssize_t` returning calls.
pub(crate) fn check_size(ret: libc::ssize_t) -> SysResult<usize> {
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret as usize)
    }
}
