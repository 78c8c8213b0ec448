//! Descriptor-level operations
//!
//! Thin wrappers over the libc calls that create, use and destroy raw
//! descriptors. Nothing here touches a loop's registry; closing a descriptor
//! that carries handlers should go through `Runtime::close`.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::Duration;

use super::errno::{check, check_size, Errno, SysResult};

/// Default creation mode for [`open`] (before umask).
pub const DEFAULT_OPEN_MODE: u32 = 0o666;

pub(crate) fn path_to_cstring(path: &Path) -> SysResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

/// Open a file. `flags` is a combination of the `O_*` constants.
pub fn open<P: AsRef<Path>>(path: P, flags: i32, mode: u32) -> SysResult<RawFd> {
    let path = path_to_cstring(path.as_ref())?;
    let fd = unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) };
    check(fd)
}

/// Close a descriptor.
pub fn close(fd: RawFd) -> SysResult<()> {
    check(unsafe { libc::close(fd) }).map(|_| ())
}

/// Offset types accepted by [`seek`].
///
/// The 32-bit form mirrors plain script numbers; the 64-bit form mirrors
/// big integers and is returned unchanged.
pub trait FileOffset: Copy {
    fn to_off(self) -> i64;
    fn from_off(off: i64) -> Option<Self>;
}

impl FileOffset for i32 {
    fn to_off(self) -> i64 {
        self as i64
    }

    fn from_off(off: i64) -> Option<Self> {
        i32::try_from(off).ok()
    }
}

impl FileOffset for i64 {
    fn to_off(self) -> i64 {
        self
    }

    fn from_off(off: i64) -> Option<Self> {
        Some(off)
    }
}

/// Reposition the file offset. `whence` is one of the `SEEK_*` constants.
///
/// Returns the new offset in the same width as the argument; a 32-bit
/// offset whose result does not fit fails with `EOVERFLOW`.
pub fn seek<O: FileOffset>(fd: RawFd, offset: O, whence: i32) -> SysResult<O> {
    let pos = unsafe { libc::lseek(fd, offset.to_off() as libc::off_t, whence) };
    if pos < 0 {
        return Err(Errno::last());
    }
    O::from_off(pos as i64).ok_or(Errno::EOVERFLOW)
}

/// Read into `buf`; returns the number of bytes read (0 at end of file).
pub fn read(fd: RawFd, buf: &mut [u8]) -> SysResult<usize> {
    check_size(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
}

/// Write from `buf`; returns the number of bytes written.
pub fn write(fd: RawFd, buf: &[u8]) -> SysResult<usize> {
    check_size(unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) })
}

pub fn dup(fd: RawFd) -> SysResult<RawFd> {
    check(unsafe { libc::dup(fd) })
}

pub fn dup2(old_fd: RawFd, new_fd: RawFd) -> SysResult<RawFd> {
    check(unsafe { libc::dup2(old_fd, new_fd) })
}

/// Create a pipe, returning `(read_fd, write_fd)`.
pub fn pipe() -> SysResult<(RawFd, RawFd)> {
    let mut fds = [0 as libc::c_int; 2];
    check(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    Ok((fds[0], fds[1]))
}

/// Whether `fd` refers to an open descriptor.
pub fn is_open(fd: RawFd) -> bool {
    fd >= 0 && unsafe { libc::fcntl(fd, libc::F_GETFD) } >= 0
}

pub(crate) fn set_nonblocking(fd: RawFd) -> SysResult<()> {
    let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map(|_| ())
}

pub(crate) fn set_cloexec(fd: RawFd) -> SysResult<()> {
    let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    check(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) }).map(|_| ())
}

/// Suspend the calling thread for `delay_ms` milliseconds.
///
/// An interrupting signal ends the sleep early with `EINTR`.
pub fn sleep(delay_ms: u64) -> SysResult<()> {
    let d = Duration::from_millis(delay_ms);
    let ts = libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    };
    check(unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) }).map(|_| ())
}

/// Send signal `signo` to process `pid`.
pub fn kill(pid: i32, signo: i32) -> SysResult<()> {
    check(unsafe { libc::kill(pid, signo) }).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_read_write() {
        let (r, w) = pipe().unwrap();
        assert_eq!(write(w, b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(read(r, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        close(r).unwrap();
        close(w).unwrap();
    }

    #[test]
    fn test_close_invalid_is_ebadf() {
        assert_eq!(close(-1), Err(Errno::EBADF));
        assert!(!is_open(-1));
    }

    #[test]
    fn test_dup_keeps_pipe_alive() {
        let (r, w) = pipe().unwrap();
        let w2 = dup(w).unwrap();
        close(w).unwrap();
        write(w2, b"x").unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(read(r, &mut buf).unwrap(), 1);
        close(r).unwrap();
        close(w2).unwrap();
    }

    #[test]
    fn test_seek_on_pipe_fails() {
        let (r, w) = pipe().unwrap();
        let err = seek(r, 0i64, libc::SEEK_SET).unwrap_err();
        assert_eq!(err.0, libc::ESPIPE);
        close(r).unwrap();
        close(w).unwrap();
    }
}
