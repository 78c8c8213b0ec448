//! Terminal helpers

use std::os::unix::io::RawFd;

use super::errno::{check, SysResult};

/// Whether `fd` is a terminal.
pub fn isatty(fd: RawFd) -> bool {
    unsafe { libc::isatty(fd) == 1 }
}

/// Terminal size as `(width, height)`, or `None` if `fd` is not a terminal.
pub fn tty_get_win_size(fd: RawFd) -> Option<(u16, u16)> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
    if ret == 0 && ws.ws_col >= 4 && ws.ws_row >= 4 {
        Some((ws.ws_col, ws.ws_row))
    } else {
        None
    }
}

/// Restores the terminal mode saved by [`tty_set_raw`] when dropped.
pub struct RawModeGuard {
    fd: RawFd,
    saved: libc::termios,
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &self.saved) };
    }
}

/// Put the terminal in raw mode: no echo, no line editing, 8-bit chars,
/// output post-processing kept.
pub fn tty_set_raw(fd: RawFd) -> SysResult<RawModeGuard> {
    let mut tty: libc::termios = unsafe { std::mem::zeroed() };
    check(unsafe { libc::tcgetattr(fd, &mut tty) })?;
    let saved = tty;

    tty.c_iflag &= !(libc::IGNBRK
        | libc::BRKINT
        | libc::PARMRK
        | libc::ISTRIP
        | libc::INLCR
        | libc::IGNCR
        | libc::ICRNL
        | libc::IXON);
    tty.c_oflag |= libc::OPOST;
    tty.c_lflag &= !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::IEXTEN);
    tty.c_cflag &= !(libc::CSIZE | libc::PARENB);
    tty.c_cflag |= libc::CS8;
    tty.c_cc[libc::VMIN] = 1;
    tty.c_cc[libc::VTIME] = 0;

    check(unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tty) })?;
    Ok(RawModeGuard { fd, saved })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_is_not_a_tty() {
        let (r, w) = crate::os::pipe().unwrap();
        assert!(!isatty(r));
        assert!(tty_get_win_size(r).is_none());
        assert!(tty_set_raw(r).is_err());
        crate::os::close(r).unwrap();
        crate::os::close(w).unwrap();
    }
}
