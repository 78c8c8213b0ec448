//! Low-level OS access
//!
//! File, directory, terminal and descriptor operations, plus the POSIX
//! constants script code uses with them. Every fallible call returns a
//! [`SysResult`] whose error side is an [`Errno`]; callers branch on it
//! inline instead of treating failure as exceptional.

pub mod consts;
mod errno;
mod fd;
mod fs;
mod tty;

pub use consts::*;
pub use errno::{Errno, RawResult, SysResult};
pub use fd::{
    close, dup, dup2, is_open, kill, open, pipe, read, seek, sleep, write, FileOffset,
    DEFAULT_OPEN_MODE,
};
pub use fs::{
    chdir, getcwd, lstat, mkdir, readdir, readlink, realpath, remove, rename, stat, symlink,
    utimes, Stat, DEFAULT_DIR_MODE,
};
pub use tty::{isatty, tty_get_win_size, tty_set_raw, RawModeGuard};

pub(crate) use fd::{path_to_cstring, set_cloexec, set_nonblocking};

/// Host platform name: `"linux"`, `"darwin"`, `"win32"` or `"js"`.
///
/// Other Unix targets report `"linux"`; anything else reports `"js"`.
pub fn platform() -> &'static str {
    if cfg!(any(target_os = "macos", target_os = "ios")) {
        "darwin"
    } else if cfg!(windows) {
        "win32"
    } else if cfg!(unix) {
        "linux"
    } else {
        "js"
    }
}
