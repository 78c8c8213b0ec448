//! Path-level file system operations
//!
//! Results that the script surface models as `[value, err]` pairs are plain
//! [`SysResult`]s here.

use std::ffi::{CStr, OsString};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use super::errno::{check, Errno, SysResult};
use super::fd::path_to_cstring;

/// Default mode for [`mkdir`] (before umask).
pub const DEFAULT_DIR_MODE: u32 = 0o777;

/// File status. Times are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blocks: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl Stat {
    fn from_raw(st: &libc::stat) -> Self {
        Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev as u64,
            size: st.st_size as i64,
            blocks: st.st_blocks as i64,
            atime: to_millis(st.st_atime as i64, st.st_atime_nsec as i64),
            mtime: to_millis(st.st_mtime as i64, st.st_mtime_nsec as i64),
            ctime: to_millis(st.st_ctime as i64, st.st_ctime_nsec as i64),
        }
    }

    /// File type bits (`mode & S_IFMT`).
    pub fn file_type(&self) -> u32 {
        self.mode & super::consts::S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == super::consts::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == super::consts::S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == super::consts::S_IFLNK
    }
}

fn to_millis(secs: i64, nsecs: i64) -> i64 {
    secs * 1000 + nsecs / 1_000_000
}

/// Status of `path`, following symlinks.
pub fn stat<P: AsRef<Path>>(path: P) -> SysResult<Stat> {
    let path = path_to_cstring(path.as_ref())?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    check(unsafe { libc::stat(path.as_ptr(), &mut st) })?;
    Ok(Stat::from_raw(&st))
}

/// Status of `path` itself when it is a symlink.
pub fn lstat<P: AsRef<Path>>(path: P) -> SysResult<Stat> {
    let path = path_to_cstring(path.as_ref())?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    check(unsafe { libc::lstat(path.as_ptr(), &mut st) })?;
    Ok(Stat::from_raw(&st))
}

/// Remove a file or an empty directory.
pub fn remove<P: AsRef<Path>>(path: P) -> SysResult<()> {
    let path = path_to_cstring(path.as_ref())?;
    check(unsafe { libc::remove(path.as_ptr()) }).map(|_| ())
}

pub fn rename<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> SysResult<()> {
    let from = path_to_cstring(from.as_ref())?;
    let to = path_to_cstring(to.as_ref())?;
    check(unsafe { libc::rename(from.as_ptr(), to.as_ptr()) }).map(|_| ())
}

/// Canonicalized absolute path name.
pub fn realpath<P: AsRef<Path>>(path: P) -> SysResult<PathBuf> {
    std::fs::canonicalize(path).map_err(Errno::from)
}

pub fn getcwd() -> SysResult<PathBuf> {
    std::env::current_dir().map_err(Errno::from)
}

/// Change the process working directory (shared by every context).
pub fn chdir<P: AsRef<Path>>(path: P) -> SysResult<()> {
    let path = path_to_cstring(path.as_ref())?;
    check(unsafe { libc::chdir(path.as_ptr()) }).map(|_| ())
}

pub fn mkdir<P: AsRef<Path>>(path: P, mode: u32) -> SysResult<()> {
    let path = path_to_cstring(path.as_ref())?;
    check(unsafe { libc::mkdir(path.as_ptr(), mode as libc::mode_t) }).map(|_| ())
}

/// Set access and modification times, given in milliseconds since the epoch.
pub fn utimes<P: AsRef<Path>>(path: P, atime_ms: i64, mtime_ms: i64) -> SysResult<()> {
    let path = path_to_cstring(path.as_ref())?;
    let times = [to_timeval(atime_ms), to_timeval(mtime_ms)];
    check(unsafe { libc::utimes(path.as_ptr(), times.as_ptr()) }).map(|_| ())
}

fn to_timeval(ms: i64) -> libc::timeval {
    libc::timeval {
        tv_sec: ms.div_euclid(1000) as libc::time_t,
        tv_usec: (ms.rem_euclid(1000) * 1000) as libc::suseconds_t,
    }
}

/// Create a symlink at `linkpath` pointing to `target`.
pub fn symlink<P: AsRef<Path>, Q: AsRef<Path>>(target: P, linkpath: Q) -> SysResult<()> {
    let target = path_to_cstring(target.as_ref())?;
    let linkpath = path_to_cstring(linkpath.as_ref())?;
    check(unsafe { libc::symlink(target.as_ptr(), linkpath.as_ptr()) }).map(|_| ())
}

pub fn readlink<P: AsRef<Path>>(path: P) -> SysResult<PathBuf> {
    let path = path_to_cstring(path.as_ref())?;
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let len = unsafe {
        libc::readlink(
            path.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len() - 1,
        )
    };
    if len < 0 {
        return Err(Errno::last());
    }
    buf.truncate(len as usize);
    Ok(PathBuf::from(OsString::from_vec(buf)))
}

/// Names of the entries in `path`, including `.` and `..`.
pub fn readdir<P: AsRef<Path>>(path: P) -> SysResult<Vec<String>> {
    let path = path_to_cstring(path.as_ref())?;
    let dir = unsafe { libc::opendir(path.as_ptr()) };
    if dir.is_null() {
        return Err(Errno::last());
    }

    let mut names = Vec::new();
    loop {
        let entry = unsafe { libc::readdir(dir) };
        if entry.is_null() {
            break;
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        names.push(name.to_string_lossy().into_owned());
    }

    unsafe { libc::closedir(dir) };
    Ok(names)
}
