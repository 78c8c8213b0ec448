//! POSIX constants exposed to script code.
//!
//! Values match the host's C headers.

pub const O_RDONLY: i32 = libc::O_RDONLY;
pub const O_WRONLY: i32 = libc::O_WRONLY;
pub const O_RDWR: i32 = libc::O_RDWR;
pub const O_APPEND: i32 = libc::O_APPEND;
pub const O_CREAT: i32 = libc::O_CREAT;
pub const O_EXCL: i32 = libc::O_EXCL;
pub const O_TRUNC: i32 = libc::O_TRUNC;
/// Text mode only exists on Windows; zero elsewhere.
pub const O_TEXT: i32 = 0;

pub const SEEK_SET: i32 = libc::SEEK_SET;
pub const SEEK_CUR: i32 = libc::SEEK_CUR;
pub const SEEK_END: i32 = libc::SEEK_END;

pub const S_IFMT: u32 = libc::S_IFMT as u32;
pub const S_IFIFO: u32 = libc::S_IFIFO as u32;
pub const S_IFCHR: u32 = libc::S_IFCHR as u32;
pub const S_IFDIR: u32 = libc::S_IFDIR as u32;
pub const S_IFBLK: u32 = libc::S_IFBLK as u32;
pub const S_IFREG: u32 = libc::S_IFREG as u32;
pub const S_IFSOCK: u32 = libc::S_IFSOCK as u32;
pub const S_IFLNK: u32 = libc::S_IFLNK as u32;
pub const S_ISGID: u32 = libc::S_ISGID as u32;
pub const S_ISUID: u32 = libc::S_ISUID as u32;

pub const SIGINT: i32 = libc::SIGINT;
pub const SIGABRT: i32 = libc::SIGABRT;
pub const SIGFPE: i32 = libc::SIGFPE;
pub const SIGILL: i32 = libc::SIGILL;
pub const SIGSEGV: i32 = libc::SIGSEGV;
pub const SIGTERM: i32 = libc::SIGTERM;
pub const SIGQUIT: i32 = libc::SIGQUIT;
pub const SIGPIPE: i32 = libc::SIGPIPE;
pub const SIGALRM: i32 = libc::SIGALRM;
pub const SIGUSR1: i32 = libc::SIGUSR1;
pub const SIGUSR2: i32 = libc::SIGUSR2;
pub const SIGCHLD: i32 = libc::SIGCHLD;
pub const SIGCONT: i32 = libc::SIGCONT;
pub const SIGSTOP: i32 = libc::SIGSTOP;
pub const SIGTSTP: i32 = libc::SIGTSTP;
pub const SIGTTIN: i32 = libc::SIGTTIN;
pub const SIGTTOU: i32 = libc::SIGTTOU;

/// `waitpid` option: return immediately if no child has exited.
pub const WNOHANG: i32 = libc::WNOHANG;
