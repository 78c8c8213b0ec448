//! Process manager
//!
//! Spawns children with `fork`/`execve` and reaps them with `waitpid`.
//! Everything the child needs (argv, envp, PATH candidates, working
//! directory) is prepared before forking; between `fork` and `execve` only
//! async-signal-safe calls are made.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use crate::os::{self, Errno, SysResult};

/// Exit code reported when the child could not be set up or executed
pub const EXEC_FAILURE_CODE: i32 = 127;

/// Options for [`ProcessManager::exec`]
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Wait for termination (default `true`)
    pub block: bool,
    /// Search `PATH` for the executable (default `true`)
    pub use_path: bool,
    /// Executable to run instead of `args[0]`
    pub file: Option<PathBuf>,
    /// Working directory of the child
    pub cwd: Option<PathBuf>,
    pub stdin: Option<RawFd>,
    pub stdout: Option<RawFd>,
    pub stderr: Option<RawFd>,
    /// Full environment of the child; inherits the parent's when `None`
    pub env: Option<BTreeMap<String, String>>,
    /// Group id assumed before `execve`
    pub gid: Option<u32>,
    /// User id assumed before `execve` (after the group id)
    pub uid: Option<u32>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            block: true,
            use_path: true,
            file: None,
            cwd: None,
            stdin: None,
            stdout: None,
            stderr: None,
            env: None,
            gid: None,
            uid: None,
        }
    }
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    pub fn use_path(mut self, use_path: bool) -> Self {
        self.use_path = use_path;
        self
    }

    pub fn file<P: Into<PathBuf>>(mut self, file: P) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn cwd<P: Into<PathBuf>>(mut self, cwd: P) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn stdin(mut self, fd: RawFd) -> Self {
        self.stdin = Some(fd);
        self
    }

    pub fn stdout(mut self, fd: RawFd) -> Self {
        self.stdout = Some(fd);
        self
    }

    pub fn stderr(mut self, fd: RawFd) -> Self {
        self.stderr = Some(fd);
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }
}

/// Result of a successful [`ProcessManager::exec`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Blocking mode: the exit code, or the negated signal number
    Exited(i32),
    /// Non-blocking mode: the child's pid
    Spawned(i32),
}

/// Raw `waitpid` status word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStatus(pub i32);

/// Decoded [`WaitStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Exited normally with this code
    Exited(i32),
    /// Terminated by this signal
    Signaled(i32),
    /// Stopped by this signal
    Stopped(i32),
    Continued,
}

impl WaitStatus {
    pub fn state(self) -> ChildState {
        let status = self.0;
        if libc::WIFEXITED(status) {
            ChildState::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            ChildState::Signaled(libc::WTERMSIG(status))
        } else if libc::WIFSTOPPED(status) {
            ChildState::Stopped(libc::WSTOPSIG(status))
        } else {
            ChildState::Continued
        }
    }

    /// Whether the child has terminated (exited or killed)
    pub fn is_terminated(self) -> bool {
        matches!(
            self.state(),
            ChildState::Exited(_) | ChildState::Signaled(_)
        )
    }

    /// The blocking-exec convention: exit code, or negated signal number
    pub fn exec_code(self) -> i32 {
        match self.state() {
            ChildState::Exited(code) => code,
            ChildState::Signaled(signo) => -signo,
            _ => 0,
        }
    }
}

/// Child bookkeeping for one context
pub struct ProcessManager {
    /// Tracked children and the status stored by a sweep, if any
    children: HashMap<i32, Option<WaitStatus>>,
    close_fds_limit: usize,
}

impl ProcessManager {
    pub fn new(close_fds_limit: usize) -> Self {
        Self {
            children: HashMap::new(),
            close_fds_limit,
        }
    }

    /// Spawn `args`. Blocks until exit unless `options.block` is false.
    pub fn exec<S: AsRef<OsStr>>(
        &mut self,
        args: &[S],
        options: &ExecOptions,
    ) -> SysResult<ExecOutcome> {
        let prepared = PreparedExec::new(args, options, self.close_fds_limit)?;

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(Errno::last());
        }
        if pid == 0 {
            unsafe { prepared.exec_child() }
        }

        tracing::debug!(pid, program = ?args[0].as_ref(), block = options.block, "spawned child");

        if options.block {
            let status = wait_blocking(pid)?;
            Ok(ExecOutcome::Exited(status.exec_code()))
        } else {
            self.children.insert(pid, None);
            Ok(ExecOutcome::Spawned(pid))
        }
    }

    /// `waitpid(2)` with exactly-once status retrieval.
    ///
    /// Returns `(0, None)` when `WNOHANG` is set and no child is ready, and
    /// `(pid, Some(status))` once a child terminated. Statuses collected by
    /// [`sweep`](Self::sweep) are returned here first.
    pub fn waitpid(&mut self, pid: i32, options: i32) -> SysResult<(i32, Option<WaitStatus>)> {
        if let Some(found) = self.take_swept(pid) {
            return Ok((found.0, Some(found.1)));
        }

        let mut status: libc::c_int = 0;
        let ret = loop {
            let ret = unsafe { libc::waitpid(pid, &mut status, options) };
            if ret < 0 && Errno::last().is_interrupted() {
                continue;
            }
            break ret;
        };

        if ret < 0 {
            let err = Errno::last();
            if pid > 0 {
                self.children.remove(&pid);
            }
            return Err(err);
        }
        if ret == 0 {
            return Ok((0, None));
        }

        self.children.remove(&ret);
        Ok((ret, Some(WaitStatus(status))))
    }

    fn take_swept(&mut self, pid: i32) -> Option<(i32, WaitStatus)> {
        let found = if pid > 0 {
            match self.children.get(&pid) {
                Some(Some(status)) => Some((pid, *status)),
                _ => None,
            }
        } else {
            self.children
                .iter()
                .find_map(|(&child, status)| status.map(|s| (child, s)))
        };
        if let Some((child, _)) = found {
            self.children.remove(&child);
        }
        found
    }

    /// Collect every tracked child that has terminated, without blocking.
    ///
    /// The status is kept until [`waitpid`](Self::waitpid) hands it out, so
    /// no zombie lingers in the meantime.
    pub fn sweep(&mut self) -> usize {
        let mut collected = 0;
        for (&pid, slot) in self.children.iter_mut() {
            if slot.is_some() {
                continue;
            }
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if ret == pid {
                *slot = Some(WaitStatus(status));
                collected += 1;
            }
        }
        if collected > 0 {
            tracing::debug!(collected, "reaped terminated children");
        }
        collected
    }

    /// Status stored by a sweep for `pid`, without consuming it
    pub fn swept_status(&self, pid: i32) -> Option<WaitStatus> {
        self.children.get(&pid).copied().flatten()
    }

    /// Whether `pid` is a tracked child whose status was not retrieved yet
    pub fn is_tracked(&self, pid: i32) -> bool {
        self.children.contains_key(&pid)
    }

    /// Number of tracked children
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

fn wait_blocking(pid: i32) -> SysResult<WaitStatus> {
    let mut status: libc::c_int = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret == pid {
            return Ok(WaitStatus(status));
        }
        let err = Errno::last();
        if !err.is_interrupted() {
            return Err(err);
        }
    }
}

/// Everything the child needs, allocated before `fork`
struct PreparedExec {
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const libc::c_char>,
    candidates: Vec<CString>,
    cwd: Option<CString>,
    stdio: [Option<RawFd>; 3],
    gid: Option<u32>,
    uid: Option<u32>,
    close_limit: libc::c_int,
}

impl PreparedExec {
    fn new<S: AsRef<OsStr>>(
        args: &[S],
        options: &ExecOptions,
        close_fds_limit: usize,
    ) -> SysResult<Self> {
        if args.is_empty() {
            return Err(Errno::EINVAL);
        }

        let argv = args
            .iter()
            .map(|a| to_cstring(a.as_ref().as_bytes()))
            .collect::<SysResult<Vec<_>>>()?;
        let argv_ptrs = null_terminated(&argv);

        let envp = match &options.env {
            Some(env) => env
                .iter()
                .map(|(k, v)| to_cstring(format!("{}={}", k, v).as_bytes()))
                .collect::<SysResult<Vec<_>>>()?,
            None => std::env::vars_os()
                .map(|(k, v)| {
                    let mut entry = k.as_bytes().to_vec();
                    entry.push(b'=');
                    entry.extend_from_slice(v.as_bytes());
                    to_cstring(&entry)
                })
                .collect::<SysResult<Vec<_>>>()?,
        };
        let envp_ptrs = null_terminated(&envp);

        let file = match &options.file {
            Some(file) => file.clone(),
            None => PathBuf::from(args[0].as_ref()),
        };
        let candidates = resolve_candidates(&file, options.use_path)?;

        let cwd = options
            .cwd
            .as_deref()
            .map(os::path_to_cstring)
            .transpose()?;

        let open_max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        let open_max = if open_max < 0 { 1024 } else { open_max as usize };
        let close_limit = open_max.min(close_fds_limit).min(libc::c_int::MAX as usize);

        Ok(Self {
            _argv: argv,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
            candidates,
            cwd,
            stdio: [options.stdin, options.stdout, options.stderr],
            gid: options.gid,
            uid: options.uid,
            close_limit: close_limit as libc::c_int,
        })
    }

    /// Runs in the forked child. Async-signal-safe calls only.
    unsafe fn exec_child(&self) -> ! {
        for (target, source) in self.stdio.iter().enumerate() {
            if let Some(fd) = *source {
                let target = target as libc::c_int;
                if fd != target && libc::dup2(fd, target) < 0 {
                    libc::_exit(EXEC_FAILURE_CODE);
                }
            }
        }

        for fd in 3..self.close_limit {
            libc::close(fd);
        }

        if let Some(cwd) = &self.cwd {
            if libc::chdir(cwd.as_ptr()) < 0 {
                libc::_exit(EXEC_FAILURE_CODE);
            }
        }

        if let Some(gid) = self.gid {
            if libc::setgid(gid as libc::gid_t) < 0 {
                libc::_exit(EXEC_FAILURE_CODE);
            }
        }
        if let Some(uid) = self.uid {
            if libc::setuid(uid as libc::uid_t) < 0 {
                libc::_exit(EXEC_FAILURE_CODE);
            }
        }

        for candidate in &self.candidates {
            libc::execve(
                candidate.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            );
        }
        libc::_exit(EXEC_FAILURE_CODE)
    }
}

fn to_cstring(bytes: &[u8]) -> SysResult<CString> {
    CString::new(bytes).map_err(|_| Errno::EINVAL)
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Paths to try with `execve`, in order
fn resolve_candidates(file: &Path, use_path: bool) -> SysResult<Vec<CString>> {
    let bytes = file.as_os_str().as_bytes();
    if !use_path || bytes.contains(&b'/') {
        return Ok(vec![to_cstring(bytes)?]);
    }

    let search = std::env::var_os("PATH").unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin".into());
    let mut candidates = Vec::new();
    for dir in search.as_bytes().split(|&b| b == b':') {
        let dir: &[u8] = if dir.is_empty() { b"." } else { dir };
        let mut path = dir.to_vec();
        path.push(b'/');
        path.extend_from_slice(bytes);
        candidates.push(to_cstring(&path)?);
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_options_defaults() {
        let options = ExecOptions::default();
        assert!(options.block);
        assert!(options.use_path);
        assert!(options.env.is_none());
    }

    #[test]
    fn test_wait_status_decoding() {
        // exit(3): code in the second byte
        assert_eq!(WaitStatus(3 << 8).state(), ChildState::Exited(3));
        assert_eq!(WaitStatus(3 << 8).exec_code(), 3);
        // killed by SIGKILL
        assert_eq!(
            WaitStatus(libc::SIGKILL).state(),
            ChildState::Signaled(libc::SIGKILL)
        );
        assert_eq!(WaitStatus(libc::SIGKILL).exec_code(), -libc::SIGKILL);
    }

    #[test]
    fn test_resolve_candidates() {
        let direct = resolve_candidates(Path::new("/bin/sh"), true).unwrap();
        assert_eq!(direct.len(), 1);

        let no_path = resolve_candidates(Path::new("sh"), false).unwrap();
        assert_eq!(no_path[0].as_bytes(), b"sh");

        let searched = resolve_candidates(Path::new("sh"), true).unwrap();
        assert!(searched.iter().all(|c| c.as_bytes().ends_with(b"/sh")));
    }

    #[test]
    fn test_exec_empty_args() {
        let mut manager = ProcessManager::new(64);
        let args: [&str; 0] = [];
        assert_eq!(
            manager.exec(&args, &ExecOptions::default()).unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn test_exec_blocking_exit_code() {
        let mut manager = ProcessManager::new(64);
        let outcome = manager
            .exec(&["sh", "-c", "exit 7"], &ExecOptions::default())
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Exited(7));
    }

    #[test]
    fn test_exec_missing_program_exits_127() {
        let mut manager = ProcessManager::new(64);
        let outcome = manager
            .exec(&["hostrt-no-such-program"], &ExecOptions::default())
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Exited(EXEC_FAILURE_CODE));
    }

    #[test]
    fn test_sweep_then_waitpid_once() {
        let mut manager = ProcessManager::new(64);
        let ExecOutcome::Spawned(pid) = manager
            .exec(&["true"], &ExecOptions::new().block(false))
            .unwrap()
        else {
            panic!("expected a pid");
        };
        assert!(manager.is_tracked(pid));

        while manager.swept_status(pid).is_none() {
            manager.sweep();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let (ret, status) = manager.waitpid(pid, libc::WNOHANG).unwrap();
        assert_eq!(ret, pid);
        assert_eq!(status.unwrap().state(), ChildState::Exited(0));
        assert!(!manager.is_tracked(pid));

        assert_eq!(
            manager.waitpid(pid, libc::WNOHANG).unwrap_err(),
            Errno::ECHILD
        );
    }
}
