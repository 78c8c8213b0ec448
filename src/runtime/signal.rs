//! Signal dispatcher
//!
//! The OS-level trap runs in async-signal context, so it only sets a
//! "signal N pending" bit and writes one byte to a self-pipe. The loop that
//! owns the pipe drains the bits once per iteration and runs the bound
//! handlers from ordinary loop context.
//!
//! Several runtimes may listen in one process (tests do this). Each claims
//! a listener slot holding its own pending mask and wake pipe; the trap
//! fans out to every active slot. The process-wide disposition of a signal
//! is reference counted: it stays on the trap while any runtime routes it,
//! and the last one out installs the most recently requested default or
//! ignore disposition.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::{Handler, SharedHandler};
use crate::os::{self, Errno, SysResult};

/// Highest signal number the dispatcher tracks
pub const MAX_SIGNAL: i32 = 64;

const MAX_LISTENERS: usize = 16;

#[allow(clippy::declare_interior_mutable_const)]
const INACTIVE: AtomicBool = AtomicBool::new(false);
#[allow(clippy::declare_interior_mutable_const)]
const NO_FD: AtomicI32 = AtomicI32::new(-1);
#[allow(clippy::declare_interior_mutable_const)]
const NOTHING_PENDING: AtomicU64 = AtomicU64::new(0);
#[allow(clippy::declare_interior_mutable_const)]
const NO_PIPE: OnceCell<(RawFd, RawFd)> = OnceCell::new();

static ACTIVE: [AtomicBool; MAX_LISTENERS] = [INACTIVE; MAX_LISTENERS];
static WAKE_FD: [AtomicI32; MAX_LISTENERS] = [NO_FD; MAX_LISTENERS];
static PENDING: [AtomicU64; MAX_LISTENERS] = [NOTHING_PENDING; MAX_LISTENERS];
/// Slot pipes live for the whole process so the trap never writes to a
/// descriptor that was closed and reused.
static PIPES: [OnceCell<(RawFd, RawFd)>; MAX_LISTENERS] = [NO_PIPE; MAX_LISTENERS];

/// Disposition bookkeeping for one signal number
#[derive(Clone, Copy)]
struct Disposition {
    /// Dispatchers currently routing the signal through the trap
    refs: u32,
    /// Installed once `refs` drops to zero
    fallback: Fallback,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Fallback {
    Default,
    Ignore,
}

impl Fallback {
    fn handler(self) -> SigHandler {
        match self {
            Fallback::Default => SigHandler::SigDfl,
            Fallback::Ignore => SigHandler::SigIgn,
        }
    }
}

const UNTRAPPED: Disposition = Disposition {
    refs: 0,
    fallback: Fallback::Default,
};

/// Serializes every `sigaction` change made by this module
static DISPOSITIONS: Mutex<[Disposition; MAX_SIGNAL as usize + 1]> =
    parking_lot::const_mutex([UNTRAPPED; MAX_SIGNAL as usize + 1]);

/// Route `signal` through the trap on behalf of one more dispatcher
fn acquire_trap(signal: Signal) -> SysResult<()> {
    let mut table = DISPOSITIONS.lock();
    let entry = &mut table[signal as usize];
    if entry.refs == 0 {
        install(signal, SigHandler::Handler(trap))?;
    }
    entry.refs += 1;
    Ok(())
}

/// Drop one dispatcher's claim on `signal`, restoring the fallback when it
/// was the last
fn release_trap(signal: Signal) -> SysResult<()> {
    let mut table = DISPOSITIONS.lock();
    let entry = &mut table[signal as usize];
    entry.refs = entry.refs.saturating_sub(1);
    if entry.refs == 0 {
        install(signal, entry.fallback.handler())?;
    }
    Ok(())
}

/// Request a default or ignore disposition. Applied now when no dispatcher
/// traps the signal, otherwise when the last one releases it.
fn set_fallback(signal: Signal, fallback: Fallback) -> SysResult<()> {
    let mut table = DISPOSITIONS.lock();
    let entry = &mut table[signal as usize];
    entry.fallback = fallback;
    if entry.refs == 0 {
        install(signal, fallback.handler())?;
    }
    Ok(())
}

fn signal_bit(signo: i32) -> u64 {
    1u64 << (signo - 1)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

#[cfg(any(target_os = "openbsd", target_os = "netbsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno()
}

/// The OS-level trap. Async-signal-safe: atomics and `write(2)` only.
extern "C" fn trap(signo: libc::c_int) {
    let saved = unsafe { *errno_location() };
    if (1..=MAX_SIGNAL).contains(&signo) {
        let bit = signal_bit(signo);
        for slot in 0..MAX_LISTENERS {
            if !ACTIVE[slot].load(Ordering::Acquire) {
                continue;
            }
            PENDING[slot].fetch_or(bit, Ordering::AcqRel);
            let fd = WAKE_FD[slot].load(Ordering::Acquire);
            if fd >= 0 {
                let byte = 1u8;
                unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
            }
        }
    }
    unsafe { *errno_location() = saved };
}

fn make_wake_pipe() -> SysResult<(RawFd, RawFd)> {
    let (r, w) = os::pipe()?;
    for fd in [r, w] {
        os::set_nonblocking(fd)?;
        os::set_cloexec(fd)?;
    }
    Ok((r, w))
}

fn drain_fd(fd: RawFd) {
    let mut buf = [0u8; 64];
    while matches!(os::read(fd, &mut buf), Ok(n) if n > 0) {}
}

/// A claimed listener slot
struct Listener {
    slot: usize,
    read_fd: RawFd,
}

impl Listener {
    fn claim() -> SysResult<Self> {
        for slot in 0..MAX_LISTENERS {
            if ACTIVE[slot]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let (read_fd, write_fd) = match PIPES[slot].get_or_try_init(make_wake_pipe) {
                Ok(pipe) => *pipe,
                Err(e) => {
                    ACTIVE[slot].store(false, Ordering::Release);
                    return Err(e);
                }
            };
            drain_fd(read_fd);
            PENDING[slot].store(0, Ordering::Release);
            WAKE_FD[slot].store(write_fd, Ordering::Release);
            tracing::debug!(slot, "claimed signal listener slot");
            return Ok(Self { slot, read_fd });
        }
        Err(Errno(libc::EMFILE))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        ACTIVE[self.slot].store(false, Ordering::Release);
        PENDING[self.slot].store(0, Ordering::Release);
        drain_fd(self.read_fd);
    }
}

/// What to do when a signal arrives
pub enum SignalAction {
    /// Restore the OS default disposition
    Default,
    /// Ignore the signal
    Ignore,
    /// Run the handler from the loop on a later iteration
    Handle(Handler),
}

/// Maps signal numbers to deferred handlers for one runtime
pub struct SignalDispatcher {
    bindings: BTreeMap<i32, SharedHandler>,
    /// Signals whose disposition this dispatcher set to the trap
    trapped: u64,
    listener: Option<Listener>,
}

impl SignalDispatcher {
    pub fn new() -> Self {
        Self {
            bindings: BTreeMap::new(),
            trapped: 0,
            listener: None,
        }
    }

    /// Bind `signo`. Rebinding replaces the previous binding.
    pub fn bind(&mut self, signo: i32, action: SignalAction) -> SysResult<()> {
        let signal = to_signal(signo)?;
        match action {
            SignalAction::Default => self.unbind(signal, Fallback::Default)?,
            SignalAction::Ignore => self.unbind(signal, Fallback::Ignore)?,
            SignalAction::Handle(handler) => {
                self.watch(signo)?;
                self.bindings.insert(signo, super::share(handler));
            }
        }
        tracing::debug!(signo, "signal binding updated");
        Ok(())
    }

    /// Route `signo` through the trap without binding a handler, so the
    /// loop sees it as pending.
    pub fn watch(&mut self, signo: i32) -> SysResult<()> {
        let signal = to_signal(signo)?;
        if self.listener.is_none() {
            self.listener = Some(Listener::claim()?);
        }
        if self.trapped & signal_bit(signo) == 0 {
            acquire_trap(signal)?;
            self.trapped |= signal_bit(signo);
        }
        Ok(())
    }

    fn unbind(&mut self, signal: Signal, fallback: Fallback) -> SysResult<()> {
        let signo = signal as i32;
        set_fallback(signal, fallback)?;
        if self.trapped & signal_bit(signo) != 0 {
            self.trapped &= !signal_bit(signo);
            release_trap(signal)?;
        }
        self.bindings.remove(&signo);
        Ok(())
    }

    /// Whether `signo` is routed through the trap
    pub fn is_watching(&self, signo: i32) -> bool {
        (1..=MAX_SIGNAL).contains(&signo) && self.trapped & signal_bit(signo) != 0
    }

    /// Handler currently bound to `signo`
    pub fn handler(&self, signo: i32) -> Option<SharedHandler> {
        self.bindings.get(&signo).cloned()
    }

    /// Read end of the wake pipe, if this dispatcher listens at all
    pub fn wake_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.read_fd)
    }

    /// Discard wake bytes; the pending mask is the source of truth
    pub fn drain_wake(&self) {
        if let Some(listener) = &self.listener {
            drain_fd(listener.read_fd);
        }
    }

    /// Whether any signal is pending without consuming it
    pub fn has_pending(&self) -> bool {
        self.listener
            .as_ref()
            .map(|l| PENDING[l.slot].load(Ordering::Acquire) != 0)
            .unwrap_or(false)
    }

    /// Take the pending signals, lowest number first
    pub fn take_pending(&mut self) -> Vec<i32> {
        let Some(listener) = &self.listener else {
            return Vec::new();
        };
        let mask = PENDING[listener.slot].swap(0, Ordering::AcqRel);
        (1..=MAX_SIGNAL)
            .filter(|&signo| mask & signal_bit(signo) != 0)
            .collect()
    }

    /// Whether any handler is bound (keeps the loop alive)
    pub fn has_handlers(&self) -> bool {
        !self.bindings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl Default for SignalDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SignalDispatcher {
    fn drop(&mut self) {
        // Signals nobody else routes go back to their fallback disposition
        for signo in 1..=MAX_SIGNAL {
            if self.trapped & signal_bit(signo) != 0 {
                if let Ok(signal) = Signal::try_from(signo) {
                    let _ = release_trap(signal);
                }
            }
        }
    }
}

fn to_signal(signo: i32) -> SysResult<Signal> {
    if !(1..=MAX_SIGNAL).contains(&signo) {
        return Err(Errno::EINVAL);
    }
    Signal::try_from(signo).map_err(Errno::from)
}

fn install(signal: Signal, handler: SigHandler) -> SysResult<()> {
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    unsafe { sigaction(signal, &action) }
        .map(|_| ())
        .map_err(Errno::from)
}
