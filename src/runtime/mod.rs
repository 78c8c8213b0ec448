//! Event loop runtime
//!
//! One [`Runtime`] per execution context. The main context owns signal
//! bindings and worker creation; each worker thread runs its own runtime
//! connected to the parent by a message port.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         RUNTIME                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Reactor: read/write handlers per descriptor                    │
//! │  TimerQueue: one-shot callbacks by deadline                     │
//! │  SignalDispatcher: self-pipe trap, deferred handlers            │
//! │  ProcessManager: fork/exec and exactly-once reaping             │
//! │  Worker ports: structured-clone message queues                  │
//! │  EventLoop: poll(2) over everything above                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each iteration waits once, then dispatches in a fixed order: read
//! handlers, write handlers, expired timers, pending signals, queued
//! messages. Handlers run to completion on the loop thread.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use hostrt::Runtime;
//!
//! let mut rt = Runtime::new();
//! rt.set_timeout(Duration::from_millis(10), |_rt| {
//!     println!("tick");
//!     Ok(())
//! });
//! rt.run()?;
//! # Ok::<(), hostrt::RuntimeError>(())
//! ```

pub mod event_loop;
pub mod process;
pub mod reactor;
pub mod signal;
pub mod timer;

mod error;

pub use error::RuntimeError;
pub use event_loop::{Event, EventLoop, Interest, Token, WaitOutcome};
pub use process::{ChildState, ExecOptions, ExecOutcome, ProcessManager, WaitStatus};
pub use reactor::{Direction, Reactor};
pub use signal::{SignalAction, SignalDispatcher};
pub use timer::{TimerCallback, TimerId, TimerQueue};

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::os::{self, SysResult};
use crate::worker::{self, MessageHandler, Value, WorkerId, WorkerPort, WorkerSeed};

/// Result returned by every callback
pub type HandlerResult = anyhow::Result<()>;

/// Descriptor and signal callback
pub type Handler = Box<dyn FnMut(&mut Runtime) -> HandlerResult>;

pub(crate) type SharedHandler = Rc<RefCell<Handler>>;

pub(crate) fn share(handler: Handler) -> SharedHandler {
    Rc::new(RefCell::new(handler))
}

/// Which kind of context a runtime serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Main,
    Worker,
}

/// Runtime statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub registered_fds: usize,
    pub pending_timers: usize,
    pub signal_bindings: usize,
    pub workers: usize,
    pub tracked_children: usize,
    /// Handlers that returned an error or panicked
    pub handler_failures: u64,
    pub iterations: u64,
}

/// Single-threaded event loop for one execution context
pub struct Runtime {
    kind: ContextKind,
    config: RuntimeConfig,
    event_loop: EventLoop,
    reactor: Reactor,
    timers: TimerQueue,
    signals: SignalDispatcher,
    processes: ProcessManager,
    workers: BTreeMap<WorkerId, WorkerPort>,
    next_worker_id: u64,
    /// Set by the parent to stop a worker's loop
    terminate: Option<Arc<AtomicBool>>,
    /// Readiness results from the last wait
    events: Vec<Event>,
    handler_failures: u64,
    iterations: u64,
}

impl Runtime {
    /// Create a main-context runtime with the default configuration
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a main-context runtime
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::build(ContextKind::Main, config)
    }

    pub(crate) fn for_worker(config: RuntimeConfig, seed: WorkerSeed) -> Self {
        let mut rt = Self::build(ContextKind::Worker, config);
        rt.terminate = Some(Arc::clone(&seed.terminate));
        rt.workers.insert(
            WorkerId::PARENT,
            WorkerPort {
                outbox: seed.outbox,
                inbox: seed.inbox,
                handler: None,
                terminate: seed.terminate,
                thread: None,
            },
        );
        rt
    }

    fn build(kind: ContextKind, config: RuntimeConfig) -> Self {
        Self {
            kind,
            event_loop: EventLoop::with_capacity(config.event_loop.max_poll_fds),
            processes: ProcessManager::new(config.process.close_fds_limit),
            config,
            reactor: Reactor::new(),
            timers: TimerQueue::new(),
            signals: SignalDispatcher::new(),
            workers: BTreeMap::new(),
            next_worker_id: 1,
            terminate: None,
            events: Vec::new(),
            handler_failures: 0,
            iterations: 0,
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn is_worker(&self) -> bool {
        self.kind == ContextKind::Worker
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn require_main(&self, operation: &'static str) -> Result<(), RuntimeError> {
        if self.is_worker() {
            return Err(RuntimeError::MainContextOnly { operation });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Descriptors
    // ------------------------------------------------------------------

    /// Install (`Some`) or clear (`None`) the read handler for `fd`.
    ///
    /// A new handler replaces the previous one. Clearing always removes the
    /// registration, even if `fd` has been closed behind the runtime's back.
    pub fn set_read_handler(
        &mut self,
        fd: RawFd,
        handler: Option<Handler>,
    ) -> Result<(), RuntimeError> {
        self.set_handler(fd, Direction::Read, handler)
    }

    /// Install (`Some`) or clear (`None`) the write handler for `fd`
    pub fn set_write_handler(
        &mut self,
        fd: RawFd,
        handler: Option<Handler>,
    ) -> Result<(), RuntimeError> {
        self.set_handler(fd, Direction::Write, handler)
    }

    fn set_handler(
        &mut self,
        fd: RawFd,
        direction: Direction,
        handler: Option<Handler>,
    ) -> Result<(), RuntimeError> {
        match handler {
            Some(handler) => {
                if !os::is_open(fd) {
                    return Err(RuntimeError::InvalidDescriptor(fd));
                }
                self.reactor.set(fd, direction, Some(share(handler)));
                tracing::debug!(fd, ?direction, "handler installed");
            }
            None => {
                self.reactor.set(fd, direction, None);
                if !os::is_open(fd) {
                    return Err(RuntimeError::InvalidDescriptor(fd));
                }
            }
        }
        Ok(())
    }

    /// Drop every handler for `fd`, then close it
    pub fn close(&mut self, fd: RawFd) -> SysResult<()> {
        self.reactor.remove(fd);
        os::close(fd)
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    /// Bind a signal. Handlers run from the loop, never from the trap.
    pub fn bind_signal(&mut self, signo: i32, action: SignalAction) -> Result<(), RuntimeError> {
        self.require_main("bind_signal")?;
        self.signals.bind(signo, action)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Processes
    // ------------------------------------------------------------------

    /// Spawn a child process
    pub fn exec<S: AsRef<OsStr>>(
        &mut self,
        args: &[S],
        options: &ExecOptions,
    ) -> SysResult<ExecOutcome> {
        if !options.block && !self.is_worker() && self.config.process.reap_on_sigchld {
            self.signals.watch(libc::SIGCHLD)?;
        }
        self.processes.exec(args, options)
    }

    /// `waitpid(2)` with exactly-once status retrieval; see
    /// [`ProcessManager::waitpid`].
    pub fn waitpid(&mut self, pid: i32, options: i32) -> SysResult<(i32, Option<WaitStatus>)> {
        self.processes.waitpid(pid, options)
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Run `callback` once, no earlier than `delay` from now
    pub fn set_timeout<F>(&mut self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce(&mut Runtime) -> HandlerResult + 'static,
    {
        self.timers.insert_after(delay, Box::new(callback))
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    pub fn clear_timeout(&mut self, id: TimerId) -> bool {
        self.timers.remove(id)
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Start a worker thread running `entry` and then its own loop
    pub fn create_worker<F>(&mut self, entry: F) -> Result<WorkerId, RuntimeError>
    where
        F: FnOnce(&mut Runtime) -> anyhow::Result<()> + Send + 'static,
    {
        self.require_main("create_worker")?;
        let id = WorkerId(self.next_worker_id);
        let port = worker::spawn(id, &self.config, Box::new(entry))?;
        self.next_worker_id += 1;
        self.workers.insert(id, port);
        Ok(id)
    }

    /// Send a structured clone of `value` to the other end of `id`
    pub fn post(&mut self, id: WorkerId, value: &Value) -> Result<(), RuntimeError> {
        let port = self
            .workers
            .get(&id)
            .ok_or(RuntimeError::UnknownWorker(id))?;
        let message = worker::serialize(value)?;
        if !port.outbox.send(message) {
            tracing::debug!(worker = %id, "message dropped, receiver is gone");
        }
        Ok(())
    }

    /// Install (`Some`) or clear (`None`) the message handler for `id`
    pub fn set_message_handler(
        &mut self,
        id: WorkerId,
        handler: Option<MessageHandler>,
    ) -> Result<(), RuntimeError> {
        let port = self
            .workers
            .get_mut(&id)
            .ok_or(RuntimeError::UnknownWorker(id))?;
        port.handler = handler.map(|h| Rc::new(RefCell::new(h)));
        Ok(())
    }

    /// Stop worker `id` at its next loop check and forget its port
    pub fn terminate_worker(&mut self, id: WorkerId) -> Result<(), RuntimeError> {
        self.require_main("terminate_worker")?;
        let port = self
            .workers
            .remove(&id)
            .ok_or(RuntimeError::UnknownWorker(id))?;
        port.request_terminate();
        let thread = port
            .thread
            .as_ref()
            .and_then(|handle| handle.thread().name())
            .unwrap_or("<unnamed>");
        // The thread is detached; it exits at its next loop check
        tracing::debug!(worker = %id, thread, "worker terminated");
        Ok(())
    }

    /// Id of the parent endpoint when running inside a worker
    pub fn parent(&self) -> Option<WorkerId> {
        if self.is_worker() {
            Some(WorkerId::PARENT)
        } else {
            None
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminate
            .as_ref()
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------

    /// Whether anything can still make the loop do work
    pub fn has_pending_work(&self) -> bool {
        if self.is_terminated() {
            return false;
        }
        !self.reactor.is_empty()
            || !self.timers.is_empty()
            || self.signals.has_handlers()
            || self.workers.values().any(WorkerPort::is_live)
    }

    /// Run iterations until no handler, timer, binding or live port is left
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        tracing::debug!(context = ?self.kind, "loop started");
        while self.run_once(None)? {}
        tracing::debug!(context = ?self.kind, iterations = self.iterations, "loop finished");
        Ok(())
    }

    /// Run one iteration, waiting at most `max_wait` (`None` waits for the
    /// next event or timer). Returns whether work remains.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<bool, RuntimeError> {
        if !self.has_pending_work() {
            return Ok(false);
        }
        self.iterations += 1;
        tracing::trace!(iteration = self.iterations, "loop iteration");

        let ready = self.wait(max_wait)?;
        self.dispatch_io(&ready);
        self.dispatch_timers();
        self.dispatch_signals();
        self.dispatch_messages();

        Ok(self.has_pending_work())
    }

    /// Wait for readiness. Returns the ready handler descriptors in
    /// registration order.
    fn wait(&mut self, max_wait: Option<Duration>) -> Result<Vec<(RawFd, Interest)>, RuntimeError> {
        let mut fds = Vec::new();
        loop {
            self.event_loop.clear();
            fds.clear();
            for (fd, interest) in self.reactor.interests() {
                self.event_loop.register(fd, interest);
                fds.push(fd);
            }
            if let Some(fd) = self.signals.wake_fd() {
                self.event_loop.register(fd, Interest::READABLE);
            }
            for port in self.workers.values() {
                self.event_loop.register(port.inbox.wake_fd(), Interest::READABLE);
            }

            let timeout = self.wait_budget(max_wait);
            self.events.clear();
            match self.event_loop.poll(&mut self.events, timeout) {
                Ok(WaitOutcome::Ready(_)) => break,
                Ok(WaitOutcome::Interrupted) => {
                    tracing::trace!("wait interrupted by signal");
                    self.dispatch_signals();
                    if !self.has_pending_work() {
                        return Ok(Vec::new());
                    }
                }
                Err(err) => return Err(RuntimeError::Poll(err)),
            }
        }

        // Internal wake descriptors sit after the handler descriptors and
        // are drained by their own dispatch phase.
        Ok(self
            .events
            .iter()
            .filter(|event| event.token.0 < fds.len())
            .map(|event| (fds[event.token.0], event.readiness))
            .collect())
    }

    fn wait_budget(&mut self, max_wait: Option<Duration>) -> Option<Duration> {
        if self.signals.has_pending()
            || self.is_terminated()
            || self.workers.values().any(WorkerPort::has_deliverable)
        {
            return Some(Duration::ZERO);
        }
        match (max_wait, self.timers.timeout_until_next(Instant::now())) {
            (Some(cap), Some(next)) => Some(cap.min(next)),
            (cap, next) => cap.or(next),
        }
    }

    fn dispatch_io(&mut self, ready: &[(RawFd, Interest)]) {
        for &(fd, readiness) in ready {
            if readiness.is_invalid() && self.reactor.remove(fd) {
                tracing::debug!(fd, "dropped handlers for closed descriptor");
            }
        }
        for &(fd, readiness) in ready {
            if readiness.wants_read_dispatch() && !readiness.is_invalid() {
                // Re-read the registry: an earlier handler may have cleared it
                if let Some(handler) = self.reactor.handler(fd, Direction::Read) {
                    self.call_handler(&handler, "read");
                }
            }
        }
        for &(fd, readiness) in ready {
            if readiness.wants_write_dispatch() && !readiness.is_invalid() {
                if let Some(handler) = self.reactor.handler(fd, Direction::Write) {
                    self.call_handler(&handler, "write");
                }
            }
        }
    }

    fn dispatch_timers(&mut self) {
        // The batch is fixed up front; timers added now wait for a later
        // iteration even with a zero delay.
        let due = self.timers.take_expired(Instant::now());
        for id in due {
            if let Some(callback) = self.timers.take_callback(id) {
                self.guarded("timer", callback);
            }
        }
    }

    fn dispatch_signals(&mut self) {
        self.signals.drain_wake();
        let pending = self.signals.take_pending();
        if pending.is_empty() {
            return;
        }
        tracing::trace!(?pending, "dispatching signals");

        if pending.contains(&libc::SIGCHLD) {
            self.processes.sweep();
        }
        for signo in pending {
            if let Some(handler) = self.signals.handler(signo) {
                self.call_handler(&handler, "signal");
            }
        }
    }

    fn dispatch_messages(&mut self) {
        let limit = self.config.event_loop.max_messages_per_iteration;
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();

        for id in ids {
            let queued = match self.workers.get(&id) {
                Some(port) => {
                    port.inbox.drain_wake();
                    port.inbox.len().min(limit)
                }
                None => continue,
            };

            for _ in 0..queued {
                if self.is_terminated() {
                    return;
                }
                // The handler may clear itself or terminate the port
                let Some(port) = self.workers.get(&id) else {
                    break;
                };
                let Some(handler) = port.handler.clone() else {
                    break;
                };
                let Some(message) = port.inbox.try_recv() else {
                    break;
                };
                let value = worker::deserialize(message);
                self.guarded("message", |rt| match handler.try_borrow_mut() {
                    Ok(mut callback) => {
                        let callback: &mut MessageHandler = &mut callback;
                        callback(rt, value)
                    }
                    Err(_) => Err(anyhow::anyhow!("message handler re-entered")),
                });
            }
        }
    }

    fn call_handler(&mut self, handler: &SharedHandler, source: &'static str) {
        self.guarded(source, |rt| match handler.try_borrow_mut() {
            Ok(mut callback) => {
                let callback: &mut Handler = &mut callback;
                callback(rt)
            }
            Err(_) => Err(anyhow::anyhow!("handler re-entered")),
        });
    }

    /// Run a callback; errors and panics are logged and counted
    fn guarded<F>(&mut self, source: &'static str, callback: F)
    where
        F: FnOnce(&mut Runtime) -> HandlerResult,
    {
        match panic::catch_unwind(AssertUnwindSafe(|| callback(self))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.handler_failures += 1;
                tracing::warn!(source, error = %err, "handler failed");
            }
            Err(payload) => {
                self.handler_failures += 1;
                tracing::warn!(source, panic = %panic_message(payload.as_ref()), "handler panicked");
            }
        }
    }

    /// Get runtime statistics
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            registered_fds: self.reactor.len(),
            pending_timers: self.timers.len(),
            signal_bindings: self.signals.len(),
            workers: self
                .workers
                .keys()
                .filter(|id| **id != WorkerId::PARENT)
                .count(),
            tracked_children: self.processes.len(),
            handler_failures: self.handler_failures,
            iterations: self.iterations,
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
        let c = Rc::new(Cell::new(0));
        (c.clone(), c)
    }

    #[test]
    fn test_empty_loop_returns() {
        let mut rt = Runtime::new();
        assert!(!rt.has_pending_work());
        rt.run().unwrap();
        assert_eq!(rt.stats().iterations, 0);
    }

    #[test]
    fn test_read_handler_runs_and_clears() {
        let mut rt = Runtime::new();
        let (r, w) = os::pipe().unwrap();
        os::write(w, b"x").unwrap();

        let (seen, check) = counter();
        rt.set_read_handler(
            r,
            Some(Box::new(move |rt: &mut Runtime| -> HandlerResult {
                let mut buf = [0u8; 8];
                os::read(r, &mut buf)?;
                seen.set(seen.get() + 1);
                rt.set_read_handler(r, None)?;
                Ok(())
            })),
        )
        .unwrap();

        rt.run().unwrap();
        assert_eq!(check.get(), 1);
        assert_eq!(rt.stats().registered_fds, 0);
        os::close(r).unwrap();
        os::close(w).unwrap();
    }

    #[test]
    fn test_set_handler_on_closed_fd() {
        let mut rt = Runtime::new();
        let err = rt
            .set_read_handler(-1, Some(Box::new(|_rt: &mut Runtime| Ok(()))))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidDescriptor(-1)));
        assert!(matches!(
            rt.set_write_handler(-1, None),
            Err(RuntimeError::InvalidDescriptor(-1))
        ));
    }

    #[test]
    fn test_zero_timeout_does_not_recurse() {
        let mut rt = Runtime::new();
        let (fired, check) = counter();
        rt.set_timeout(Duration::ZERO, move |rt| {
            let fired = fired.clone();
            fired.set(fired.get() + 1);
            rt.set_timeout(Duration::ZERO, move |_rt| {
                fired.set(fired.get() + 1);
                Ok(())
            });
            Ok(())
        });

        assert!(rt.run_once(None).unwrap());
        assert_eq!(check.get(), 1);
        assert!(!rt.run_once(None).unwrap());
        assert_eq!(check.get(), 2);
    }

    #[test]
    fn test_clear_timeout_from_earlier_timer() {
        let mut rt = Runtime::new();
        let (fired, check) = counter();
        let later = rt.set_timeout(Duration::from_millis(1), move |_rt| {
            fired.set(fired.get() + 1);
            Ok(())
        });
        let cancelled = Rc::new(Cell::new(false));
        let flag = cancelled.clone();
        rt.set_timeout(Duration::ZERO, move |rt| {
            flag.set(rt.clear_timeout(later));
            Ok(())
        });
        // Both are due in the same batch; the earlier deadline runs first
        std::thread::sleep(Duration::from_millis(5));

        rt.run().unwrap();
        assert!(cancelled.get());
        assert_eq!(check.get(), 0);
        assert!(!rt.clear_timeout(later));
    }

    #[test]
    fn test_handler_failures_counted() {
        let mut rt = Runtime::new();
        rt.set_timeout(Duration::ZERO, |_rt| Err(anyhow::anyhow!("boom")));
        rt.set_timeout(Duration::ZERO, |_rt| panic!("kaboom"));
        let (after, check) = counter();
        rt.set_timeout(Duration::ZERO, move |_rt| {
            after.set(1);
            Ok(())
        });

        rt.run().unwrap();
        assert_eq!(rt.stats().handler_failures, 2);
        assert_eq!(check.get(), 1);
    }

    #[test]
    fn test_signal_handler_runs_on_later_iteration() {
        let mut rt = Runtime::new();
        let (hits, check) = counter();
        rt.bind_signal(
            libc::SIGUSR1,
            SignalAction::Handle(Box::new(move |rt: &mut Runtime| -> HandlerResult {
                hits.set(hits.get() + 1);
                rt.bind_signal(libc::SIGUSR1, SignalAction::Default)?;
                Ok(())
            })),
        )
        .unwrap();
        assert_eq!(rt.stats().signal_bindings, 1);

        assert_eq!(unsafe { libc::raise(libc::SIGUSR1) }, 0);
        assert_eq!(check.get(), 0);

        rt.run().unwrap();
        assert_eq!(check.get(), 1);
        assert_eq!(rt.stats().signal_bindings, 0);
    }

    #[test]
    fn test_worker_only_capabilities() {
        let (outbox, inbox) = worker::channel().unwrap();
        let seed = WorkerSeed {
            outbox,
            inbox,
            terminate: Arc::new(AtomicBool::new(false)),
        };
        let mut rt = Runtime::for_worker(RuntimeConfig::default(), seed);
        assert_eq!(rt.parent(), Some(WorkerId::PARENT));
        assert!(matches!(
            rt.bind_signal(libc::SIGUSR1, SignalAction::Ignore),
            Err(RuntimeError::MainContextOnly { .. })
        ));
        assert!(matches!(
            rt.create_worker(|_rt| Ok(())),
            Err(RuntimeError::MainContextOnly { .. })
        ));
        assert_eq!(rt.stats().workers, 0);
    }

    #[test]
    fn test_unknown_worker() {
        let mut rt = Runtime::new();
        assert_eq!(rt.parent(), None);
        assert!(matches!(
            rt.post(WorkerId(42), &Value::Null),
            Err(RuntimeError::UnknownWorker(WorkerId(42)))
        ));
    }
}
