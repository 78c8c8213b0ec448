//! hostrt - Host Runtime Core for Embedded Scripting
//!
//! The OS-facing half of a script host: a single-threaded event loop that
//! multiplexes descriptor readiness, one-shot timers, deferred POSIX signal
//! handlers, child processes and message channels to worker threads.
//!
//! # Features
//!
//! - **Descriptor handlers**: one read and one write callback per descriptor, dispatched from `poll(2)`
//! - **Timers**: deadline-ordered one-shot callbacks, FIFO on equal deadlines
//! - **Signals**: self-pipe trap, handlers always run from the loop
//! - **Processes**: `fork`/`execve` with typed options, exactly-once `waitpid`
//! - **Workers**: OS threads with their own loop, structured-clone messages, shared byte buffers
//! - **OS layer**: thin file, directory, terminal and descriptor wrappers returning [`os::SysResult`]
//!
//! # Example
//!
//! ```no_run
//! use hostrt::{Runtime, Value};
//!
//! let mut rt = Runtime::new();
//! let worker = rt.create_worker(|rt| {
//!     rt.set_message_handler(hostrt::WorkerId::PARENT, Some(Box::new(|rt: &mut Runtime, value: Value| -> hostrt::HandlerResult {
//!         rt.post(hostrt::WorkerId::PARENT, &value)?;
//!         Ok(())
//!     })))?;
//!     Ok(())
//! })?;
//!
//! rt.set_message_handler(worker, Some(Box::new(move |rt: &mut Runtime, value: Value| -> hostrt::HandlerResult {
//!     println!("echoed: {:?}", value);
//!     rt.terminate_worker(worker)?;
//!     Ok(())
//! })))?;
//! rt.post(worker, &Value::string("hello"))?;
//! rt.run()?;
//! # Ok::<(), hostrt::RuntimeError>(())
//! ```

pub mod config;
pub mod logging;
pub mod os;
pub mod runtime;
pub mod worker;

pub use config::{ConfigError, RuntimeConfig};
pub use os::{Errno, SysResult};
pub use runtime::{
    ContextKind, ExecOptions, ExecOutcome, Handler, HandlerResult, Runtime, RuntimeError,
    RuntimeStats, SignalAction, TimerId, WaitStatus,
};
pub use worker::{CloneError, MessageHandler, SharedBuffer, Value, WorkerId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
