//! Worker threads
//!
//! A worker is an OS thread running its own [`Runtime`]. The two sides talk
//! over a pair of ports, one per direction, and every message is a
//! structured clone of a [`Value`]. Only [`SharedBuffer`] contents are
//! visible to both sides at once.

pub mod clone;
mod port;
pub mod value;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub use clone::{deserialize, serialize, CloneError, SerializedMessage, MAX_CLONE_DEPTH};
pub use value::{NativeFunction, SharedBuffer, Value};

pub(crate) use port::{channel, Inbox, Outbox};

use crate::config::RuntimeConfig;
use crate::runtime::{HandlerResult, Runtime, RuntimeError};

/// Identifies the other end of a worker channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl WorkerId {
    /// The parent endpoint, as seen from inside a worker
    pub const PARENT: WorkerId = WorkerId(0);
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::PARENT {
            f.write_str("parent")
        } else {
            write!(f, "worker#{}", self.0)
        }
    }
}

/// Receives each message delivered on a port
pub type MessageHandler = Box<dyn FnMut(&mut Runtime, Value) -> HandlerResult>;

pub(crate) type SharedMessageHandler = Rc<RefCell<MessageHandler>>;

/// Code run on the worker thread before its loop starts
pub type WorkerEntry = Box<dyn FnOnce(&mut Runtime) -> anyhow::Result<()> + Send + 'static>;

/// One context's view of a worker channel
pub(crate) struct WorkerPort {
    pub outbox: Outbox,
    pub inbox: Inbox,
    pub handler: Option<SharedMessageHandler>,
    /// Shared with the worker; set to stop its loop
    pub terminate: Arc<AtomicBool>,
    pub thread: Option<JoinHandle<()>>,
}

impl WorkerPort {
    /// Whether this port keeps its loop alive
    pub fn is_live(&self) -> bool {
        self.handler.is_some() && (self.inbox.is_connected() || !self.inbox.is_empty())
    }

    /// Whether a delivery is possible right now
    pub fn has_deliverable(&self) -> bool {
        self.handler.is_some() && !self.inbox.is_empty()
    }

    /// Ask the worker to stop and wake it
    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Release);
        self.outbox.nudge();
    }
}

/// What the worker thread takes with it
pub(crate) struct WorkerSeed {
    pub outbox: Outbox,
    pub inbox: Inbox,
    pub terminate: Arc<AtomicBool>,
}

/// Start the thread for worker `id` and return the parent's port
pub(crate) fn spawn(
    id: WorkerId,
    config: &RuntimeConfig,
    entry: WorkerEntry,
) -> Result<WorkerPort, RuntimeError> {
    let (to_worker, worker_inbox) = channel()?;
    let (worker_outbox, from_worker) = channel()?;
    let terminate = Arc::new(AtomicBool::new(false));

    let seed = WorkerSeed {
        outbox: worker_outbox,
        inbox: worker_inbox,
        terminate: Arc::clone(&terminate),
    };
    let worker_config = config.clone();

    let thread = thread::Builder::new()
        .name(format!("{}{}", config.worker.thread_name_prefix, id.0))
        .stack_size(config.worker.stack_size)
        .spawn(move || run_worker(id, worker_config, seed, entry))
        .map_err(RuntimeError::WorkerSpawn)?;

    tracing::debug!(worker = %id, "worker started");

    Ok(WorkerPort {
        outbox: to_worker,
        inbox: from_worker,
        handler: None,
        terminate,
        thread: Some(thread),
    })
}

fn run_worker(id: WorkerId, config: RuntimeConfig, seed: WorkerSeed, entry: WorkerEntry) {
    let mut rt = Runtime::for_worker(config, seed);

    if let Err(err) = entry(&mut rt) {
        tracing::warn!(worker = %id, error = %err, "worker entry failed");
    }

    match rt.run() {
        Ok(()) => tracing::debug!(worker = %id, "worker loop finished"),
        Err(err) => tracing::warn!(worker = %id, error = %err, "worker loop failed"),
    }
}
