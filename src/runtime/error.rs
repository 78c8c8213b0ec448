use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::os::Errno;
use crate::worker::{CloneError, WorkerId};

/// Errors from runtime operations that are not plain OS results
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("descriptor {0} is not open")]
    InvalidDescriptor(RawFd),

    #[error("{operation} is only available on the main context")]
    MainContextOnly { operation: &'static str },

    #[error("message could not be cloned: {0}")]
    Clone(#[from] CloneError),

    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] io::Error),

    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),

    #[error(transparent)]
    Os(#[from] Errno),
}
