//! Message ports
//!
//! One direction of a worker channel: an unbounded crossbeam queue plus a
//! wake pipe the receiving loop polls. The sender pushes the message first
//! and writes the wake byte second, so a receiver that drains the pipe and
//! then reads the queue length never misses a message.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use super::clone::SerializedMessage;
use crate::os::{self, SysResult};

/// Shared between both ends of one direction
struct Wake {
    read_fd: RawFd,
    write_fd: RawFd,
    /// Set once the sending end is gone
    closed: AtomicBool,
}

impl Wake {
    fn new() -> SysResult<Self> {
        let (read_fd, write_fd) = os::pipe()?;
        let wake = Self {
            read_fd,
            write_fd,
            closed: AtomicBool::new(false),
        };
        for fd in [read_fd, write_fd] {
            os::set_nonblocking(fd)?;
            os::set_cloexec(fd)?;
        }
        Ok(wake)
    }

    fn notify(&self) {
        // A full pipe already guarantees a wake-up
        let _ = os::write(self.write_fd, &[1]);
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        while matches!(os::read(self.read_fd, &mut buf), Ok(n) if n > 0) {}
    }
}

impl Drop for Wake {
    fn drop(&mut self) {
        let _ = os::close(self.read_fd);
        let _ = os::close(self.write_fd);
    }
}

/// Create one direction of a channel
pub(crate) fn channel() -> SysResult<(Outbox, Inbox)> {
    let wake = Arc::new(Wake::new()?);
    let (tx, rx) = unbounded();
    Ok((
        Outbox {
            tx: Some(tx),
            wake: Arc::clone(&wake),
        },
        Inbox { rx, wake },
    ))
}

/// Sending end
pub(crate) struct Outbox {
    tx: Option<Sender<SerializedMessage>>,
    wake: Arc<Wake>,
}

impl Outbox {
    /// Queue a message. Returns false when the receiving end is gone.
    pub fn send(&self, message: SerializedMessage) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if tx.send(message).is_err() {
            return false;
        }
        self.wake.notify();
        true
    }

    /// Wake the receiver without sending anything
    pub fn nudge(&self) {
        self.wake.notify();
    }
}

impl Drop for Outbox {
    fn drop(&mut self) {
        // Disconnect before waking so the receiver observes it
        self.tx.take();
        self.wake.closed.store(true, Ordering::Release);
        self.wake.notify();
    }
}

/// Receiving end
pub(crate) struct Inbox {
    rx: Receiver<SerializedMessage>,
    wake: Arc<Wake>,
}

impl Inbox {
    /// Descriptor that becomes readable when a message or a disconnect
    /// arrives
    pub fn wake_fd(&self) -> RawFd {
        self.wake.read_fd
    }

    pub fn drain_wake(&self) {
        self.wake.drain();
    }

    pub fn try_recv(&self) -> Option<SerializedMessage> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Messages currently queued
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Whether the sending end still exists
    pub fn is_connected(&self) -> bool {
        !self.wake.closed.load(Ordering::Acquire)
    }
}
