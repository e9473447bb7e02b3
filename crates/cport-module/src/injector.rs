//! `Injector`: run a callback on the pump thread from any thread.
//!
//! Posting pushes onto a lock-free queue and bumps an eventfd. The engine
//! keeps one READ armed on that eventfd, so a pump blocked without a
//! timeout wakes up, drains the queue and dispatches each posted callback
//! with `(0, 0)`. Several posts before the pump runs coalesce into a
//! single wakeup (eventfd counter semantics).

use cport_core::entry::Callback;
use cport_core::error::{CportError, Result};

use crossbeam_queue::SegQueue;
use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};

use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Shared {
    queue: SegQueue<Callback>,
    // Blocking on purpose: io_uring completes a READ on an O_NONBLOCK
    // file with -EAGAIN instead of waiting for data.
    wake: EventFd,
    closed: AtomicBool,
}

/// Cloneable, `Send + Sync` handle for posting work to an engine.
#[derive(Clone)]
pub struct Injector {
    shared: Arc<Shared>,
}

impl Injector {
    pub(crate) fn new() -> Result<Self> {
        let wake = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC).map_err(|e| {
            CportError::SystemResource { what: "eventfd", errno: e as i32 }
        })?;
        Ok(Self {
            shared: Arc::new(Shared {
                queue: SegQueue::new(),
                wake,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Queue `f` to run on the pump thread with `(0, 0)`.
    ///
    /// Fails once the engine has shut down; `f` is dropped unrun.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(i32, u32) + Send + 'static,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CportError::InvalidArgument("engine has shut down"));
        }
        self.shared.queue.push(Box::new(f));
        self.wake()
    }

    /// Callbacks posted and not yet run.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    pub(crate) fn pop(&self) -> Option<Callback> {
        self.shared.queue.pop()
    }

    pub(crate) fn wake(&self) -> Result<()> {
        match self.shared.wake.write(1) {
            Ok(_) => Ok(()),
            // Counter saturated: a wakeup is already pending.
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(CportError::System(e as i32)),
        }
    }

    pub(crate) fn wake_fd(&self) -> RawFd {
        self.shared.wake.as_fd().as_raw_fd()
    }

    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Injector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injector")
            .field("pending", &self.pending())
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish()
    }
}
