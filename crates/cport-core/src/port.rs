//! Completion port abstraction.
//!
//! A `CompletionPort` owns one OS completion queue. The engine hands it
//! fully-built [`OpEntry`]s and later asks it for completion records.
//!
//! # Implementors
//!
//! - `UringPort` (default): io_uring. Every accepted SQE posts exactly
//!   one CQE, so nothing ever completes inline.
//!
//! - `InlinePort`: poll(2)-driven emulation for kernels or sandboxes
//!   without io_uring. Tries each operation eagerly at push time, the
//!   way an overlapped call does; anything not ready stays pending until
//!   its descriptor polls ready. Successful results are still queued and
//!   only reach the caller through `wait`.

use std::os::fd::RawFd;
use std::time::Duration;

use crate::entry::{Completion, OpEntry};
use crate::error::Result;

/// A short-lived handle used once at engine init to query which
/// extension operations the platform offers.
///
/// **Contract:** dropping the probe closes the scratch handle. The
/// resolver drops it on every path, success or failure.
pub trait ScratchProbe {
    /// Whether `opcode` is usable on this platform.
    fn supports(&self, opcode: u8) -> bool;
}

/// One OS completion queue.
///
/// **Contract:**
/// - `push()` either accepts the entry, in which case exactly one
///   completion carrying `entry.token` will eventually come out of
///   `wait()`, or rejects it with the OS errno and forgets it.
/// - `push()` and `flush()` never block.
/// - `wait()` is the only blocking call. It returns at most one
///   completion per call; `Ok(None)` means the timeout elapsed.
/// - Internal bookkeeping entries (tokens with the internal bit) are
///   consumed by the port and never returned from `wait()`.
pub trait CompletionPort: Send {
    type Scratch: ScratchProbe;

    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Register a descriptor with the queue. Idempotent.
    fn associate(&mut self, fd: RawFd) -> Result<()>;

    /// Hand one operation to the OS.
    fn push(&mut self, entry: &OpEntry) -> Result<()>;

    /// Kick queued entries to the kernel. Returns how many were taken.
    fn flush(&mut self) -> Result<usize>;

    /// Block up to `timeout` (`None` = forever) for the next completion.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Completion>>;

    /// Open a scratch handle for extension probing.
    fn open_scratch(&self) -> Result<Self::Scratch>;

    /// Operations accepted but not yet retrieved.
    fn inflight(&self) -> usize;

    /// Maximum number of entries that can be queued before a flush.
    fn capacity(&self) -> usize;

    /// Release the queue. Outstanding operations must already be drained
    /// or deliberately leaked by the caller.
    fn shutdown(&mut self);
}
