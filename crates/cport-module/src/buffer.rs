//! `IoBuffer`: shared, fixed-capacity byte buffer for overlapped I/O.
//!
//! The kernel writes into (or reads from) the buffer while an operation
//! is in flight, so the caller must not touch it during that window.
//! The buffer carries a small state machine enforcing exactly that:
//!
//! ```text
//!   IDLE ──lease()──> LENT ──(completion retrieved)──> IDLE
//!   IDLE ──with()───> BORROWED ──(closure returns)───> IDLE
//! ```
//!
//! A submit on a buffer that is not IDLE fails `InvalidArgument`.
//! Reads through `with`/`to_vec` return `None` while the buffer is LENT.

use cport_core::error::{CportError, Result};

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const IDLE: u8 = 0;
const LENT: u8 = 1;
const BORROWED: u8 = 2;

struct BufInner {
    data: UnsafeCell<Box<[u8]>>,
    state: AtomicU8,
}

// Access to `data` is serialized by `state`.
unsafe impl Send for BufInner {}
unsafe impl Sync for BufInner {}

/// A heap buffer that can be lent to one in-flight operation at a time.
///
/// Cloning is cheap and shares the same storage.
#[derive(Clone)]
pub struct IoBuffer {
    inner: Arc<BufInner>,
}

impl IoBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BufInner {
                data: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
                state: AtomicU8::new(IDLE),
            }),
        }
    }

    /// A buffer pre-filled with `bytes`; capacity = `bytes.len()`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            inner: Arc::new(BufInner {
                data: UnsafeCell::new(bytes.to_vec().into_boxed_slice()),
                state: AtomicU8::new(IDLE),
            }),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        // Length never changes after construction.
        unsafe { (&*self.inner.data.get()).len() }
    }

    /// True while an operation holds the buffer.
    #[inline]
    pub fn is_lent(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == LENT
    }

    /// Read access. `None` if the buffer is lent or borrowed elsewhere.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let _guard = self.borrow()?;
        Some(f(unsafe { &*self.inner.data.get() }))
    }

    /// Write access. `None` if the buffer is lent or borrowed elsewhere.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let _guard = self.borrow()?;
        Some(f(unsafe { &mut *self.inner.data.get() }))
    }

    /// Copy of the contents, or `None` while lent.
    pub fn to_vec(&self) -> Option<Vec<u8>> {
        self.with(|b| b.to_vec())
    }

    /// Copy `src` into the front of the buffer. Returns bytes copied.
    pub fn fill(&self, src: &[u8]) -> Option<usize> {
        self.with_mut(|dst| {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
            n
        })
    }

    /// Lend the buffer to an operation.
    pub(crate) fn lease(&self) -> Result<BufferLease> {
        self.inner
            .state
            .compare_exchange(IDLE, LENT, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CportError::InvalidArgument("buffer already in flight"))?;
        Ok(BufferLease { inner: Arc::clone(&self.inner) })
    }

    fn borrow(&self) -> Option<BorrowGuard<'_>> {
        self.inner
            .state
            .compare_exchange(IDLE, BORROWED, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(BorrowGuard { state: &self.inner.state })
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("capacity", &self.capacity())
            .field("lent", &self.is_lent())
            .finish()
    }
}

struct BorrowGuard<'a> {
    state: &'a AtomicU8,
}

impl Drop for BorrowGuard<'_> {
    fn drop(&mut self) {
        self.state.store(IDLE, Ordering::Release);
    }
}

/// Exclusive hold on an `IoBuffer` for the lifetime of one operation.
///
/// Keeps the storage alive even if every `IoBuffer` handle is dropped,
/// which is what makes leaking a context on shutdown safe.
pub(crate) struct BufferLease {
    inner: Arc<BufInner>,
}

impl BufferLease {
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { (&mut *self.inner.data.get()).as_mut_ptr() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        unsafe { (&*self.inner.data.get()).len() }
    }

    /// Engine-side access after the kernel has finished with the memory.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { &mut *self.inner.data.get() }
    }
}

impl std::fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLease").field("len", &self.len()).finish()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.inner.state.store(IDLE, Ordering::Release);
    }
}
