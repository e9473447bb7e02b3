//! `InlinePort`: poll(2)-driven `CompletionPort` for hosts without io_uring.
//!
//! Each operation is tried once at push time, the way an overlapped call
//! starts immediately. Whatever happens, the result is queued and only
//! leaves through `wait()`, with two exceptions that are refused at push:
//! a descriptor-level error (bad fd, not a socket, bad argument) and an
//! opcode the port does not know.
//!
//! Operations that would block park on their descriptor; `wait()` polls
//! every parked descriptor and retries the ones that became ready. A
//! descriptor closed under a parked operation completes it with EBADF.
//!
//! Scratch handles are synthetic. Opcodes can be marked unsupported, and
//! scratch open/close counts are observable, which is what resolver tests
//! are built on.

use crate::context::errno;

use cport_core::config::EngineConfig;
use cport_core::entry::{op, Completion, OpEntry, Token};
use cport_core::error::{CportError, Result};
use cport_core::port::{CompletionPort, ScratchProbe};
use cport_core::ktrace;

use nix::fcntl::{fcntl, FcntlArg, OFlag};

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const KNOWN: [u8; 7] = [op::NOP, op::READ, op::WRITE, op::RECVMSG, op::SENDMSG, op::ACCEPT, op::CONNECT];

struct Parked {
    entry: OpEntry,
    /// Non-blocking connect in progress; finish via SO_ERROR.
    connecting: bool,
}

pub struct InlinePort {
    ready: VecDeque<Completion>,
    parked: Vec<Parked>,
    capacity: usize,
    unsupported: Vec<u8>,
    scratch_fails: bool,
    scratch_opened: Arc<AtomicUsize>,
    scratch_closed: Arc<AtomicUsize>,
}

impl InlinePort {
    pub fn new(capacity: usize) -> Self {
        Self {
            ready: VecDeque::new(),
            parked: Vec::new(),
            capacity,
            unsupported: Vec::new(),
            scratch_fails: false,
            scratch_opened: Arc::new(AtomicUsize::new(0)),
            scratch_closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.sq_entries as usize)
    }

    /// Report `opcode` as unsupported from scratch probes.
    pub fn without_opcode(mut self, opcode: u8) -> Self {
        self.unsupported.push(opcode);
        self
    }

    /// Make `open_scratch` fail with EMFILE.
    pub fn failing_scratch(mut self) -> Self {
        self.scratch_fails = true;
        self
    }

    /// `(opened, closed)` scratch-handle counters.
    pub fn scratch_counters(&self) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::clone(&self.scratch_opened), Arc::clone(&self.scratch_closed))
    }

    fn complete(&mut self, token: Token, result: i64) {
        ktrace!("inline complete token={} result={}", token, result);
        self.ready.push_back(Completion { token, result, flags: 0 });
    }

    fn park(&mut self, entry: OpEntry, connecting: bool) {
        self.parked.push(Parked { entry, connecting });
    }

    fn start_connect(&mut self, entry: &OpEntry) -> Result<()> {
        let a = &entry.args;
        let fd = entry.fd();
        let rc = with_nonblocking(fd, || {
            check(unsafe {
                libc::connect(fd, a[1] as *const libc::sockaddr, a[2] as libc::socklen_t)
            } as isize)
        });
        match rc {
            Ok(_) => self.complete(entry.token, 0),
            Err(e) if e == libc::EINPROGRESS || e == libc::EAGAIN => self.park(*entry, true),
            Err(e) if refused_at_push(e) => return Err(CportError::System(e)),
            Err(e) => self.complete(entry.token, -(e as i64)),
        }
        Ok(())
    }

    /// Retry parked operations whose descriptors polled ready.
    fn progress(&mut self, fds: &[libc::pollfd]) {
        let parked = std::mem::take(&mut self.parked);
        for (p, pfd) in parked.into_iter().zip(fds) {
            if pfd.revents == 0 {
                self.parked.push(p);
                continue;
            }
            if pfd.revents & libc::POLLNVAL != 0 {
                self.complete(p.entry.token, -(libc::EBADF as i64));
                continue;
            }
            if p.connecting {
                let err = so_error(p.entry.fd());
                self.complete(p.entry.token, -(err as i64));
                continue;
            }
            match attempt(&p.entry) {
                Some(r) => self.complete(p.entry.token, r),
                None => self.parked.push(p),
            }
        }
    }
}

impl CompletionPort for InlinePort {
    type Scratch = InlineScratch;

    fn name(&self) -> &'static str {
        "inline"
    }

    fn associate(&mut self, _fd: RawFd) -> Result<()> {
        Ok(())
    }

    fn push(&mut self, entry: &OpEntry) -> Result<()> {
        if !KNOWN.contains(&entry.opcode) {
            return Err(CportError::System(libc::EINVAL));
        }
        if entry.opcode == op::NOP {
            self.complete(entry.token, 0);
            return Ok(());
        }
        let fd = entry.fd();
        if fd < 0 {
            return Err(CportError::System(libc::EBADF));
        }
        if entry.opcode == op::CONNECT {
            return self.start_connect(entry);
        }

        let revents = poll_one(fd, interest(entry.opcode));
        if revents & libc::POLLNVAL != 0 {
            return Err(CportError::System(libc::EBADF));
        }
        if revents == 0 {
            self.park(*entry, false);
            return Ok(());
        }
        match attempt(entry) {
            Some(r) if r < 0 && refused_at_push((-r) as i32) => {
                return Err(CportError::System((-r) as i32));
            }
            Some(r) => self.complete(entry.token, r),
            None => self.park(*entry, false),
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<usize> {
        Ok(0)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Completion>> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if let Some(c) = self.ready.pop_front() {
                return Ok(Some(c));
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if self.parked.is_empty() {
                // Nothing can ever complete.
                return match remaining {
                    Some(r) => {
                        std::thread::sleep(r);
                        Ok(None)
                    }
                    None => Err(CportError::System(libc::EDEADLK)),
                };
            }

            let mut fds: Vec<libc::pollfd> = self
                .parked
                .iter()
                .map(|p| libc::pollfd {
                    fd: p.entry.fd(),
                    events: interest(p.entry.opcode),
                    revents: 0,
                })
                .collect();
            let ms = remaining.map_or(-1, ceil_ms);
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ms) };
            if rc < 0 {
                let e = errno();
                if e != libc::EINTR {
                    return Err(CportError::System(e));
                }
                if deadline.is_some() {
                    return Ok(None);
                }
                continue;
            }
            if rc > 0 {
                self.progress(&fds);
            } else if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
        }
    }

    fn open_scratch(&self) -> Result<InlineScratch> {
        if self.scratch_fails {
            return Err(CportError::SystemResource { what: "scratch handle", errno: libc::EMFILE });
        }
        self.scratch_opened.fetch_add(1, Ordering::SeqCst);
        Ok(InlineScratch {
            unsupported: self.unsupported.clone(),
            closed: Arc::clone(&self.scratch_closed),
        })
    }

    fn inflight(&self) -> usize {
        self.ready.len() + self.parked.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn shutdown(&mut self) {
        self.ready.clear();
        self.parked.clear();
    }
}

pub struct InlineScratch {
    unsupported: Vec<u8>,
    closed: Arc<AtomicUsize>,
}

impl ScratchProbe for InlineScratch {
    fn supports(&self, opcode: u8) -> bool {
        KNOWN.contains(&opcode) && !self.unsupported.contains(&opcode)
    }
}

impl Drop for InlineScratch {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ── syscall helpers ──

/// Errors that mean the request itself is unusable.
fn refused_at_push(errno: i32) -> bool {
    matches!(
        errno,
        libc::EBADF | libc::ENOTSOCK | libc::EINVAL | libc::EFAULT | libc::EOPNOTSUPP | libc::EAFNOSUPPORT
    )
}

fn interest(opcode: u8) -> i16 {
    match opcode {
        op::WRITE | op::SENDMSG | op::CONNECT => libc::POLLOUT,
        _ => libc::POLLIN,
    }
}

fn poll_one(fd: RawFd, events: i16) -> i16 {
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc <= 0 {
        0
    } else {
        pfd.revents
    }
}

fn ceil_ms(d: Duration) -> i32 {
    let ms = d.as_nanos().div_ceil(1_000_000);
    ms.min(i32::MAX as u128) as i32
}

#[inline]
fn check(rc: isize) -> std::result::Result<i64, i32> {
    if rc < 0 {
        Err(errno())
    } else {
        Ok(rc as i64)
    }
}

/// Run `f` with O_NONBLOCK set on `fd`, restoring the original flags.
fn with_nonblocking<T>(fd: RawFd, f: impl FnOnce() -> T) -> T {
    let saved = fcntl(fd, FcntlArg::F_GETFL).ok().map(OFlag::from_bits_truncate);
    let toggled = match saved {
        Some(fl) if !fl.contains(OFlag::O_NONBLOCK) => {
            fcntl(fd, FcntlArg::F_SETFL(fl | OFlag::O_NONBLOCK)).is_ok()
        }
        _ => false,
    };
    let out = f();
    if let (true, Some(fl)) = (toggled, saved) {
        let _ = fcntl(fd, FcntlArg::F_SETFL(fl));
    }
    out
}

/// One non-blocking attempt. `None` = would block.
fn attempt(entry: &OpEntry) -> Option<i64> {
    let a = &entry.args;
    let fd = entry.fd();
    let rc = match entry.opcode {
        op::READ => with_nonblocking(fd, || {
            check(unsafe { libc::read(fd, a[1] as *mut libc::c_void, a[2] as usize) })
        }),
        op::WRITE => with_nonblocking(fd, || {
            check(unsafe { libc::write(fd, a[1] as *const libc::c_void, a[2] as usize) })
        }),
        op::RECVMSG => check(unsafe {
            libc::recvmsg(fd, a[1] as *mut libc::msghdr, a[2] as i32 | libc::MSG_DONTWAIT)
        }),
        op::SENDMSG => check(unsafe {
            libc::sendmsg(
                fd,
                a[1] as *const libc::msghdr,
                a[2] as i32 | libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        }),
        op::ACCEPT => with_nonblocking(fd, || {
            check(unsafe {
                libc::accept4(fd, a[1] as *mut libc::sockaddr, a[2] as *mut libc::socklen_t, a[3] as i32)
            } as isize)
        }),
        _ => Err(libc::EINVAL),
    };
    match rc {
        Ok(n) => Some(n),
        Err(e) if e == libc::EAGAIN || e == libc::EWOULDBLOCK || e == libc::EINTR => None,
        Err(e) => Some(-(e as i64)),
    }
}

fn so_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        errno()
    } else {
        err
    }
}
