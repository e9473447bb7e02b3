//! `UringPort`: default `CompletionPort` implementation.
//!
//! Uses `io_uring_enter()` for submission and blocking waits.
//! No SQPOLL, no fixed files, no fixed buffers.
//!
//! Timed waits use `IORING_ENTER_EXT_ARG` when the kernel advertises it
//! (5.11+). Older kernels get an internal TIMEOUT SQE per timed wait;
//! its completion carries an internal token and is swallowed here.

use cport_core::config::EngineConfig;
use cport_core::entry::{op, Completion, OpEntry, Token};
use cport_core::error::{CportError, Result};
use cport_core::port::{CompletionPort, ScratchProbe};
use cport_core::{kdebug, ktrace};

use io_uring::{opcode, types, IoUring};

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

pub struct UringPort {
    ring: IoUring,
    /// User entries pushed and not yet reaped.
    inflight: usize,
    /// SQEs queued since the last io_uring_enter.
    pending_submit: u32,
    ext_arg: bool,
    /// Fallback timeouts in flight, keyed by internal sequence.
    timeouts: HashMap<u64, Box<types::Timespec>>,
    next_internal: u64,
}

impl UringPort {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let mut builder = IoUring::builder();
        if let Some(cq) = config.cq_entries {
            builder.setup_cqsize(cq);
        }
        let ring = builder
            .build(config.sq_entries)
            .map_err(|e| resource("io_uring_setup", &e))?;
        let ext_arg = ring.params().is_feature_ext_arg();
        kdebug!(
            "io_uring up: fd={} sq={} cq={} ext_arg={}",
            ring.as_raw_fd(),
            ring.params().sq_entries(),
            ring.params().cq_entries(),
            ext_arg
        );

        Ok(Self {
            ring,
            inflight: 0,
            pending_submit: 0,
            ext_arg,
            timeouts: HashMap::new(),
            next_internal: 0,
        })
    }

    /// The ring descriptor.
    pub fn fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }

    /// Build an SQE from an engine entry.
    ///
    /// `args` follow the syscall ABI order documented on [`OpEntry`].
    fn build_sqe(entry: &OpEntry) -> Result<io_uring::squeue::Entry> {
        let a = &entry.args;
        let fd = types::Fd(a[0] as i32);

        let sqe = match entry.opcode {
            // read(fd, buf, count) → READ(fd, buf, len, offset=-1)
            op::READ => opcode::Read::new(fd, a[1] as *mut u8, a[2] as u32)
                .offset(u64::MAX)
                .build(),
            // write(fd, buf, count) → WRITE(fd, buf, len, offset=-1)
            op::WRITE => opcode::Write::new(fd, a[1] as *const u8, a[2] as u32)
                .offset(u64::MAX)
                .build(),
            // recvmsg(sockfd, msg, flags)
            op::RECVMSG => opcode::RecvMsg::new(fd, a[1] as *mut libc::msghdr)
                .flags(a[2] as u32)
                .build(),
            // sendmsg(sockfd, msg, flags)
            op::SENDMSG => opcode::SendMsg::new(fd, a[1] as *const libc::msghdr)
                .flags(a[2] as u32)
                .build(),
            // accept4(sockfd, addr, addrlen, flags)
            op::ACCEPT => {
                opcode::Accept::new(fd, a[1] as *mut libc::sockaddr, a[2] as *mut libc::socklen_t)
                    .flags(a[3] as i32)
                    .build()
            }
            // connect(sockfd, addr, addrlen)
            op::CONNECT => {
                opcode::Connect::new(fd, a[1] as *const libc::sockaddr, a[2] as libc::socklen_t)
                    .build()
            }
            op::NOP => opcode::Nop::new().build(),
            _ => return Err(CportError::System(libc::EINVAL)),
        };

        Ok(sqe.user_data(entry.token.0))
    }

    fn push_sqe(&mut self, sqe: &io_uring::squeue::Entry) -> Result<()> {
        for attempt in 0..2 {
            // Safety: every pointer in the SQE refers to memory the engine
            // keeps alive until the matching CQE is reaped.
            let pushed = unsafe { self.ring.submission().push(sqe).is_ok() };
            if pushed {
                self.pending_submit += 1;
                return Ok(());
            }
            if attempt == 0 {
                self.flush()?;
            }
        }
        Err(CportError::System(libc::EBUSY))
    }

    /// Next user completion already in the CQ, swallowing internal ones.
    ///
    /// Returns `(completion, fired)` where `fired` is set if the timeout
    /// SQE with sequence `watch` completed while reaping.
    fn reap(&mut self, watch: Option<u64>) -> (Option<Completion>, bool) {
        let mut fired = false;
        loop {
            let cqe = self.ring.completion().next();
            let Some(cqe) = cqe else { return (None, fired) };
            let token = Token(cqe.user_data());
            if token.is_internal() {
                let seq = token.0 & !Token::INTERNAL_BIT;
                self.timeouts.remove(&seq);
                if Some(seq) == watch {
                    fired = true;
                }
                continue;
            }
            self.inflight = self.inflight.saturating_sub(1);
            return (
                Some(Completion { token, result: cqe.result() as i64, flags: cqe.flags() }),
                fired,
            );
        }
    }

    fn enter(&mut self, want: usize) -> io::Result<()> {
        let n = self.ring.submit_and_wait(want)?;
        self.note_submitted(n);
        Ok(())
    }

    fn note_submitted(&mut self, n: usize) {
        self.pending_submit = self.pending_submit.saturating_sub(n as u32);
    }

    fn wait_ext_arg(&mut self, remaining: Duration) -> Result<()> {
        let ts = timespec(remaining);
        let args = types::SubmitArgs::new().timespec(&ts);
        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(n) => {
                self.note_submitted(n);
                Ok(())
            }
            Err(e) if matches!(e.raw_os_error(), Some(libc::ETIME) | Some(libc::EINTR)) => Ok(()),
            Err(e) => Err(CportError::System(e.raw_os_error().unwrap_or(libc::EIO))),
        }
    }

    /// Arm an internal TIMEOUT that fires after `remaining` or after one
    /// other completion, whichever comes first.
    fn arm_timeout(&mut self, remaining: Duration) -> Result<u64> {
        let seq = self.next_internal;
        self.next_internal += 1;
        let ts = Box::new(timespec(remaining));
        let sqe = opcode::Timeout::new(&*ts as *const types::Timespec)
            .count(1)
            .build()
            .user_data(Token::internal(seq).0);
        self.timeouts.insert(seq, ts);
        if let Err(e) = self.push_sqe(&sqe) {
            self.timeouts.remove(&seq);
            return Err(e);
        }
        Ok(seq)
    }
}

impl CompletionPort for UringPort {
    type Scratch = UringScratch;

    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn associate(&mut self, _fd: RawFd) -> Result<()> {
        // io_uring needs no per-descriptor registration.
        Ok(())
    }

    fn push(&mut self, entry: &OpEntry) -> Result<()> {
        let sqe = Self::build_sqe(entry)?;
        self.push_sqe(&sqe)?;
        self.inflight += 1;
        ktrace!("uring push token={} opcode={}", entry.token, entry.opcode);
        Ok(())
    }

    fn flush(&mut self) -> Result<usize> {
        if self.pending_submit == 0 {
            return Ok(0);
        }
        match self.ring.submit() {
            Ok(n) => {
                self.note_submitted(n);
                Ok(n)
            }
            // CQ overflow backpressure or a signal: retried by the next wait.
            Err(e) if matches!(e.raw_os_error(), Some(libc::EBUSY) | Some(libc::EAGAIN) | Some(libc::EINTR)) => {
                Ok(0)
            }
            Err(e) => Err(CportError::System(e.raw_os_error().unwrap_or(libc::EIO))),
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<Completion>> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut armed: Option<u64> = None;

        loop {
            let (done, fired) = self.reap(armed);
            if done.is_some() {
                return Ok(done);
            }
            if fired {
                return Ok(None);
            }

            let Some(deadline) = deadline else {
                match self.enter(1) {
                    Ok(()) => continue,
                    Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                    Err(e) => return Err(CportError::System(e.raw_os_error().unwrap_or(libc::EIO))),
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Kick anything still queued so it is not stranded.
                self.flush()?;
                return Ok(self.reap(armed).0);
            }

            if self.ext_arg {
                self.wait_ext_arg(remaining)?;
                if Instant::now() >= deadline {
                    return Ok(self.reap(None).0);
                }
                continue;
            }

            if armed.is_none() {
                armed = Some(self.arm_timeout(remaining)?);
            }
            match self.enter(1) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => return Ok(self.reap(armed).0),
                Err(e) => return Err(CportError::System(e.raw_os_error().unwrap_or(libc::EIO))),
            }
        }
    }

    fn open_scratch(&self) -> Result<UringScratch> {
        let ring = IoUring::new(2).map_err(|e| resource("scratch io_uring_setup", &e))?;
        let mut probe = io_uring::Probe::new();
        ring.submitter()
            .register_probe(&mut probe)
            .map_err(|e| resource("IORING_REGISTER_PROBE", &e))?;
        Ok(UringScratch { _ring: ring, probe })
    }

    fn inflight(&self) -> usize {
        self.inflight
    }

    fn capacity(&self) -> usize {
        self.ring.params().sq_entries() as usize
    }

    fn shutdown(&mut self) {
        // Drain whatever already completed; the ring's own Drop closes
        // the fd and unmaps SQ/CQ.
        while self.reap(None).0.is_some() {}
        self.inflight = 0;
        self.pending_submit = 0;
    }
}

/// A throwaway ring used once to probe opcode support.
///
/// Dropping it closes the ring fd.
pub struct UringScratch {
    _ring: IoUring,
    probe: io_uring::Probe,
}

impl ScratchProbe for UringScratch {
    fn supports(&self, opcode: u8) -> bool {
        self.probe.is_supported(opcode)
    }
}

fn timespec(d: Duration) -> types::Timespec {
    types::Timespec::new().sec(d.as_secs()).nsec(d.subsec_nanos())
}

fn resource(what: &'static str, e: &io::Error) -> CportError {
    CportError::SystemResource { what, errno: e.raw_os_error().unwrap_or(libc::EIO) }
}
