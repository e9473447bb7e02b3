//! Operation contexts and the slab that owns them.
//!
//! A context is everything one in-flight operation needs to stay alive:
//! the callback, the leased buffers, and any kernel-visible structure
//! (`msghdr`, `sockaddr`) an opcode points at. The kernel only ever sees
//! the context's [`Token`]; recovery on completion is a slab lookup.
//!
//! Lifecycle: `insert` at submit → (kernel owns the pointers) →
//! `take` in the pump → fixups → leases dropped → callback → context dropped.

use crate::addr_codec::{self, SockAddr, ADDR_HEADER};
use crate::buffer::BufferLease;

use cport_core::entry::{Callback, OpKind, Token};

use std::os::fd::RawFd;

/// `msghdr` and its single `iovec`, boxed together so `msg_iov` can point
/// into the same allocation.
pub(crate) struct MsgParts {
    pub hdr: libc::msghdr,
    pub iov: libc::iovec,
}

impl MsgParts {
    /// Boxed message over `data[..len]`, with an optional name buffer.
    pub fn boxed(
        data: *mut u8,
        len: usize,
        name: *mut libc::c_void,
        namelen: libc::socklen_t,
    ) -> Box<Self> {
        let mut parts = Box::new(MsgParts {
            hdr: unsafe { std::mem::zeroed() },
            iov: libc::iovec { iov_base: data as *mut libc::c_void, iov_len: len },
        });
        parts.hdr.msg_name = name;
        parts.hdr.msg_namelen = namelen;
        parts.hdr.msg_iov = &mut parts.iov;
        parts.hdr.msg_iovlen = 1;
        parts
    }

    #[inline]
    pub fn hdr_ptr(&mut self) -> *mut libc::msghdr {
        &mut self.hdr
    }
}

/// Memory the kernel may touch until the completion is retrieved.
pub(crate) enum Pinned {
    Nothing,
    Buffer(BufferLease),
    RecvFrom {
        msg: Box<MsgParts>,
        _data: BufferLease,
        addr: BufferLease,
    },
    SendTo {
        _msg: Box<MsgParts>,
        _data: BufferLease,
        _dest: Box<SockAddr>,
    },
    Accept {
        peer: Box<SockAddr>,
        output: BufferLease,
        accept_fd: RawFd,
    },
    Connect {
        _dest: Box<SockAddr>,
    },
}

// The raw pointers inside point at heap memory owned by this same value.
unsafe impl Send for Pinned {}

pub(crate) struct OperationContext {
    pub kind: OpKind,
    pub fd: RawFd,
    pub callback: Callback,
    pub pinned: Pinned,
}

impl OperationContext {
    pub fn new(kind: OpKind, fd: RawFd, callback: Callback, pinned: Pinned) -> Self {
        Self { kind, fd, callback, pinned }
    }

    /// Post-completion fixups. Returns the result the callback should see.
    ///
    /// - receive-from: record the kernel-written name length in the
    ///   address-buffer header.
    /// - accept: move the new connection onto the caller's accept handle
    ///   and fill both address halves. Bytes transferred becomes 0.
    pub fn finish(&mut self, result: i64) -> i64 {
        match &mut self.pinned {
            Pinned::RecvFrom { msg, addr, .. } => {
                let len = if result >= 0 { msg.hdr.msg_namelen as usize } else { 0 };
                addr_codec::set_half_len(addr.bytes_mut(), len);
                result
            }
            Pinned::Accept { peer, output, accept_fd } => {
                if result < 0 {
                    clear_halves(output.bytes_mut());
                    return result;
                }
                finish_accept(result as RawFd, *accept_fd, peer, output.bytes_mut())
            }
            _ => result,
        }
    }
}

fn finish_accept(newfd: RawFd, accept_fd: RawFd, peer: &SockAddr, out: &mut [u8]) -> i64 {
    let rc = unsafe { libc::dup3(newfd, accept_fd, libc::O_CLOEXEC) };
    let err = if rc < 0 { errno() } else { 0 };
    unsafe { libc::close(newfd) };
    if err != 0 {
        clear_halves(out);
        return -(err as i64);
    }

    let half = out.len() / 2;
    let (local_half, remote_half) = out.split_at_mut(half);
    let local = SockAddr::local_of(accept_fd);
    addr_codec::write_half(local_half, local.as_ref());
    addr_codec::write_half(remote_half, Some(peer));
    0
}

/// Mark both accept halves empty so a reused buffer never decodes stale peers.
fn clear_halves(out: &mut [u8]) {
    let (local, remote) = out.split_at_mut(out.len() / 2);
    addr_codec::write_half(local, None);
    addr_codec::write_half(remote, None);
}

#[inline]
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

struct Slot {
    generation: u32,
    ctx: Option<OperationContext>,
}

/// Owns every live operation context.
///
/// Freed slots go on a LIFO stack for reuse; each reuse bumps the slot's
/// generation so a stale token can never reach the new occupant.
#[derive(Default)]
pub(crate) struct ContextSlab {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl ContextSlab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ctx: OperationContext) -> Token {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.ctx = Some(ctx);
            return Token::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, ctx: Some(ctx) });
        Token::new(index, 0)
    }

    /// Remove and return the context named by `token`.
    ///
    /// `None` for internal tokens, out-of-range indices, stale
    /// generations and already-taken slots.
    pub fn take(&mut self, token: Token) -> Option<OperationContext> {
        if token.is_internal() {
            return None;
        }
        let index = token.index();
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != token.generation() {
            return None;
        }
        let ctx = slot.ctx.take()?;
        slot.generation = Token::new(0, slot.generation.wrapping_add(1)).generation();
        self.free.push(index);
        self.live -= 1;
        Some(ctx)
    }

    #[inline]
    pub fn contains(&self, token: Token) -> bool {
        !token.is_internal()
            && self
                .slots
                .get(token.index() as usize)
                .is_some_and(|s| s.generation == token.generation() && s.ctx.is_some())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Forget every live context without running or dropping it.
    ///
    /// Leases and boxed kernel structures stay allocated forever, so a
    /// kernel still holding their addresses never writes to freed memory.
    pub fn leak_all(&mut self) -> usize {
        let mut leaked = 0;
        for slot in &mut self.slots {
            if let Some(ctx) = slot.ctx.take() {
                std::mem::forget(ctx);
                leaked += 1;
            }
        }
        self.live = 0;
        leaked
    }
}
