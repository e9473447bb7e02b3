//! Operation submitters.
//!
//! Every submitter follows the same contract:
//!
//! 1. Validate (length, buffer capacity, buffer state, address). On error
//!    return `InvalidArgument`/`UnsupportedAddressFamily`; nothing is
//!    allocated and the callback is dropped unrun.
//! 2. Associate the descriptor with the queue (idempotent).
//! 3. Move the callback and every kernel-visible structure into a new
//!    context; the slab hands back its token.
//! 4. Push the entry. If the port refuses it, the context is dropped
//!    without running the callback and `SystemCall` is returned.
//! 5. Otherwise the operation is pending: `Ok(token)`. Its result arrives
//!    through `pump()`, even when the OS finished it immediately.

use crate::addr_codec::{self, SockAddr, ADDR_HEADER, MIN_ACCEPT_BUFFER, MIN_ADDRESS_BUFFER};
use crate::buffer::IoBuffer;
use crate::context::{MsgParts, OperationContext, Pinned};
use crate::engine::{Destination, Engine};

use cport_core::entry::{op, Callback, OpEntry, OpKind, Token};
use cport_core::error::{CportError, Result};
use cport_core::port::CompletionPort;
use cport_core::{kdebug, ktrace, kwarn};

use std::os::fd::RawFd;

/// Effective transfer length: `len` or the full capacity.
fn io_len(buf: &IoBuffer, len: Option<usize>) -> Result<usize> {
    let cap = buf.capacity();
    let len = len.unwrap_or(cap);
    if len == 0 {
        return Err(CportError::InvalidArgument("length must be greater than zero"));
    }
    if len > cap {
        return Err(CportError::InvalidArgument("length exceeds buffer capacity"));
    }
    if u32::try_from(len).is_err() {
        return Err(CportError::InvalidArgument("length does not fit in 32 bits"));
    }
    Ok(len)
}

impl<P: CompletionPort> Engine<P> {
    /// Overlapped write of `buf[..len]` (default: whole buffer).
    pub fn write<F>(&mut self, fd: RawFd, buf: &IoBuffer, len: Option<usize>, callback: F) -> Result<Token>
    where
        F: FnOnce(i32, u32) + Send + 'static,
    {
        let len = io_len(buf, len)?;
        let lease = buf.lease()?;
        let args = [fd as u64, lease.as_mut_ptr() as u64, len as u64, 0, 0, 0];
        self.submit(OpKind::Write, op::WRITE, fd, args, Pinned::Buffer(lease), Box::new(callback))
    }

    /// Overlapped read into `buf[..len]` (default: whole buffer).
    pub fn read<F>(&mut self, fd: RawFd, buf: &IoBuffer, len: Option<usize>, callback: F) -> Result<Token>
    where
        F: FnOnce(i32, u32) + Send + 'static,
    {
        let len = io_len(buf, len)?;
        let lease = buf.lease()?;
        let args = [fd as u64, lease.as_mut_ptr() as u64, len as u64, 0, 0, 0];
        self.submit(OpKind::Read, op::READ, fd, args, Pinned::Buffer(lease), Box::new(callback))
    }

    /// Receive a datagram into `buf` and its source address into `addr_buf`.
    ///
    /// `addr_buf` must hold at least `MIN_ADDRESS_BUFFER` bytes; decode it
    /// with `decode_address` after the callback ran.
    pub fn recv_from<F>(
        &mut self,
        fd: RawFd,
        buf: &IoBuffer,
        addr_buf: &IoBuffer,
        len: Option<usize>,
        flags: i32,
        callback: F,
    ) -> Result<Token>
    where
        F: FnOnce(i32, u32) + Send + 'static,
    {
        let len = io_len(buf, len)?;
        if addr_buf.capacity() < MIN_ADDRESS_BUFFER {
            return Err(CportError::InvalidArgument("address buffer too small"));
        }
        let data = buf.lease()?;
        let addr = addr_buf.lease()?;

        let namelen = (addr.len() - ADDR_HEADER).min(u32::MAX as usize) as libc::socklen_t;
        let name = unsafe { addr.as_mut_ptr().add(ADDR_HEADER) } as *mut libc::c_void;
        let mut msg = MsgParts::boxed(data.as_mut_ptr(), len, name, namelen);
        let args = [fd as u64, msg.hdr_ptr() as u64, flags as u32 as u64, 0, 0, 0];
        let pinned = Pinned::RecvFrom { msg, _data: data, addr };
        self.submit(OpKind::RecvFrom, op::RECVMSG, fd, args, pinned, Box::new(callback))
    }

    /// Send `buf[..len]` to `dest`.
    pub fn send_to<F>(
        &mut self,
        fd: RawFd,
        buf: &IoBuffer,
        dest: Destination<'_>,
        len: Option<usize>,
        flags: i32,
        callback: F,
    ) -> Result<Token>
    where
        F: FnOnce(i32, u32) + Send + 'static,
    {
        let len = io_len(buf, len)?;
        let dest = Box::new(addr_codec::encode(dest.family, dest.host, dest.port)?);
        let data = buf.lease()?;

        let mut msg = MsgParts::boxed(
            data.as_mut_ptr(),
            len,
            dest.as_ptr() as *mut libc::c_void,
            dest.socklen(),
        );
        let args = [fd as u64, msg.hdr_ptr() as u64, flags as u32 as u64, 0, 0, 0];
        let pinned = Pinned::SendTo { _msg: msg, _data: data, _dest: dest };
        self.submit(OpKind::SendTo, op::SENDMSG, fd, args, pinned, Box::new(callback))
    }

    /// Accept one connection on `listen_fd` onto the pre-created `accept_fd`.
    ///
    /// On success the local address lands in the first half of `output`
    /// and the peer address in the second; bytes transferred is 0.
    pub fn accept<F>(&mut self, listen_fd: RawFd, accept_fd: RawFd, output: &IoBuffer, callback: F) -> Result<Token>
    where
        F: FnOnce(i32, u32) + Send + 'static,
    {
        if output.capacity() < MIN_ACCEPT_BUFFER {
            return Err(CportError::InvalidArgument("accept buffer too small"));
        }
        if accept_fd < 0 {
            return Err(CportError::InvalidArgument("accept handle must be a valid descriptor"));
        }
        let ext = self.ensure_extensions()?;
        let lease = output.lease()?;

        let mut peer = Box::new(SockAddr::empty());
        let args = [
            listen_fd as u64,
            peer.as_mut_ptr() as u64,
            peer.len_mut_ptr() as u64,
            libc::SOCK_CLOEXEC as u64,
            0,
            0,
        ];
        let pinned = Pinned::Accept { peer, output: lease, accept_fd };
        self.submit(OpKind::Accept, ext.accept_op, listen_fd, args, pinned, Box::new(callback))
    }

    /// Asynchronous connect to `dest`.
    pub fn connect<F>(&mut self, fd: RawFd, dest: Destination<'_>, callback: F) -> Result<Token>
    where
        F: FnOnce(i32, u32) + Send + 'static,
    {
        let dest = Box::new(addr_codec::encode(dest.family, dest.host, dest.port)?);
        let ext = self.ensure_extensions()?;
        let args = [fd as u64, dest.as_ptr() as u64, dest.socklen() as u64, 0, 0, 0];
        self.submit(OpKind::Connect, ext.connect_op, fd, args, Pinned::Connect { _dest: dest }, Box::new(callback))
    }

    /// Queue a zero-byte completion whose only job is to run `callback`
    /// on the pump thread with `(0, 0)`. Never completes inline.
    pub fn inject_event<F>(&mut self, callback: F) -> Result<Token>
    where
        F: FnOnce(i32, u32) + Send + 'static,
    {
        self.submit(OpKind::Inject, op::NOP, -1, [0; 6], Pinned::Nothing, Box::new(callback))
    }

    fn submit(
        &mut self,
        kind: OpKind,
        opcode: u8,
        fd: RawFd,
        args: [u64; 6],
        pinned: Pinned,
        callback: Callback,
    ) -> Result<Token> {
        match self.hand_off(kind, opcode, fd, args, pinned, callback) {
            Ok(token) => {
                self.stats.submitted += 1;
                Ok(token)
            }
            Err(e) => {
                if matches!(e, CportError::SystemCall { .. }) {
                    self.stats.refused += 1;
                }
                Err(e)
            }
        }
    }

    /// Steps 2-4 of the submit contract; shared with the internal wake read.
    pub(crate) fn hand_off(
        &mut self,
        kind: OpKind,
        opcode: u8,
        fd: RawFd,
        args: [u64; 6],
        pinned: Pinned,
        callback: Callback,
    ) -> Result<Token> {
        if fd >= 0 {
            self.associate(fd).map_err(|e| CportError::SystemCall {
                op: kind,
                errno: e.errno().unwrap_or(libc::EIO),
            })?;
        }

        let token = self.slab.insert(OperationContext::new(kind, fd, callback, pinned));
        if let Err(e) = self.port.push(&OpEntry::new(token, opcode, args)) {
            // Never queued: release the context, callback unrun.
            drop(self.slab.take(token));
            let errno = e.errno().unwrap_or(libc::EIO);
            kdebug!("{} on fd {} refused: errno {}", kind, fd, errno);
            return Err(CportError::SystemCall { op: kind, errno });
        }
        ktrace!("submit {} fd={} token={}", kind, fd, token);

        if self.config.eager_flush {
            if let Err(e) = self.port.flush() {
                // The next pump submits it again.
                kwarn!("flush after {} deferred: {}", kind, e);
            }
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineBuilder;
    use crate::inline_port::InlinePort;

    #[test]
    fn io_len_rules() {
        let buf = IoBuffer::new(8);
        assert_eq!(io_len(&buf, None).unwrap(), 8);
        assert_eq!(io_len(&buf, Some(3)).unwrap(), 3);
        assert!(io_len(&buf, Some(0)).unwrap_err().is_invalid_argument());
        assert!(io_len(&buf, Some(9)).unwrap_err().is_invalid_argument());
        assert!(io_len(&IoBuffer::new(0), None).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn invalid_submissions_allocate_nothing() {
        let mut engine = EngineBuilder::new().build_with_port(InlinePort::new(16)).unwrap();
        let buf = engine.allocate_buffer(8);
        let small_addr = IoBuffer::new(MIN_ADDRESS_BUFFER - 1);
        let small_accept = IoBuffer::new(MIN_ACCEPT_BUFFER - 1);
        let before = engine.outstanding();
        let inflight = engine.port().inflight();

        let never = |_: i32, _: u32| panic!("callback must not run");
        assert!(engine.write(1, &buf, Some(0), never).unwrap_err().is_invalid_argument());
        assert!(engine.read(0, &buf, Some(9), never).unwrap_err().is_invalid_argument());
        assert!(engine
            .recv_from(0, &buf, &small_addr, None, 0, never)
            .unwrap_err()
            .is_invalid_argument());
        assert!(engine.accept(0, 1, &small_accept, never).unwrap_err().is_invalid_argument());
        assert!(engine
            .send_to(0, &buf, Destination::inet("nope", 1), None, 0, never)
            .unwrap_err()
            .is_invalid_argument());
        assert!(matches!(
            engine.connect(0, Destination { family: libc::AF_INET6, host: "::1", port: 1 }, never),
            Err(CportError::UnsupportedAddressFamily(_))
        ));

        assert_eq!(engine.outstanding(), before);
        assert_eq!(engine.port().inflight(), inflight);
        assert_eq!(engine.stats().submitted, 0);
        assert!(!buf.is_lent());
    }

    #[test]
    fn buffer_in_flight_is_refused() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
        let mut engine = EngineBuilder::new().build_with_port(InlinePort::new(16)).unwrap();
        let buf = engine.allocate_buffer(8);

        engine.read(fds[0], &buf, None, |_, _| {}).unwrap();
        assert!(buf.is_lent());
        assert!(buf.to_vec().is_none());
        let err = engine.read(fds[0], &buf, None, |_, _| {}).unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(engine.outstanding(), 1);

        drop(engine);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn refused_push_releases_context() {
        let mut engine = EngineBuilder::new().build_with_port(InlinePort::new(16)).unwrap();
        let buf = IoBuffer::from_slice(b"data");
        let err = engine
            .write(1_000_000, &buf, None, |_, _| panic!("callback must not run"))
            .unwrap_err();
        assert!(matches!(err, CportError::SystemCall { op: OpKind::Write, errno } if errno == libc::EBADF));
        assert_eq!(engine.outstanding(), 0);
        assert_eq!(engine.stats().refused, 1);
        assert!(!buf.is_lent());
    }
}
