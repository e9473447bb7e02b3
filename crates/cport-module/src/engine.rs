//! `Engine`: the compositor that wires a port, the context slab, the
//! resolver and the injector together.
//!
//! ```text
//! Engine<P: CompletionPort = UringPort>
//!   ├─ port        one OS completion queue
//!   ├─ slab        every live OperationContext, keyed by Token
//!   ├─ extensions  accept/connect entry points, resolved once
//!   └─ injector    cross-thread posts + the internal wake READ
//! ```
//!
//! Submitters live in `submit.rs`, the pump in `pump.rs`.
//!
//! ```no_run
//! use cport_module::engine::EngineBuilder;
//!
//! let mut engine = EngineBuilder::from_env().build()?;
//! engine.inject_event(|err, bytes| assert_eq!((err, bytes), (0, 0)))?;
//! engine.pump(None)?;
//! engine.shutdown();
//! # Ok::<(), cport_core::error::CportError>(())
//! ```
//!
//! A callback that is not `FnOnce(i32, u32)` is rejected at compile time:
//!
//! ```compile_fail
//! use cport_module::engine::EngineBuilder;
//! use cport_module::inline_port::InlinePort;
//!
//! let mut engine = EngineBuilder::new().build_with_port(InlinePort::new(8)).unwrap();
//! let buf = engine.allocate_buffer(4);
//! engine.write(1, &buf, None, 42u32);
//! ```

use crate::addr_codec::{self, ADDRESS_BUFFER_SIZE};
use crate::buffer::IoBuffer;
use crate::context::{ContextSlab, Pinned};
use crate::injector::Injector;
use crate::inline_port::InlinePort;
use crate::resolver::{self, Extensions};
use crate::sockinfo::{self, SocketInfo};
use crate::DefaultPort;

use cport_core::address::Address;
use cport_core::config::EngineConfig;
use cport_core::entry::{op, OpKind, Token};
use cport_core::error::{CportError, Result};
use cport_core::port::CompletionPort;
use cport_core::{kinfo, kwarn};

use std::collections::HashSet;
use std::os::fd::RawFd;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Where a send-to or connect goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination<'a> {
    pub family: i32,
    pub host: &'a str,
    pub port: u16,
}

impl<'a> Destination<'a> {
    pub fn inet(host: &'a str, port: u16) -> Self {
        Self { family: libc::AF_INET, host, port }
    }
}

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Operations the port accepted.
    pub submitted: u64,
    /// Operations the port refused at submit (`SystemCall` errors).
    pub refused: u64,
    /// Callbacks run for port completions.
    pub dispatched: u64,
    /// Callbacks run for `Injector::post`.
    pub injected: u64,
    /// Pumps that returned `Timeout`.
    pub timeouts: u64,
}

pub struct Engine<P: CompletionPort = DefaultPort> {
    pub(crate) port: P,
    pub(crate) slab: ContextSlab,
    pub(crate) associated: HashSet<RawFd>,
    pub(crate) extensions: OnceLock<Extensions>,
    pub(crate) config: EngineConfig,
    pub(crate) injector: Injector,
    pub(crate) wake_buf: IoBuffer,
    pub(crate) wake_token: Option<Token>,
    pub(crate) injected_seq: u64,
    pub(crate) stats: EngineStats,
    pub(crate) closing: bool,
    closed: bool,
}

impl<P: CompletionPort> Engine<P> {
    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Live user operation contexts (submitted, not yet dispatched).
    pub fn outstanding(&self) -> usize {
        self.slab.len() - usize::from(self.wake_token.is_some())
    }

    /// A handle for posting callbacks from other threads.
    pub fn injector(&self) -> Injector {
        self.injector.clone()
    }

    pub fn extensions(&self) -> Option<&Extensions> {
        self.extensions.get()
    }

    /// Extension entry points resolved when the engine was built.
    pub(crate) fn ensure_extensions(&self) -> Result<Extensions> {
        self.extensions.get().copied().ok_or(CportError::SystemResource {
            what: "extensions unresolved",
            errno: libc::ENOSYS,
        })
    }

    /// Register `fd` with the completion queue. Re-registering is a no-op.
    ///
    /// The engine cannot see a descriptor being closed, so a registration
    /// outlives the handle until `dissociate` is called. A reused number
    /// is then treated as already registered.
    pub fn associate(&mut self, fd: RawFd) -> Result<()> {
        if self.associated.contains(&fd) {
            return Ok(());
        }
        self.port.associate(fd)?;
        self.associated.insert(fd);
        Ok(())
    }

    /// Forget the registration of `fd`, typically right before closing it.
    /// Returns whether it was registered.
    pub fn dissociate(&mut self, fd: RawFd) -> bool {
        self.associated.remove(&fd)
    }

    // ── Buffers and addresses ──

    pub fn allocate_buffer(&self, size: usize) -> IoBuffer {
        IoBuffer::new(size)
    }

    /// Address buffer large enough for any family (receive-from).
    pub fn allocate_address_buffer(&self) -> IoBuffer {
        IoBuffer::new(ADDRESS_BUFFER_SIZE)
    }

    /// Accept output buffer: two address halves.
    pub fn allocate_accept_buffer(&self) -> IoBuffer {
        IoBuffer::new(2 * ADDRESS_BUFFER_SIZE)
    }

    /// `Address::None` also while the buffer is still in flight.
    pub fn decode_address(&self, buf: &IoBuffer) -> Address {
        buf.with(addr_codec::decode).unwrap_or(Address::None)
    }

    pub fn accept_addresses(&self, buf: &IoBuffer) -> (Address, Address) {
        buf.with(addr_codec::accept_addresses)
            .unwrap_or((Address::None, Address::None))
    }

    /// Address buffer holding `(family, host, port)`.
    pub fn encode_address(&self, family: i32, host: &str, port: u16) -> Result<IoBuffer> {
        let sa = addr_codec::encode(family, host, port)?;
        let buf = IoBuffer::new(ADDRESS_BUFFER_SIZE);
        buf.with_mut(|b| addr_codec::write_half(b, Some(&sa)));
        Ok(buf)
    }

    pub fn socket_info(&self, fd: RawFd) -> Result<SocketInfo> {
        sockinfo::socket_info(fd)
    }

    // ── Lifecycle ──

    /// Keep one READ pending on the injector's eventfd.
    pub(crate) fn arm_wake(&mut self) -> Result<()> {
        let fd = self.injector.wake_fd();
        let lease = self.wake_buf.lease()?;
        let args = [fd as u64, lease.as_mut_ptr() as u64, lease.len() as u64, 0, 0, 0];
        let token = self.hand_off(
            OpKind::Read,
            op::READ,
            fd,
            args,
            Pinned::Buffer(lease),
            Box::new(|_, _| {}),
        )?;
        self.wake_token = Some(token);
        Ok(())
    }

    /// Drain for up to `drain_timeout`, then close the queue.
    ///
    /// Returns the number of operations that were still outstanding and
    /// had to be leaked. Their buffers stay lent forever.
    pub fn shutdown(mut self) -> usize {
        self.close(true)
    }

    fn close(&mut self, drain: bool) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;
        self.closing = true;
        self.injector.close();

        if drain {
            self.drain(self.config.drain_timeout);
        }

        let wake_pending = self.wake_token.take().is_some();
        let leaked = self.slab.leak_all().saturating_sub(usize::from(wake_pending));
        let mut dropped = 0;
        while self.injector.pop().is_some() {
            dropped += 1;
        }
        if leaked > 0 {
            kwarn!(
                "{}: {} operations outstanding at shutdown, leaking their memory",
                self.port.name(),
                leaked
            );
        }
        if dropped > 0 {
            kwarn!("{}: {} posted callbacks dropped unrun", self.port.name(), dropped);
        }

        self.port.shutdown();
        kinfo!(
            "cport engine closed: port={} submitted={} dispatched={} leaked={}",
            self.port.name(),
            self.stats.submitted,
            self.stats.dispatched,
            leaked
        );
        leaked
    }

    fn drain(&mut self, budget: Duration) {
        if self.wake_token.is_some() {
            if let Err(e) = self.injector.wake() {
                kwarn!("drain: cannot release wake read: {}", e);
            }
        }
        let deadline = Instant::now() + budget;
        while !self.slab.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.port.wait(Some(remaining)) {
                Ok(Some(c)) => {
                    if let Err(e) = self.complete(c) {
                        kwarn!("drain: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    kwarn!("drain aborted: {}", e);
                    break;
                }
            }
        }
        while self.run_injected().is_some() {}
    }
}

/// Same as `shutdown()` without the drain.
impl<P: CompletionPort> Drop for Engine<P> {
    fn drop(&mut self) {
        self.close(false);
    }
}

/// Builder for an engine.
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    config: EngineConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Library defaults.
    pub fn new() -> Self {
        Self { config: EngineConfig::new() }
    }

    /// Defaults with `CPORT_*` environment overrides.
    pub fn from_env() -> Self {
        Self { config: EngineConfig::from_env() }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sq_entries(mut self, n: u32) -> Self {
        self.config = self.config.sq_entries(n);
        self
    }

    pub fn cq_entries(mut self, n: u32) -> Self {
        self.config = self.config.cq_entries(n);
        self
    }

    pub fn eager_flush(mut self, enable: bool) -> Self {
        self.config = self.config.eager_flush(enable);
        self
    }

    pub fn drain_timeout(mut self, d: Duration) -> Self {
        self.config = self.config.drain_timeout(d);
        self
    }

    /// Build on the default io_uring port.
    pub fn build(self) -> Result<Engine<DefaultPort>> {
        self.config.validate()?;
        let port = DefaultPort::new(&self.config)?;
        self.build_with_port(port)
    }

    /// Build on the poll(2) emulation.
    pub fn build_inline(self) -> Result<Engine<InlinePort>> {
        self.config.validate()?;
        let port = InlinePort::from_config(&self.config);
        self.build_with_port(port)
    }

    /// Build on any port.
    ///
    /// 1. Validates config
    /// 2. Resolves accept/connect (fatal on failure)
    /// 3. Creates the injector eventfd
    /// 4. Arms the wake read
    pub fn build_with_port<P: CompletionPort>(self, port: P) -> Result<Engine<P>> {
        self.config.validate()?;

        let extensions = OnceLock::new();
        let ext = resolver::resolve(&port)?;
        let _ = extensions.set(ext);

        let injector = Injector::new()?;
        let mut engine = Engine {
            port,
            slab: ContextSlab::new(),
            associated: HashSet::new(),
            extensions,
            config: self.config,
            injector,
            wake_buf: IoBuffer::new(std::mem::size_of::<u64>()),
            wake_token: None,
            injected_seq: 0,
            stats: EngineStats::default(),
            closing: false,
            closed: false,
        };
        engine.arm_wake().map_err(|e| CportError::SystemResource {
            what: "injector wake read",
            errno: e.errno().unwrap_or(libc::EIO),
        })?;

        kinfo!(
            "cport engine up: port={} capacity={} eager_flush={}",
            engine.port.name(),
            engine.port.capacity(),
            engine.config.eager_flush
        );
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn missing_extension_fails_build() {
        let port = InlinePort::new(8).without_opcode(op::CONNECT);
        let (opened, closed) = port.scratch_counters();

        let err = EngineBuilder::new().build_with_port(port).err().unwrap();
        assert!(matches!(err, CportError::SystemResource { what: "connect extension", .. }));
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scratch_failure_fails_build() {
        let port = InlinePort::new(8).failing_scratch();
        let (opened, closed) = port.scratch_counters();
        let err = EngineBuilder::new().build_with_port(port).err().unwrap();
        assert!(matches!(err, CportError::SystemResource { errno, .. } if errno == libc::EMFILE));
        assert_eq!(opened.load(Ordering::SeqCst), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn built_engine_has_extensions() {
        let engine = EngineBuilder::new().build_with_port(InlinePort::new(8)).unwrap();
        let ext = engine.ensure_extensions().unwrap();
        assert_eq!(ext, Extensions { accept_op: op::ACCEPT, connect_op: op::CONNECT });
        assert_eq!(engine.extensions(), Some(&ext));
    }

    #[test]
    fn associate_is_idempotent_until_dissociated() {
        let mut engine = EngineBuilder::new().build_with_port(InlinePort::new(8)).unwrap();
        let before = engine.associated.len();
        engine.associate(0).unwrap();
        engine.associate(0).unwrap();
        assert_eq!(engine.associated.len(), before + 1);

        assert!(engine.dissociate(0));
        assert!(!engine.dissociate(0));
        assert_eq!(engine.associated.len(), before);
    }
}
