//! Extension resolver.
//!
//! Accept and connect are not part of the base submission set on every
//! kernel: io_uring gained ACCEPT and CONNECT in 5.5. Before the engine
//! takes any operation it opens a scratch handle, asks the platform which
//! opcodes it supports, and closes the handle again. Missing either one is
//! fatal to engine construction.

use cport_core::entry::op;
use cport_core::error::{CportError, Result};
use cport_core::port::{CompletionPort, ScratchProbe};
use cport_core::{kdebug, kerror};

/// Entry points resolved once per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extensions {
    pub accept_op: u8,
    pub connect_op: u8,
}

pub fn resolve<P: CompletionPort>(port: &P) -> Result<Extensions> {
    let scratch = port.open_scratch().map_err(|e| {
        kerror!("{}: cannot open scratch handle: {}", port.name(), e);
        match e {
            CportError::SystemResource { .. } => e,
            other => CportError::SystemResource {
                what: "scratch handle",
                errno: other.errno().unwrap_or(libc::EIO),
            },
        }
    })?;

    let accept = scratch.supports(op::ACCEPT);
    let connect = scratch.supports(op::CONNECT);
    drop(scratch);

    kdebug!("{}: accept={} connect={}", port.name(), accept, connect);
    if !accept {
        kerror!("{}: accept extension unavailable", port.name());
        return Err(CportError::SystemResource { what: "accept extension", errno: libc::ENOSYS });
    }
    if !connect {
        kerror!("{}: connect extension unavailable", port.name());
        return Err(CportError::SystemResource { what: "connect extension", errno: libc::ENOSYS });
    }
    Ok(Extensions { accept_op: op::ACCEPT, connect_op: op::CONNECT })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inline_port::InlinePort;
    use std::sync::atomic::Ordering;

    #[test]
    fn resolves_both() {
        let port = InlinePort::new(8);
        let (opened, closed) = port.scratch_counters();
        let ext = resolve(&port).unwrap();
        assert_eq!(ext.accept_op, op::ACCEPT);
        assert_eq!(ext.connect_op, op::CONNECT);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_connect_is_fatal_and_closes_scratch() {
        let port = InlinePort::new(8).without_opcode(op::CONNECT);
        let (opened, closed) = port.scratch_counters();
        let err = resolve(&port).unwrap_err();
        assert!(matches!(err, CportError::SystemResource { what: "connect extension", .. }));
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_accept_is_fatal() {
        let port = InlinePort::new(8).without_opcode(op::ACCEPT);
        assert!(matches!(
            resolve(&port),
            Err(CportError::SystemResource { what: "accept extension", .. })
        ));
    }

    #[test]
    fn scratch_open_failure() {
        let port = InlinePort::new(8).failing_scratch();
        let err = resolve(&port).unwrap_err();
        assert_eq!(err.errno(), Some(libc::EMFILE));
    }
}
