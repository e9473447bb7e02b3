//! Submission and completion entry types.
//!
//! These are the *lingua franca* between the engine and its ports.
//! A port never sees a callback or a buffer object, only an [`OpEntry`]
//! whose arguments are raw addresses kept alive by the engine.

/// Opaque identifier handed to the OS with every operation.
///
/// Stored in io_uring's `user_data` field and returned verbatim in the
/// completion record. Layout: low 32 bits = slab index, bits 32..63 =
/// slot generation. Bit 63 is reserved for port-internal entries and is
/// never set on a token that names an operation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Token(pub u64);

impl Token {
    pub const INTERNAL_BIT: u64 = 1 << 63;

    const GENERATION_MASK: u32 = 0x7fff_ffff;

    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation & Self::GENERATION_MASK) as u64) << 32 | index as u64)
    }

    /// A token for port bookkeeping (timeouts and the like).
    #[inline]
    pub const fn internal(seq: u64) -> Self {
        Self(Self::INTERNAL_BIT | (seq & !Self::INTERNAL_BIT))
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32 & Self::GENERATION_MASK
    }

    #[inline]
    pub const fn is_internal(self) -> bool {
        self.0 & Self::INTERNAL_BIT != 0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_internal() {
            write!(f, "internal#{}", self.0 & !Self::INTERNAL_BIT)
        } else {
            write!(f, "{}.{}", self.index(), self.generation())
        }
    }
}

// ── io_uring opcode constants (from linux/io_uring.h) ──
// Only the opcodes the engine issues. Ports translate these to their
// native form; the inline port maps them to plain syscalls.
pub mod op {
    pub const NOP: u8 = 0;
    pub const SENDMSG: u8 = 9;
    pub const RECVMSG: u8 = 10;
    pub const TIMEOUT: u8 = 11;
    pub const ACCEPT: u8 = 13;
    pub const CONNECT: u8 = 16;
    pub const READ: u8 = 22;
    pub const WRITE: u8 = 23;
}

/// The operation kinds the engine can submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Write,
    Read,
    RecvFrom,
    SendTo,
    Accept,
    Connect,
    Inject,
}

impl OpKind {
    /// Opcode used on the wire for this kind.
    pub const fn opcode(self) -> u8 {
        match self {
            OpKind::Write => op::WRITE,
            OpKind::Read => op::READ,
            OpKind::RecvFrom => op::RECVMSG,
            OpKind::SendTo => op::SENDMSG,
            OpKind::Accept => op::ACCEPT,
            OpKind::Connect => op::CONNECT,
            OpKind::Inject => op::NOP,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            OpKind::Write => "write",
            OpKind::Read => "read",
            OpKind::RecvFrom => "recv_from",
            OpKind::SendTo => "send_to",
            OpKind::Accept => "accept",
            OpKind::Connect => "connect",
            OpKind::Inject => "inject",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One operation as handed to a port.
///
/// `args` follow the syscall ABI order of the opcode:
///
/// | opcode  | args                                  |
/// |---------|---------------------------------------|
/// | WRITE   | fd, buf, len                          |
/// | READ    | fd, buf, len                          |
/// | RECVMSG | fd, msghdr*, flags                    |
/// | SENDMSG | fd, msghdr*, flags                    |
/// | ACCEPT  | fd, sockaddr*, socklen_t*, flags      |
/// | CONNECT | fd, sockaddr*, socklen                |
/// | NOP     | -                                     |
///
/// Every pointer refers to memory owned by the operation context and
/// stays valid until the matching completion has been retrieved.
#[derive(Debug, Clone, Copy)]
pub struct OpEntry {
    pub token: Token,
    pub opcode: u8,
    pub args: [u64; 6],
}

impl OpEntry {
    pub const fn new(token: Token, opcode: u8, args: [u64; 6]) -> Self {
        Self { token, opcode, args }
    }

    /// Target descriptor (`args[0]`) for opcodes that have one.
    #[inline]
    pub fn fd(&self) -> i32 {
        self.args[0] as i32
    }
}

/// A completion record retrieved from the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub token: Token,
    /// Result (bytes or descriptor), or negative errno.
    pub result: i64,
    /// Port-specific flags.
    pub flags: u32,
}

impl Completion {
    /// Split into the `(error_code, bytes_transferred)` pair callbacks see.
    ///
    /// A negative result becomes `(errno, 0)`; otherwise `(0, result)`.
    #[inline]
    pub fn split(&self) -> (i32, u32) {
        if self.result < 0 {
            ((-self.result) as i32, 0)
        } else {
            (0, self.result.min(u32::MAX as i64) as u32)
        }
    }
}

/// Outcome of one pump iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// One completion was retrieved and its callback invoked.
    Dispatched { token: Token, error: i32, bytes: u32 },
    /// The wait elapsed without a completion. Not an error.
    Timeout,
}

impl PumpOutcome {
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, PumpOutcome::Timeout)
    }
}

/// Completion callback: `(error_code, bytes_transferred)`.
///
/// Owned by the operation context from submit until dispatch and
/// invoked exactly once, on the thread that calls `pump`.
pub type Callback = Box<dyn FnOnce(i32, u32) + Send + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_packs_index_and_generation() {
        let t = Token::new(42, 7);
        assert_eq!(t.index(), 42);
        assert_eq!(t.generation(), 7);
        assert!(!t.is_internal());
    }

    #[test]
    fn token_generation_never_sets_internal_bit() {
        let t = Token::new(u32::MAX, u32::MAX);
        assert!(!t.is_internal());
        assert_eq!(t.generation(), 0x7fff_ffff);
    }

    #[test]
    fn internal_token() {
        let t = Token::internal(5);
        assert!(t.is_internal());
        assert_eq!(format!("{}", t), "internal#5");
    }

    #[test]
    fn completion_split() {
        let ok = Completion { token: Token(0), result: 512, flags: 0 };
        assert_eq!(ok.split(), (0, 512));

        let failed = Completion { token: Token(0), result: -(104i64), flags: 0 };
        assert_eq!(failed.split(), (104, 0));
    }

    #[test]
    fn op_kind_opcodes() {
        assert_eq!(OpKind::Inject.opcode(), op::NOP);
        assert_eq!(OpKind::RecvFrom.opcode(), op::RECVMSG);
        assert_eq!(OpKind::SendTo.opcode(), op::SENDMSG);
        assert_eq!(OpKind::Accept.to_string(), "accept");
    }
}
