//! Decoded network addresses.
//!
//! What comes out of an address buffer after a receive-from or accept.
//! Decoding is permissive: an empty buffer is `None`, a family the codec
//! does not understand is carried through as `Opaque` instead of failing.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// No address was written (e.g. receive on a connected socket).
    None,
    /// IPv4 host and port.
    Inet(SocketAddrV4),
    /// Unknown family: the raw family tag and the address bytes after it.
    Opaque { family: u16, bytes: Vec<u8> },
}

impl Address {
    pub fn inet(host: Ipv4Addr, port: u16) -> Self {
        Address::Inet(SocketAddrV4::new(host, port))
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Address::None)
    }

    /// `(host, port)` for structured addresses.
    pub fn host_port(&self) -> Option<(String, u16)> {
        match self {
            Address::Inet(sa) => Some((sa.ip().to_string(), sa.port())),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::None => f.write_str("<none>"),
            Address::Inet(sa) => write!(f, "{}", sa),
            Address::Opaque { family, bytes } => {
                write!(f, "<family {}: {} bytes>", family, bytes.len())
            }
        }
    }
}

impl From<SocketAddrV4> for Address {
    fn from(sa: SocketAddrV4) -> Self {
        Address::Inet(sa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_of_inet() {
        let a = Address::inet(Ipv4Addr::LOCALHOST, 4000);
        assert_eq!(a.host_port(), Some(("127.0.0.1".to_string(), 4000)));
        assert_eq!(a.to_string(), "127.0.0.1:4000");
    }

    #[test]
    fn none_and_opaque_have_no_host() {
        assert!(Address::None.is_none());
        assert_eq!(Address::None.host_port(), None);
        let o = Address::Opaque { family: 1, bytes: vec![0; 14] };
        assert_eq!(o.host_port(), None);
        assert_eq!(o.to_string(), "<family 1: 14 bytes>");
    }
}
