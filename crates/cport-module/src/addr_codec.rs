//! Address codec: structured addresses <-> OS address buffers.
//!
//! Address-buffer layout (one "half" for accept output):
//!
//! ```text
//!   [0..4)   u32 length, native endian  (0 = nothing written)
//!   [4..)    raw sockaddr bytes as the kernel wrote them
//! ```

use cport_core::address::Address;
use cport_core::error::{CportError, Result};

use std::mem::{size_of, MaybeUninit};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;

pub const ADDR_HEADER: usize = size_of::<u32>();

/// Smallest address buffer a receive-from accepts.
pub const MIN_ADDRESS_BUFFER: usize = ADDR_HEADER + size_of::<libc::sockaddr>();

/// Smallest accept output buffer: local half + remote half.
pub const MIN_ACCEPT_BUFFER: usize = 2 * MIN_ADDRESS_BUFFER;

/// Capacity of buffers from `allocate_address_buffer`; fits any family.
pub const ADDRESS_BUFFER_SIZE: usize = ADDR_HEADER + size_of::<libc::sockaddr_storage>();

/// An owned `sockaddr_storage` plus its meaningful length.
///
/// Boxed inside operation contexts so the kernel sees a stable address.
#[derive(Clone, Copy)]
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddr {
    /// Zeroed, with `len` set to full capacity (ready for the kernel to fill).
    pub fn empty() -> Self {
        Self {
            storage: unsafe { MaybeUninit::zeroed().assume_init() },
            len: size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    pub fn from_v4(sa: SocketAddrV4) -> Self {
        let mut out = Self::empty();
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: sa.port().to_be(),
            sin_addr: libc::in_addr { s_addr: u32::from(*sa.ip()).to_be() },
            sin_zero: [0; 8],
        };
        unsafe {
            std::ptr::write(&mut out.storage as *mut _ as *mut libc::sockaddr_in, sin);
        }
        out.len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
        out
    }

    /// Local address bound to `fd` (getsockname).
    pub fn local_of(fd: RawFd) -> Option<Self> {
        let mut out = Self::empty();
        let rc = unsafe { libc::getsockname(fd, out.as_mut_ptr(), &mut out.len) };
        (rc == 0).then_some(out)
    }

    #[inline]
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut _ as *mut libc::sockaddr
    }

    #[inline]
    pub fn socklen(&self) -> libc::socklen_t {
        self.len
    }

    #[inline]
    pub fn len_mut_ptr(&mut self) -> *mut libc::socklen_t {
        &mut self.len
    }

    pub fn family(&self) -> i32 {
        self.storage.ss_family as i32
    }

    /// Meaningful bytes, clamped to the storage size.
    pub fn bytes(&self) -> &[u8] {
        let n = (self.len as usize).min(size_of::<libc::sockaddr_storage>());
        unsafe { std::slice::from_raw_parts(&self.storage as *const _ as *const u8, n) }
    }
}

impl std::fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SockAddr({})", decode_raw(self.bytes()))
    }
}

/// Build an OS address for `(family, host, port)`.
///
/// Only `AF_INET` is supported.
pub fn encode(family: i32, host: &str, port: u16) -> Result<SockAddr> {
    if family != libc::AF_INET {
        return Err(CportError::UnsupportedAddressFamily(family));
    }
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| CportError::InvalidArgument("host is not a valid IPv4 address"))?;
    Ok(SockAddr::from_v4(SocketAddrV4::new(ip, port)))
}

/// Decode one address-buffer half. Never fails.
pub fn decode(buf: &[u8]) -> Address {
    if buf.len() < ADDR_HEADER {
        return Address::None;
    }
    let mut hdr = [0u8; ADDR_HEADER];
    hdr.copy_from_slice(&buf[..ADDR_HEADER]);
    let len = u32::from_ne_bytes(hdr) as usize;
    let body = &buf[ADDR_HEADER..];
    decode_raw(&body[..len.min(body.len())])
}

/// Decode raw sockaddr bytes.
pub fn decode_raw(raw: &[u8]) -> Address {
    let fam_len = size_of::<libc::sa_family_t>();
    if raw.len() < fam_len {
        return Address::None;
    }
    let family = unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const libc::sa_family_t) };

    if family as i32 == libc::AF_INET && raw.len() >= size_of::<libc::sockaddr_in>() {
        let sin = unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const libc::sockaddr_in) };
        let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
        return Address::inet(ip, u16::from_be(sin.sin_port));
    }

    Address::Opaque {
        family: family as u16,
        bytes: raw[fam_len..].to_vec(),
    }
}

/// Write `addr` into one address-buffer half, truncating to fit.
/// Returns the length recorded in the header.
pub fn write_half(dst: &mut [u8], addr: Option<&SockAddr>) -> usize {
    if dst.len() < ADDR_HEADER {
        return 0;
    }
    let (hdr, body) = dst.split_at_mut(ADDR_HEADER);
    let n = match addr {
        Some(a) => {
            let src = a.bytes();
            let n = src.len().min(body.len());
            body[..n].copy_from_slice(&src[..n]);
            n
        }
        None => 0,
    };
    hdr.copy_from_slice(&(n as u32).to_ne_bytes());
    n
}

/// Write only the header of a half (the kernel already filled the body).
pub fn set_half_len(dst: &mut [u8], len: usize) {
    if dst.len() >= ADDR_HEADER {
        let n = len.min(dst.len() - ADDR_HEADER) as u32;
        dst[..ADDR_HEADER].copy_from_slice(&n.to_ne_bytes());
    }
}

/// `(local, remote)` from an accept output buffer.
pub fn accept_addresses(buf: &[u8]) -> (Address, Address) {
    let (local, remote) = buf.split_at(buf.len() / 2);
    (decode(local), decode(remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(addr: &SockAddr) -> Address {
        let mut buf = vec![0u8; ADDRESS_BUFFER_SIZE];
        write_half(&mut buf, Some(addr));
        decode(&buf)
    }

    #[test]
    fn sizes() {
        assert_eq!(MIN_ADDRESS_BUFFER, 20);
        assert_eq!(MIN_ACCEPT_BUFFER, 40);
        assert!(ADDRESS_BUFFER_SIZE >= MIN_ADDRESS_BUFFER);
    }

    #[test]
    fn encode_then_decode_inet() {
        let sa = encode(libc::AF_INET, "127.0.0.1", 4000).unwrap();
        assert_eq!(sa.family(), libc::AF_INET);
        assert_eq!(sa.socklen() as usize, size_of::<libc::sockaddr_in>());
        let decoded = round_trip(&sa);
        assert_eq!(decoded.host_port(), Some(("127.0.0.1".to_string(), 4000)));
    }

    #[test]
    fn encode_rejects_other_families() {
        let err = encode(libc::AF_INET6, "::1", 80).unwrap_err();
        assert!(matches!(err, CportError::UnsupportedAddressFamily(f) if f == libc::AF_INET6));
    }

    #[test]
    fn encode_rejects_bad_host() {
        assert!(encode(libc::AF_INET, "not-an-ip", 80).unwrap_err().is_invalid_argument());
        assert!(encode(libc::AF_INET, "256.1.1.1", 80).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn decode_empty_is_none() {
        assert!(decode(&[]).is_none());
        assert!(decode(&[0u8; 3]).is_none());
        assert!(decode(&[0u8; 64]).is_none());
    }

    #[test]
    fn decode_unknown_family_is_opaque() {
        let mut raw = vec![0u8; 8];
        raw[..2].copy_from_slice(&(libc::AF_UNIX as libc::sa_family_t).to_ne_bytes());
        raw[2..].copy_from_slice(b"sock\0\0");
        let mut buf = (raw.len() as u32).to_ne_bytes().to_vec();
        buf.extend_from_slice(&raw);

        match decode(&buf) {
            Address::Opaque { family, bytes } => {
                assert_eq!(family as i32, libc::AF_UNIX);
                assert_eq!(bytes, b"sock\0\0");
            }
            other => panic!("expected opaque, got {:?}", other),
        }
    }

    #[test]
    fn header_length_is_clamped() {
        let sa = encode(libc::AF_INET, "10.0.0.1", 9).unwrap();
        let mut buf = vec![0u8; ADDRESS_BUFFER_SIZE];
        write_half(&mut buf, Some(&sa));
        buf[..4].copy_from_slice(&u32::MAX.to_ne_bytes());
        assert_eq!(decode(&buf).host_port(), Some(("10.0.0.1".to_string(), 9)));
    }

    #[test]
    fn accept_halves() {
        let local = encode(libc::AF_INET, "127.0.0.1", 80).unwrap();
        let remote = encode(libc::AF_INET, "127.0.0.2", 5555).unwrap();
        let mut buf = vec![0u8; 2 * ADDRESS_BUFFER_SIZE];
        let (a, b) = buf.split_at_mut(ADDRESS_BUFFER_SIZE);
        write_half(a, Some(&local));
        write_half(b, Some(&remote));

        let (l, r) = accept_addresses(&buf);
        assert_eq!(l.to_string(), "127.0.0.1:80");
        assert_eq!(r.to_string(), "127.0.0.2:5555");
    }

    #[test]
    fn write_half_none_clears() {
        let mut buf = vec![0xffu8; MIN_ADDRESS_BUFFER];
        assert_eq!(write_half(&mut buf, None), 0);
        assert!(decode(&buf).is_none());
    }
}
