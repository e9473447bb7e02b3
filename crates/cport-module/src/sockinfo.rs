//! Socket protocol query.
//!
//! Lets the embedding reactor size address buffers and pick a family for
//! a socket it did not create.

use cport_core::error::{CportError, Result};

use std::mem::size_of;
use std::os::fd::RawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketInfo {
    /// Largest sockaddr the family can produce.
    pub max_addr_len: usize,
    pub family: i32,
    pub sock_type: i32,
    pub protocol: i32,
}

impl SocketInfo {
    /// Address-buffer capacity needed for one address of this socket.
    pub fn address_buffer_len(&self) -> usize {
        crate::addr_codec::ADDR_HEADER + self.max_addr_len
    }
}

pub fn socket_info(fd: RawFd) -> Result<SocketInfo> {
    let family = sockopt_int(fd, libc::SO_DOMAIN)?;
    let sock_type = sockopt_int(fd, libc::SO_TYPE)?;
    let protocol = sockopt_int(fd, libc::SO_PROTOCOL)?;
    Ok(SocketInfo { max_addr_len: max_addr_len(family), family, sock_type, protocol })
}

fn max_addr_len(family: i32) -> usize {
    match family {
        libc::AF_INET => size_of::<libc::sockaddr_in>(),
        libc::AF_INET6 => size_of::<libc::sockaddr_in6>(),
        libc::AF_UNIX => size_of::<libc::sockaddr_un>(),
        _ => size_of::<libc::sockaddr_storage>(),
    }
}

fn sockopt_int(fd: RawFd, opt: libc::c_int) -> Result<i32> {
    let mut val: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, opt, &mut val as *mut _ as *mut libc::c_void, &mut len)
    };
    if rc < 0 {
        return Err(CportError::SystemResource { what: "getsockopt", errno: crate::context::errno() });
    }
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, UdpSocket};
    use std::os::fd::AsRawFd;

    #[test]
    fn udp_socket() {
        let s = UdpSocket::bind("127.0.0.1:0").unwrap();
        let info = socket_info(s.as_raw_fd()).unwrap();
        assert_eq!(info.family, libc::AF_INET);
        assert_eq!(info.sock_type, libc::SOCK_DGRAM);
        assert_eq!(info.protocol, libc::IPPROTO_UDP);
        assert_eq!(info.max_addr_len, 16);
        assert_eq!(info.address_buffer_len(), 20);
    }

    #[test]
    fn tcp_listener() {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let info = socket_info(l.as_raw_fd()).unwrap();
        assert_eq!(info.sock_type, libc::SOCK_STREAM);
        assert_eq!(info.protocol, libc::IPPROTO_TCP);
    }

    #[test]
    fn not_a_socket() {
        let err = socket_info(1_000_000).unwrap_err();
        assert_eq!(err.errno(), Some(libc::EBADF));
    }
}
