//! Raw socket address plumbing.
//!
//! Endpoints are plain `std::net::SocketAddr`s; this module supplies the
//! conversions the kernel-facing paths need: decoding the `sockaddr_storage`
//! filled in by `accept4`, and querying a fd's bound/peer address.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

/// Decode a kernel-filled `sockaddr_storage` into a `SocketAddr`.
pub(crate) fn decode_sockaddr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sa.sin_port))))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported address family {other}"),
        )),
    }
}

/// The address a socket fd is bound to.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    decode_sockaddr(&storage)
}

/// The address of a connected socket's peer.
pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    decode_sockaddr(&storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_v4() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let sa = &mut storage as *mut _ as *mut libc::sockaddr_in;
        unsafe {
            (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
            (*sa).sin_port = 8080u16.to_be();
            (*sa).sin_addr.s_addr = u32::from(Ipv4Addr::new(127, 0, 0, 1)).to_be();
        }
        let addr = decode_sockaddr(&storage).unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn decode_v6() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let sa = &mut storage as *mut _ as *mut libc::sockaddr_in6;
        unsafe {
            (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
            (*sa).sin6_port = 443u16.to_be();
            (*sa).sin6_addr.s6_addr = Ipv6Addr::LOCALHOST.octets();
        }
        let addr = decode_sockaddr(&storage).unwrap();
        assert_eq!(addr, "[::1]:443".parse().unwrap());
    }

    #[test]
    fn decode_rejects_unknown_family() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        storage.ss_family = libc::AF_UNIX as libc::sa_family_t;
        assert!(decode_sockaddr(&storage).is_err());
    }

    #[test]
    fn local_addr_of_bound_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let expected = listener.local_addr().unwrap();
        use std::os::unix::io::AsRawFd;
        let got = local_addr(listener.as_raw_fd()).unwrap();
        assert_eq!(got, expected);
    }
}
