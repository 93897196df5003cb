// SPDX-License-Identifier: Apache-2.0

//! Socket family item definitions

use super::{opcodes, HEADER_SIZE};
use crate::Result;

use core::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use libc::{sa_family_t, sockaddr_storage, socklen_t, AF_INET, AF_INET6, EAFNOSUPPORT, EINVAL};

/// Size of the socket address buffer staged for every address argument.
pub const SOCKADDR_SIZE: usize = size_of::<sockaddr_storage>();

/// The maximum size of a UDP packet
///
/// The maximum UDP message size is 65507, as determined by the following formula:
/// 0xffff - (sizeof(minimal IP Header) + sizeof(UDP Header)) = 65535-(20+8) = 65507
pub const MAX_UDP_PACKET_SIZE: usize = 65507;

/// Default arena size: an address, its length and one UDP packet worth of payload.
pub const DEFAULT_ARENA_SIZE: usize =
    HEADER_SIZE + SOCKADDR_SIZE + size_of::<socklen_t>() + MAX_UDP_PACKET_SIZE + 5;

const SOCKADDR_IN_SIZE: usize = size_of::<libc::sockaddr_in>();
const SOCKADDR_IN6_SIZE: usize = size_of::<libc::sockaddr_in6>();

opcodes! {
    /// Socket family opcodes.
    pub enum Op {
        Socket = 0x00,
        Connect = 0x01,
        Accept = 0x02,
        Bind = 0x03,
        Listen = 0x04,
        Recv = 0x05,
        Send = 0x06,
        Shutdown = 0x07,
        Getsockopt = 0x08,
        Setsockopt = 0x09,
        Getsockname = 0x0a,
        Getpeername = 0x0b,
        Close = 0x0c,
    }
}

/// Encodes `addr` in the kernel `sockaddr` layout.
///
/// Returns the buffer and the number of meaningful bytes in it.
pub fn encode_addr(addr: &SocketAddr) -> ([u8; SOCKADDR_SIZE], usize) {
    let mut buf = [0u8; SOCKADDR_SIZE];
    match addr {
        SocketAddr::V4(addr) => {
            buf[..2].copy_from_slice(&(AF_INET as sa_family_t).to_ne_bytes());
            buf[2..4].copy_from_slice(&addr.port().to_be_bytes());
            buf[4..8].copy_from_slice(&addr.ip().octets());
            (buf, SOCKADDR_IN_SIZE)
        }
        SocketAddr::V6(addr) => {
            buf[..2].copy_from_slice(&(AF_INET6 as sa_family_t).to_ne_bytes());
            buf[2..4].copy_from_slice(&addr.port().to_be_bytes());
            buf[4..8].copy_from_slice(&addr.flowinfo().to_be_bytes());
            buf[8..24].copy_from_slice(&addr.ip().octets());
            buf[24..28].copy_from_slice(&addr.scope_id().to_ne_bytes());
            (buf, SOCKADDR_IN6_SIZE)
        }
    }
}

/// Decodes a kernel `sockaddr` from the meaningful bytes in `buf`.
///
/// The bytes may come from the host, so every length is checked.
pub fn decode_addr(buf: &[u8]) -> Result<SocketAddr> {
    let family = buf
        .get(..2)
        .map(|b| sa_family_t::from_ne_bytes([b[0], b[1]]))
        .ok_or(EINVAL)?;

    match family as i32 {
        AF_INET if buf.len() >= SOCKADDR_IN_SIZE => {
            let port = u16::from_be_bytes([buf[2], buf[3]]);
            let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            Ok(SocketAddrV4::new(ip, port).into())
        }
        AF_INET6 if buf.len() >= SOCKADDR_IN6_SIZE => {
            let port = u16::from_be_bytes([buf[2], buf[3]]);
            let flowinfo = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[8..24]);
            let scope_id = u32::from_ne_bytes([buf[24], buf[25], buf[26], buf[27]]);
            Ok(SocketAddrV6::new(Ipv6Addr::from(octets), port, flowinfo, scope_id).into())
        }
        AF_INET | AF_INET6 => Err(EINVAL),
        _ => Err(EAFNOSUPPORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes() {
        assert_eq!(Op::try_from(0x05), Ok(Op::Recv));
        assert_eq!(Op::try_from(Op::Close as usize), Ok(Op::Close));
        assert_eq!(Op::try_from(0x0d), Err(libc::ENOSYS));
    }

    #[test]
    fn addr_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (buf, len) = encode_addr(&addr);
        assert_eq!(len, SOCKADDR_IN_SIZE);

        // Compare against the libc layout
        let sin: libc::sockaddr_in = unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const _) };
        assert_eq!(sin.sin_family, AF_INET as sa_family_t);
        assert_eq!(u16::from_be(sin.sin_port), 8080);
        assert_eq!(u32::from_be(sin.sin_addr.s_addr), 0x7f000001);

        assert_eq!(decode_addr(&buf[..len]), Ok(addr));
    }

    #[test]
    fn addr_v6() {
        let addr: SocketAddr = "[::1]:443".parse().unwrap();
        let (buf, len) = encode_addr(&addr);
        assert_eq!(len, SOCKADDR_IN6_SIZE);
        assert_eq!(decode_addr(&buf[..len]), Ok(addr));
    }

    #[test]
    fn addr_truncated() {
        let addr: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let (buf, _) = encode_addr(&addr);
        assert_eq!(decode_addr(&buf[..7]), Err(EINVAL));
        assert_eq!(decode_addr(&buf[..1]), Err(EINVAL));
        assert_eq!(decode_addr(&[0xff, 0xff, 0, 0]), Err(EAFNOSUPPORT));
    }
}
