// SPDX-License-Identifier: Apache-2.0

//! Resolver family item definitions

use super::{opcodes, HEADER_SIZE};
use crate::plain::Plain;
use crate::Error;

use libc::{EAFNOSUPPORT, EAGAIN, EINVAL, EIO, ENOENT, ENOMEM, EOVERFLOW, ESOCKTNOSUPPORT};

/// Maximum length of a host name returned by `getnameinfo`, including the NUL byte.
pub const NI_MAXHOST: usize = 1025;

/// Maximum length of a service name returned by `getnameinfo`, including the NUL byte.
pub const NI_MAXSERV: usize = 32;

/// Maximum number of records accepted in an address info chain.
pub const MAX_ADDRINFO: usize = 64;

/// Default arena size.
pub const DEFAULT_ARENA_SIZE: usize = HEADER_SIZE + 4096;

opcodes! {
    /// Resolver family opcodes.
    pub enum Op {
        Getaddrinfo = 0x00,
        Getnameinfo = 0x01,
        Shutdown = 0x02,
    }
}

/// `getaddrinfo` hints as transferred over the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Hints {
    pub flags: i32,
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
}

unsafe impl Plain for Hints {}

/// One record of an address info chain as written by the host.
///
/// `addr`, `canonname` and `next` are byte offsets into the data region of the block,
/// or [`NULL`](crate::NULL). They are host-controlled and MUST be validated before use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct AddrInfo {
    pub flags: i32,
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub addrlen: u32,
    pub reserved: u32,
    pub addr: u64,
    pub canonname: u64,
    pub next: u64,
}

unsafe impl Plain for AddrInfo {}

/// Maps a `getaddrinfo`/`getnameinfo` error code onto the errno carried in the reply.
///
/// `errno` is the value of the host's `errno` at the time of the failure and is only used
/// for `EAI_SYSTEM`.
pub fn eai_to_errno(eai: i32, errno: Error) -> Error {
    match eai {
        libc::EAI_AGAIN => EAGAIN,
        libc::EAI_NONAME | libc::EAI_SERVICE => ENOENT,
        libc::EAI_FAMILY => EAFNOSUPPORT,
        libc::EAI_SOCKTYPE => ESOCKTNOSUPPORT,
        libc::EAI_MEMORY => ENOMEM,
        libc::EAI_BADFLAGS => EINVAL,
        libc::EAI_OVERFLOW => EOVERFLOW,
        libc::EAI_SYSTEM if errno != 0 => errno,
        _ => EIO,
    }
}
