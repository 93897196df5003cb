// SPDX-License-Identifier: Apache-2.0

//! Shared `postern` item definitions.

pub mod epoll;
pub mod fs;
pub mod resolver;
pub mod socket;

use crate::plain::Plain;
use crate::Error;

use core::convert::TryFrom;
use core::mem::size_of;

use libc::EINVAL;

/// Number of argument words in a [`Header`].
pub const ARGC: usize = 6;

/// Size in bytes of the [`Header`] at the start of every block.
pub const HEADER_SIZE: usize = size_of::<Header>();

/// Defines a family opcode enum together with its `TryFrom<usize>` decoding.
macro_rules! opcodes {
    (
        $(#[$attr:meta])*
        pub enum $name:ident {
            $($(#[$vattr:meta])* $variant:ident = $value:expr,)*
        }
    ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(usize)]
        pub enum $name {
            $($(#[$vattr])* $variant = $value,)*
        }

        impl core::convert::TryFrom<usize> for $name {
            type Error = $crate::Error;

            #[inline]
            fn try_from(op: usize) -> core::result::Result<Self, Self::Error> {
                match op {
                    $(op if op == $name::$variant as usize => Ok($name::$variant),)*
                    _ => Err(libc::ENOSYS),
                }
            }
        }
    };
}

pub(crate) use opcodes;

/// Device family a request belongs to.
///
/// Every family owns its own arena and its own opcode space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Family {
    Fs = 0x01,
    Socket = 0x02,
    Epoll = 0x03,
    Resolver = 0x04,
}

impl Family {
    /// All families, in declaration order.
    pub const ALL: [Family; 4] = [Family::Fs, Family::Socket, Family::Epoll, Family::Resolver];

    /// Returns a human readable name of the family.
    pub const fn name(self) -> &'static str {
        match self {
            Family::Fs => "fs",
            Family::Socket => "socket",
            Family::Epoll => "epoll",
            Family::Resolver => "resolver",
        }
    }
}

impl TryFrom<usize> for Family {
    type Error = Error;

    #[inline]
    fn try_from(family: usize) -> Result<Self, Self::Error> {
        match family {
            family if family == Family::Fs as _ => Ok(Family::Fs),
            family if family == Family::Socket as _ => Ok(Family::Socket),
            family if family == Family::Epoll as _ => Ok(Family::Epoll),
            family if family == Family::Resolver as _ => Ok(Family::Resolver),
            _ => Err(EINVAL),
        }
    }
}

/// `postern` block header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct Header {
    pub family: usize,
    pub op: usize,
    pub argv: [usize; ARGC],
    pub ret: usize,
    pub err: usize,
    pub data_len: usize,
}

unsafe impl Plain for Header {}

impl Header {
    /// Returns a request header with the reply fields cleared.
    #[inline]
    pub fn request(family: Family, op: usize, argv: [usize; ARGC], data_len: usize) -> Self {
        Self {
            family: family as _,
            op,
            argv,
            ret: 0,
            err: 0,
            data_len,
        }
    }
}
