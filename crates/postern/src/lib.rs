// SPDX-License-Identifier: Apache-2.0

//! API for the enclave-host I/O boundary
//!
//! `postern` is a protocol crate for proxying I/O requests (file, socket, epoll and name
//! resolution operations) from code running inside an enclave to the untrusted host.
//! A [postern](https://en.wikipedia.org/wiki/Postern) is a secondary gate in a fortification,
//! used to come and go without opening the main entrance.
//!
//! # Mechanism of action
//!
//! Every device family (filesystem, socket, epoll, resolver) owns a [channel](guest::Channel),
//! which lazily creates a single shared [arena](guest::Arena). A call stages its arguments in the
//! arena, the guest passes control to the host exactly once via
//! [`Host::sally`](guest::Host::sally), and the reply is collected back out of the arena after it
//! has been validated.
//!
//! Guest and host side communicate via a mutually-distrusted shared block of memory.
//!
//! # Block format
//!
//! The arena is a [header](item::Header) followed by a data region:
//!
//! * `family`: `usize` - the [family](item::Family) of the request
//! * `op`: `usize` - the family-specific opcode
//! * `argv`: `[usize; 6]` - the arguments
//! * `ret`: `usize` - the return value, written by the host
//! * `err`: `usize` - the host errno, written by the host, `0` on success
//! * `data_len`: `usize` - the length of the data region in use
//! * `data`: `...` - data that can be referenced by the arguments
//!
//! Argument values may contain numeric values. However, all pointers MUST be translated to an
//! offset from the beginning of the data section and an absent pointer is encoded as [`NULL`].
//! The host MUST NOT write beyond `data_len` bytes of the data section and the guest MUST NOT
//! trust any offset or length written by the host without checking it against what it staged.

#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod guest;
pub mod host;
pub mod item;
pub mod plain;

/// Error type used within this crate.
pub type Error = libc::c_int;

/// Result type returned by functionality exposed by this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Internal representation of a null pointer or [`Option::None`] value in the block.
pub const NULL: usize = usize::MAX;

/// Upper bound on the capacity of any arena.
///
/// Size hints reported by the host beyond this value are treated as hostile.
pub const MAX_ARENA_SIZE: usize = 16 * 1024 * 1024;
