// SPDX-License-Identifier: Apache-2.0

//! Calls executable by [`Channel::execute`](super::Channel::execute).

pub mod epoll;
pub mod fs;
pub mod resolver;
pub mod socket;

use super::alloc::{Alloc, Collector};
use crate::item::{Family, ARGC};
use crate::{Result, NULL};

use core::ffi::c_int;

use libc::EFAULT;
use tracing::error;

/// Fixed-size argument vector, padded with [`NULL`] up to [`ARGC`] words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Argv<const N: usize>(pub [usize; N]);

impl<const N: usize> From<Argv<N>> for [usize; ARGC] {
    #[inline]
    fn from(argv: Argv<N>) -> Self {
        let mut out = [NULL; ARGC];
        for (dst, src) in out.iter_mut().zip(argv.0) {
            *dst = src;
        }
        out
    }
}

/// A call, which can be staged within a block and executed by the host.
///
/// A call goes through the stage and collect phases. [`stage`](Call::stage) allocates inputs
/// and outputs within the data region and returns the argument vector, which refers to them by
/// offset. [`collect`](Call::collect) is only invoked if the host reported success and is
/// responsible for validating `ret` and anything else the host wrote before using it.
pub trait Call {
    /// Device family serving the call.
    const FAMILY: Family;

    /// Argument vector.
    type Argv: Into<[usize; ARGC]>;

    /// Opaque staged value, which is passed to [`collect`](Call::collect).
    type Staged;

    /// Value the call collects as.
    type Collected;

    /// Returns the opcode of the call within its family.
    fn op(&self) -> usize;

    /// Allocates data, if necessary, and returns the argument vector and the staged value.
    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)>;

    /// Validates the reply and collects the result.
    fn collect(
        self,
        staged: Self::Staged,
        ret: usize,
        col: &Collector<'_>,
    ) -> Result<Self::Collected>;
}

/// Logs a reply the host was not allowed to produce and fails the call.
#[inline]
pub(crate) fn fault<T>(family: Family, what: &str, value: usize) -> Result<T> {
    error!(family = family.name(), value, "host returned invalid {what}");
    Err(EFAULT)
}

/// Validates `ret` as a newly-created file descriptor or handle.
#[inline]
pub(crate) fn ret_fd(family: Family, ret: usize) -> Result<c_int> {
    match c_int::try_from(ret) {
        Ok(fd) if fd >= 0 => Ok(fd),
        _ => fault(family, "descriptor", ret),
    }
}

/// Validates `ret` as a byte count no greater than `max`.
#[inline]
pub(crate) fn ret_len(family: Family, ret: usize, max: usize) -> Result<usize> {
    if ret > max {
        return fault(family, "length", ret);
    }
    Ok(ret)
}

/// Validates `ret` of a call, which only reports success.
#[inline]
pub(crate) fn ret_zero(family: Family, ret: usize) -> Result<()> {
    if ret != 0 {
        return fault(family, "return value", ret);
    }
    Ok(())
}

/// Encodes an optional offset.
#[inline]
pub(crate) fn offset_or_null(offset: Option<usize>) -> usize {
    offset.unwrap_or(NULL)
}
