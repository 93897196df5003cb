// SPDX-License-Identifier: Apache-2.0

//! Host-specific functionality.
//!
//! The [`Executor`] receives a block, dispatches the request to the real OS call and writes
//! the return value and errno back into the header. Offsets and lengths in the request are
//! supplied by the guest and are bounds-checked against `data_len` before use.

mod epoll;
mod fs;
mod resolver;
mod socket;

use crate::guest::Host;
use crate::item::{Family, Header, HEADER_SIZE};
use crate::plain::Plain;
use crate::{Error, Result};

use core::ffi::{c_int, CStr};
use core::mem::size_of;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::{HashMap, HashSet};

use libc::{EFAULT, EINVAL, EIO};
use spin::Mutex;
use tracing::{debug, trace};

/// Failed request: the errno and the value to report in `ret`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Failure {
    err: Error,
    ret: usize,
}

impl From<Error> for Failure {
    #[inline]
    fn from(err: Error) -> Self {
        Self { err, ret: 0 }
    }
}

type Reply = core::result::Result<usize, Failure>;

/// Returns the calling thread's errno.
#[inline]
pub(crate) fn errno() -> Error {
    std::io::Error::last_os_error()
        .raw_os_error()
        .filter(|e| *e != 0)
        .unwrap_or(EIO)
}

/// Converts the return value of a libc function, which sets errno on failure.
#[inline]
pub(crate) fn check<T: TryInto<usize> + Copy + PartialOrd + Default>(ret: T) -> Result<usize> {
    if ret < T::default() {
        return Err(errno());
    }
    ret.try_into().map_err(|_| EIO)
}

/// Guest-supplied data region, bounded by `data_len`.
pub(crate) struct Data<'a> {
    data: &'a mut [u8],
}

impl<'a> Data<'a> {
    #[inline]
    fn range(&self, offset: usize, len: usize) -> Result<core::ops::Range<usize>> {
        let end = offset.checked_add(len).ok_or(EFAULT)?;
        if end > self.data.len() {
            return Err(EFAULT);
        }
        Ok(offset..end)
    }

    #[inline]
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let range = self.range(offset, len)?;
        Ok(&self.data[range])
    }

    #[inline]
    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let range = self.range(offset, len)?;
        Ok(&mut self.data[range])
    }

    /// Returns the NUL-terminated string at `offset`.
    #[inline]
    pub fn cstr(&self, offset: usize) -> Result<&CStr> {
        let bytes = self.data.get(offset..).ok_or(EFAULT)?;
        CStr::from_bytes_until_nul(bytes).map_err(|_| EFAULT)
    }

    /// Returns the NUL-terminated string at `offset`, `None` if `offset` is `NULL`.
    #[inline]
    pub fn opt_cstr(&self, offset: usize) -> Result<Option<&CStr>> {
        match offset {
            crate::NULL => Ok(None),
            offset => self.cstr(offset).map(Some),
        }
    }

    #[inline]
    pub fn read<T: Plain>(&self, offset: usize) -> Result<T> {
        T::read_from(self.bytes(offset, size_of::<T>())?).ok_or(EFAULT)
    }

    #[inline]
    pub fn write<T: Plain>(&mut self, offset: usize, value: &T) -> Result<()> {
        self.bytes_mut(offset, size_of::<T>())?
            .copy_from_slice(value.as_bytes());
        Ok(())
    }
}

/// Open directory stream.
struct Dir(*mut libc::DIR);

// SAFETY: a `DIR` stream is only ever accessed under the executor's lock.
unsafe impl Send for Dir {}

impl Dir {
    fn close(self) -> c_int {
        let dir = self.0;
        core::mem::forget(self);
        unsafe { libc::closedir(dir) }
    }
}

impl Drop for Dir {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.0) };
    }
}

/// Host-side request executor.
///
/// Keeps the host resources, which cannot be expressed as plain descriptors: directory
/// streams keyed by opaque handles and the set of epoll instances created on behalf of the
/// guest.
#[derive(Default)]
pub struct Executor {
    dirs: Mutex<HashMap<usize, Dir>>,
    next_dir: AtomicUsize,
    epolls: Mutex<HashSet<c_int>>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executes the request in `block` and writes the reply into its header.
    ///
    /// Fails with [`EINVAL`] if the block cannot even hold a header. Any other failure is
    /// reported in the header.
    pub fn execute(&self, block: &mut [usize]) -> Result<()> {
        // SAFETY: `u8` has no alignment requirement and every byte of a `usize` is initialized.
        let (_, bytes, _) = unsafe { block.align_to_mut::<u8>() };
        if bytes.len() < HEADER_SIZE {
            return Err(EINVAL);
        }
        let (header, data) = bytes.split_at_mut(HEADER_SIZE);
        let mut request = Header::read_from(header).ok_or(EINVAL)?;

        let reply = match data.get_mut(..request.data_len) {
            Some(data) => self.dispatch(&request, Data { data }),
            None => Err(EFAULT.into()),
        };
        match reply {
            Ok(ret) => {
                request.ret = ret;
                request.err = 0;
            }
            Err(Failure { err, ret }) => {
                request.ret = ret;
                request.err = err as _;
            }
        }
        trace!(
            family = request.family,
            op = request.op,
            ret = request.ret,
            err = request.err,
            "executed"
        );
        header.copy_from_slice(request.as_bytes());
        Ok(())
    }

    fn dispatch(&self, request: &Header, data: Data<'_>) -> Reply {
        let argv = &request.argv;
        match Family::try_from(request.family)? {
            Family::Fs => fs::execute(self, request.op.try_into()?, argv, data),
            Family::Socket => socket::execute(request.op.try_into()?, argv, data),
            Family::Epoll => epoll::execute(self, request.op.try_into()?, argv, data),
            Family::Resolver => resolver::execute(request.op.try_into()?, argv, data),
        }
    }

    fn insert_dir(&self, dir: Dir) -> usize {
        let handle = self.next_dir.fetch_add(1, Ordering::Relaxed);
        self.dirs.lock().insert(handle, dir);
        handle
    }
}

impl Host for Executor {
    #[inline]
    fn sally(&self, block: &mut [usize]) -> Result<()> {
        self.execute(block)
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        let epolls = core::mem::take(&mut *self.epolls.lock());
        if !epolls.is_empty() {
            debug!(count = epolls.len(), "closing epoll instances");
        }
        for epfd in epolls {
            unsafe { libc::close(epfd) };
        }
    }
}
