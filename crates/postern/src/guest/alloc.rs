// SPDX-License-Identifier: Apache-2.0

//! Allocation-specific functionality.

use crate::item::fs::PATH_MAX;
use crate::plain::Plain;
use crate::Result;

use core::mem::{align_of, size_of};

use libc::{EFAULT, EINVAL, ENAMETOOLONG, EOVERFLOW};

/// A region of the data section, identified by its byte offset and length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    offset: usize,
    len: usize,
}

impl Region {
    /// Byte offset of the region within the data section.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the region is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Input reference: written by the guest, read by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InRef(Region);

/// Output reference: written by the host, read by the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutRef(Region);

/// Inout reference: written by the guest, updated by the host and read back by the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InOutRef(Region);

macro_rules! region_ref {
    ($($t:ty),*) => {
        $(impl $t {
            #[inline]
            pub fn offset(&self) -> usize {
                self.0.offset
            }

            #[inline]
            pub fn len(&self) -> usize {
                self.0.len
            }

            #[inline]
            pub fn is_empty(&self) -> bool {
                self.0.len == 0
            }

            #[inline]
            pub fn region(&self) -> Region {
                self.0
            }
        })*
    };
}

region_ref!(InRef, OutRef, InOutRef);

/// Bump allocator over the data region of an arena in stage phase.
///
/// Allocation never fails because of missing space: the allocator keeps counting the bytes
/// a call needs, so that a call, which does not fit, can report exactly how big the arena
/// has to be. Nothing is written once the data region has been exhausted.
#[derive(Debug)]
pub struct Alloc<'a> {
    data: &'a mut [u8],
    /// Byte offset of the next allocation.
    offset: usize,
}

impl<'a> Alloc<'a> {
    /// Constructs and returns a new allocator ready to use.
    #[inline]
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Returns the number of bytes the staged allocations require.
    #[inline]
    pub fn used(&self) -> usize {
        self.offset
    }

    /// Returns `true` if the staged allocations do not fit the data region.
    #[inline]
    pub fn overflowed(&self) -> bool {
        self.offset > self.data.len()
    }

    /// Returns amount of elements of type `T` that can still be allocated.
    #[inline]
    pub fn free<T>(&self) -> usize {
        let start = align_up(self.offset, align_of::<T>()).unwrap_or(usize::MAX);
        self.data.len().saturating_sub(start) / size_of::<T>().max(1)
    }

    #[inline]
    fn allocate(&mut self, len: usize, align: usize) -> Result<Region> {
        let offset = align_up(self.offset, align).ok_or(EOVERFLOW)?;
        self.offset = offset.checked_add(len).ok_or(EOVERFLOW)?;
        Ok(Region { offset, len })
    }

    #[inline]
    fn slot(&mut self, region: Region) -> Option<&mut [u8]> {
        self.data.get_mut(region.offset..region.offset + region.len)
    }

    /// Allocates an input and copies `bytes` into it.
    pub fn input_bytes(&mut self, bytes: &[u8]) -> Result<InRef> {
        let region = self.allocate(bytes.len(), 1)?;
        if let Some(slot) = self.slot(region) {
            slot.copy_from_slice(bytes);
        }
        Ok(InRef(region))
    }

    /// Allocates an input of type `T` and copies `value` into it.
    pub fn input<T: Plain>(&mut self, value: &T) -> Result<InRef> {
        let region = self.allocate(size_of::<T>(), align_of::<T>())?;
        if let Some(slot) = self.slot(region) {
            slot.copy_from_slice(value.as_bytes());
        }
        Ok(InRef(region))
    }

    /// Allocates a NUL-terminated string input holding `s`.
    ///
    /// Fails with [`EINVAL`] if `s` contains a NUL byte and with [`ENAMETOOLONG`] if it does
    /// not fit [`PATH_MAX`].
    pub fn input_cstr(&mut self, s: &[u8]) -> Result<InRef> {
        if s.contains(&0) {
            return Err(EINVAL);
        }
        if s.len() >= PATH_MAX {
            return Err(ENAMETOOLONG);
        }
        let region = self.allocate(s.len() + 1, 1)?;
        if let Some(slot) = self.slot(region) {
            let (body, nul) = slot.split_at_mut(s.len());
            body.copy_from_slice(s);
            nul[0] = 0;
        }
        Ok(InRef(region))
    }

    /// Allocates a zeroed output of `len` bytes aligned to `align`.
    pub fn output(&mut self, len: usize, align: usize) -> Result<OutRef> {
        let region = self.allocate(len, align)?;
        if let Some(slot) = self.slot(region) {
            slot.fill(0);
        }
        Ok(OutRef(region))
    }

    /// Allocates a zeroed output for one `T`.
    #[inline]
    pub fn output_of<T: Plain>(&mut self) -> Result<OutRef> {
        self.output(size_of::<T>(), align_of::<T>())
    }

    /// Allocates a zeroed output of at most `len` bytes depending on capacity.
    ///
    /// A non-empty request is never shrunk to nothing: if no byte is left, the full
    /// length is allocated and the call overflows.
    pub fn output_max(&mut self, len: usize) -> Result<OutRef> {
        let free = self.free::<u8>();
        self.output(if free == 0 { len } else { len.min(free) }, 1)
    }

    /// Allocates an input of at most `bytes.len()` bytes depending on capacity and copies
    /// the corresponding prefix of `bytes` into it.
    ///
    /// A non-empty request is never shrunk to nothing.
    pub fn input_bytes_max(&mut self, bytes: &[u8]) -> Result<InRef> {
        let free = self.free::<u8>();
        let len = if free == 0 {
            bytes.len()
        } else {
            bytes.len().min(free)
        };
        self.input_bytes(&bytes[..len])
    }

    /// Allocates an inout of type `T` and copies `value` into it.
    pub fn inout<T: Plain>(&mut self, value: &T) -> Result<InOutRef> {
        self.input(value).map(|InRef(region)| InOutRef(region))
    }

    /// Allocates an inout of `len` bytes holding `bytes` followed by zeroes.
    pub fn inout_bytes(&mut self, bytes: &[u8], len: usize) -> Result<InOutRef> {
        if bytes.len() > len {
            return Err(EINVAL);
        }
        let region = self.allocate(len, 1)?;
        if let Some(slot) = self.slot(region) {
            let (head, tail) = slot.split_at_mut(bytes.len());
            head.copy_from_slice(bytes);
            tail.fill(0);
        }
        Ok(InOutRef(region))
    }
}

/// Read access to the data region in collection phase.
///
/// All accessors are bounded by the data region the guest staged. Regions handed out by
/// [`Alloc`] are always in bounds; anything derived from values the host wrote is checked.
#[derive(Debug)]
pub struct Collector<'a> {
    data: &'a [u8],
}

impl<'a> Collector<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Returns the whole staged data region.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Returns the bytes of an output region.
    #[inline]
    pub fn bytes(&self, region: Region) -> Result<&'a [u8]> {
        self.data
            .get(region.offset..region.offset + region.len)
            .ok_or(EFAULT)
    }

    /// Returns the first `len` bytes of an output region.
    ///
    /// `len` is typically a host-written count, so it is checked against the region.
    #[inline]
    pub fn prefix(&self, region: Region, len: usize) -> Result<&'a [u8]> {
        if len > region.len {
            return Err(EFAULT);
        }
        self.bytes(Region {
            offset: region.offset,
            len,
        })
    }

    /// Reads a `T` from the start of an output region.
    #[inline]
    pub fn read<T: Plain>(&self, region: Region) -> Result<T> {
        if region.len < size_of::<T>() {
            return Err(EFAULT);
        }
        T::read_from(self.bytes(region)?).ok_or(EFAULT)
    }

    /// Reads a NUL-terminated string from an output region.
    ///
    /// Fails with [`EFAULT`] if the region holds no NUL byte.
    pub fn cstr(&self, region: Region) -> Result<&'a [u8]> {
        let bytes = self.bytes(region)?;
        let len = bytes.iter().position(|b| *b == 0).ok_or(EFAULT)?;
        Ok(&bytes[..len])
    }
}

#[inline]
fn align_up(offset: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    offset.checked_add(align - 1).map(|v| v & !(align - 1))
}
