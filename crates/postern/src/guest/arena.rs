// SPDX-License-Identifier: Apache-2.0

use crate::item::{Header, HEADER_SIZE};
use crate::plain::Plain;
use crate::{Result, MAX_ARENA_SIZE};

use core::mem::size_of;

use libc::{EINVAL, ENOMEM};

/// Shared memory arena used to marshal one request/reply pair at a time.
///
/// The arena is a [`Header`] followed by a data region. It is never resized in place;
/// growing it means dropping it and creating a bigger one.
#[derive(Debug)]
pub struct Arena {
    block: Box<[usize]>,
}

impl Arena {
    /// Creates a zeroed arena of at least `capacity` bytes, header included.
    ///
    /// Fails with [`EINVAL`] if the arena could not even hold a header and with
    /// [`ENOMEM`] if `capacity` exceeds [`MAX_ARENA_SIZE`].
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < HEADER_SIZE {
            return Err(EINVAL);
        }
        if capacity > MAX_ARENA_SIZE {
            return Err(ENOMEM);
        }
        let words = capacity.div_ceil(size_of::<usize>());
        Ok(Self {
            block: vec![0usize; words].into_boxed_slice(),
        })
    }

    /// Returns the size of the arena in bytes, header included.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.block.len() * size_of::<usize>()
    }

    /// Returns the size of the data region in bytes.
    #[inline]
    pub fn data_capacity(&self) -> usize {
        self.capacity() - HEADER_SIZE
    }

    /// Returns the raw block, as passed to the host.
    #[inline]
    pub fn block(&self) -> &[usize] {
        &self.block
    }

    /// Returns the raw block mutably, as passed to the host.
    #[inline]
    pub fn block_mut(&mut self) -> &mut [usize] {
        &mut self.block
    }

    /// Returns a copy of the header.
    #[inline]
    pub fn header(&self) -> Header {
        let (header, _) = self.split();
        // The block is always at least `HEADER_SIZE` bytes long.
        Header::read_from(header).unwrap_or_else(Header::zeroed)
    }

    /// Overwrites the header.
    #[inline]
    pub fn set_header(&mut self, header: &Header) {
        let (dst, _) = self.split_mut();
        dst.copy_from_slice(header.as_bytes());
    }

    /// Splits the arena into header bytes and the data region.
    #[inline]
    pub fn split(&self) -> (&[u8], &[u8]) {
        // SAFETY: `u8` has no alignment requirement and every byte of a `usize` is initialized.
        let (prefix, bytes, suffix) = unsafe { self.block.align_to::<u8>() };
        debug_assert!(prefix.is_empty());
        debug_assert!(suffix.is_empty());
        bytes.split_at(HEADER_SIZE)
    }

    /// Splits the arena mutably into header bytes and the data region.
    #[inline]
    pub fn split_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        // SAFETY: `u8` has no alignment requirement and every byte of a `usize` is initialized.
        let (prefix, bytes, suffix) = unsafe { self.block.align_to_mut::<u8>() };
        debug_assert!(prefix.is_empty());
        debug_assert!(suffix.is_empty());
        bytes.split_at_mut(HEADER_SIZE)
    }

    /// Zeroes the whole arena.
    #[inline]
    pub fn clear(&mut self) {
        self.block.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Family;

    #[test]
    fn capacity() {
        assert_eq!(Arena::new(HEADER_SIZE - 1).unwrap_err(), EINVAL);
        assert_eq!(Arena::new(MAX_ARENA_SIZE + 1).unwrap_err(), ENOMEM);

        let arena = Arena::new(HEADER_SIZE + 13).unwrap();
        assert_eq!(arena.capacity(), HEADER_SIZE + 16);
        assert_eq!(arena.data_capacity(), 16);
        assert_eq!(arena.split().1.len(), 16);
    }

    #[test]
    fn header() {
        let mut arena = Arena::new(HEADER_SIZE + 8).unwrap();
        assert_eq!(arena.header(), Header::zeroed());

        let header = Header::request(Family::Epoll, 5, [1, 2, 3, 4, 5, 6], 8);
        arena.set_header(&header);
        assert_eq!(arena.header(), header);
        assert_eq!(arena.block()[0], Family::Epoll as usize);
        assert_eq!(arena.block()[1], 5);

        arena.clear();
        assert_eq!(arena.header(), Header::zeroed());
    }
}
