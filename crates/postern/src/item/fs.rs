// SPDX-License-Identifier: Apache-2.0

//! Filesystem family item definitions

use super::{opcodes, HEADER_SIZE};
use crate::plain::Plain;

/// Maximum length of a path, including the terminating NUL byte.
pub const PATH_MAX: usize = 4096;

/// Capacity of the name buffer of a [`Dirent`], including the terminating NUL byte.
pub const NAME_CAPACITY: usize = 256;

/// Default arena size: two paths plus a 64 KiB I/O payload.
pub const DEFAULT_ARENA_SIZE: usize = HEADER_SIZE + 2 * PATH_MAX + 64 * 1024;

opcodes! {
    /// Filesystem family opcodes.
    pub enum Op {
        Open = 0x00,
        Close = 0x01,
        Lseek = 0x02,
        Stat = 0x03,
        Link = 0x04,
        Unlink = 0x05,
        Rename = 0x06,
        Truncate = 0x07,
        Mkdir = 0x08,
        Rmdir = 0x09,
        Opendir = 0x0a,
        Readdir = 0x0b,
        Closedir = 0x0c,
        Read = 0x0d,
        Write = 0x0e,
        Fstat = 0x0f,
        Ftruncate = 0x10,
    }
}

/// File status as transferred over the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime: i64,
    pub atime_nsec: i64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub ctime: i64,
    pub ctime_nsec: i64,
}

unsafe impl Plain for Stat {}

impl Stat {
    /// Returns `true` if the mode describes a directory.
    #[inline]
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Returns `true` if the mode describes a regular file.
    #[inline]
    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }
}

/// Directory entry as transferred over the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct Dirent {
    pub ino: u64,
    pub off: i64,
    pub kind: u32,
    pub namelen: u32,
    pub name: [u8; NAME_CAPACITY],
}

unsafe impl Plain for Dirent {}

impl Dirent {
    /// Returns the entry name, if `namelen` is in bounds.
    ///
    /// The value has been written by the host, so it is checked before use.
    #[inline]
    pub fn name(&self) -> Option<&[u8]> {
        let len = self.namelen as usize;
        if len == 0 || len >= NAME_CAPACITY || self.name[..len].contains(&0) {
            return None;
        }
        Some(&self.name[..len])
    }
}
