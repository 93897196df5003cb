// SPDX-License-Identifier: Apache-2.0

//! Filesystem family calls.
//!
//! Paths are passed without the terminating NUL byte, which is appended when staged.

use super::{fault, ret_fd, ret_len, ret_zero, Argv, Call};
use crate::guest::alloc::{Alloc, Collector, InRef, OutRef};
use crate::item::fs::{Dirent, Op, Stat};
use crate::item::Family;
use crate::Result;

use core::ffi::c_int;

use libc::{mode_t, off_t};

const FAMILY: Family = Family::Fs;

pub struct Open<'a> {
    pub path: &'a [u8],
    pub flags: c_int,
    pub mode: mode_t,
}

impl Call for Open<'_> {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<3>;
    type Staged = ();
    type Collected = c_int;

    fn op(&self) -> usize {
        Op::Open as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let path = alloc.input_cstr(self.path)?;
        Ok((Argv([path.offset(), self.flags as _, self.mode as _]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<c_int> {
        ret_fd(FAMILY, ret)
    }
}

/// Defines a call taking a single descriptor argument and returning nothing.
macro_rules! fd_call {
    ($(#[$attr:meta])* $name:ident => $op:expr) => {
        $(#[$attr])*
        pub struct $name {
            pub fd: c_int,
        }

        impl Call for $name {
            const FAMILY: Family = FAMILY;
            type Argv = Argv<1>;
            type Staged = ();
            type Collected = ();

            fn op(&self) -> usize {
                $op as _
            }

            fn stage(&self, _: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
                Ok((Argv([self.fd as _]), ()))
            }

            fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
                ret_zero(FAMILY, ret)
            }
        }
    };
}

/// Defines a call taking a single path argument and returning nothing.
macro_rules! path_call {
    ($name:ident => $op:expr) => {
        pub struct $name<'a> {
            pub path: &'a [u8],
        }

        impl Call for $name<'_> {
            const FAMILY: Family = FAMILY;
            type Argv = Argv<1>;
            type Staged = ();
            type Collected = ();

            fn op(&self) -> usize {
                $op as _
            }

            fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
                let path = alloc.input_cstr(self.path)?;
                Ok((Argv([path.offset()]), ()))
            }

            fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
                ret_zero(FAMILY, ret)
            }
        }
    };
}

/// Defines a call taking two path arguments and returning nothing.
macro_rules! path2_call {
    ($name:ident => $op:expr) => {
        pub struct $name<'a> {
            pub old: &'a [u8],
            pub new: &'a [u8],
        }

        impl Call for $name<'_> {
            const FAMILY: Family = FAMILY;
            type Argv = Argv<2>;
            type Staged = ();
            type Collected = ();

            fn op(&self) -> usize {
                $op as _
            }

            fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
                let old = alloc.input_cstr(self.old)?;
                let new = alloc.input_cstr(self.new)?;
                Ok((Argv([old.offset(), new.offset()]), ()))
            }

            fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
                ret_zero(FAMILY, ret)
            }
        }
    };
}

fd_call!(Close => Op::Close);
path_call!(Unlink => Op::Unlink);
path_call!(Rmdir => Op::Rmdir);
path2_call!(Link => Op::Link);
path2_call!(Rename => Op::Rename);

pub struct Lseek {
    pub fd: c_int,
    pub offset: off_t,
    pub whence: c_int,
}

impl Call for Lseek {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<3>;
    type Staged = ();
    type Collected = off_t;

    fn op(&self) -> usize {
        Op::Lseek as _
    }

    fn stage(&self, _: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        Ok((Argv([self.fd as _, self.offset as _, self.whence as _]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<off_t> {
        match off_t::try_from(ret) {
            Ok(offset) => Ok(offset),
            Err(_) => fault(FAMILY, "offset", ret),
        }
    }
}

/// `stat` of a path.
pub struct StatPath<'a> {
    pub path: &'a [u8],
}

impl Call for StatPath<'_> {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<2>;
    type Staged = OutRef;
    type Collected = Stat;

    fn op(&self) -> usize {
        Op::Stat as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let path = alloc.input_cstr(self.path)?;
        let stat = alloc.output_of::<Stat>()?;
        Ok((Argv([path.offset(), stat.offset()]), stat))
    }

    fn collect(self, stat: OutRef, ret: usize, col: &Collector<'_>) -> Result<Stat> {
        ret_zero(FAMILY, ret)?;
        col.read(stat.region())
    }
}

pub struct Fstat {
    pub fd: c_int,
}

impl Call for Fstat {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<2>;
    type Staged = OutRef;
    type Collected = Stat;

    fn op(&self) -> usize {
        Op::Fstat as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let stat = alloc.output_of::<Stat>()?;
        Ok((Argv([self.fd as _, stat.offset()]), stat))
    }

    fn collect(self, stat: OutRef, ret: usize, col: &Collector<'_>) -> Result<Stat> {
        ret_zero(FAMILY, ret)?;
        col.read(stat.region())
    }
}

pub struct Truncate<'a> {
    pub path: &'a [u8],
    pub length: off_t,
}

impl Call for Truncate<'_> {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<2>;
    type Staged = ();
    type Collected = ();

    fn op(&self) -> usize {
        Op::Truncate as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let path = alloc.input_cstr(self.path)?;
        Ok((Argv([path.offset(), self.length as _]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
        ret_zero(FAMILY, ret)
    }
}

pub struct Ftruncate {
    pub fd: c_int,
    pub length: off_t,
}

impl Call for Ftruncate {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<2>;
    type Staged = ();
    type Collected = ();

    fn op(&self) -> usize {
        Op::Ftruncate as _
    }

    fn stage(&self, _: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        Ok((Argv([self.fd as _, self.length as _]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
        ret_zero(FAMILY, ret)
    }
}

pub struct Mkdir<'a> {
    pub path: &'a [u8],
    pub mode: mode_t,
}

impl Call for Mkdir<'_> {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<2>;
    type Staged = ();
    type Collected = ();

    fn op(&self) -> usize {
        Op::Mkdir as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let path = alloc.input_cstr(self.path)?;
        Ok((Argv([path.offset(), self.mode as _]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
        ret_zero(FAMILY, ret)
    }
}

/// Opens a directory stream, returning an opaque host handle.
pub struct Opendir<'a> {
    pub path: &'a [u8],
}

impl Call for Opendir<'_> {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<1>;
    type Staged = ();
    type Collected = usize;

    fn op(&self) -> usize {
        Op::Opendir as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let path = alloc.input_cstr(self.path)?;
        Ok((Argv([path.offset()]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<usize> {
        if ret == crate::NULL {
            return fault(FAMILY, "directory handle", ret);
        }
        Ok(ret)
    }
}

/// Reads the next entry of a directory stream, `None` at the end of the stream.
pub struct Readdir {
    pub handle: usize,
}

impl Call for Readdir {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<2>;
    type Staged = OutRef;
    type Collected = Option<Dirent>;

    fn op(&self) -> usize {
        Op::Readdir as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let dirent = alloc.output_of::<Dirent>()?;
        Ok((Argv([self.handle, dirent.offset()]), dirent))
    }

    fn collect(self, dirent: OutRef, ret: usize, col: &Collector<'_>) -> Result<Option<Dirent>> {
        match ret {
            0 => Ok(None),
            1 => {
                let dirent: Dirent = col.read(dirent.region())?;
                if dirent.name().is_none() {
                    return fault(FAMILY, "directory entry name length", dirent.namelen as _);
                }
                Ok(Some(dirent))
            }
            _ => fault(FAMILY, "return value", ret),
        }
    }
}

pub struct Closedir {
    pub handle: usize,
}

impl Call for Closedir {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<1>;
    type Staged = ();
    type Collected = ();

    fn op(&self) -> usize {
        Op::Closedir as _
    }

    fn stage(&self, _: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        Ok((Argv([self.handle]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
        ret_zero(FAMILY, ret)
    }
}

/// Reads at most `buf.len()` bytes.
///
/// The amount actually requested is capped to the free space in the arena, so a
/// successful read may be short even if more data is available.
pub struct Read<'a> {
    pub fd: c_int,
    pub buf: &'a mut [u8],
}

impl Call for Read<'_> {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<3>;
    type Staged = OutRef;
    type Collected = usize;

    fn op(&self) -> usize {
        Op::Read as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let buf = alloc.output_max(self.buf.len())?;
        Ok((Argv([self.fd as _, buf.offset(), buf.len()]), buf))
    }

    fn collect(self, buf: OutRef, ret: usize, col: &Collector<'_>) -> Result<usize> {
        let len = ret_len(FAMILY, ret, buf.len())?;
        self.buf[..len].copy_from_slice(col.prefix(buf.region(), len)?);
        Ok(len)
    }
}

/// Writes at most `buf.len()` bytes, capped to the free space in the arena.
pub struct Write<'a> {
    pub fd: c_int,
    pub buf: &'a [u8],
}

impl Call for Write<'_> {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<3>;
    type Staged = InRef;
    type Collected = usize;

    fn op(&self) -> usize {
        Op::Write as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let buf = alloc.input_bytes_max(self.buf)?;
        Ok((Argv([self.fd as _, buf.offset(), buf.len()]), buf))
    }

    fn collect(self, buf: InRef, ret: usize, _: &Collector<'_>) -> Result<usize> {
        ret_len(FAMILY, ret, buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::fs::NAME_CAPACITY;
    use crate::plain::Plain;
    use crate::NULL;

    use libc::EFAULT;

    #[test]
    fn stage_rename() {
        let mut buf = [0u8; 32];
        let mut alloc = Alloc::new(&mut buf);
        let call = Rename {
            old: b"/a",
            new: b"/bc",
        };
        let (argv, ()) = call.stage(&mut alloc).unwrap();
        assert_eq!(argv, Argv([0, 3]));
        assert_eq!(alloc.used(), 7);
        assert_eq!(&buf[..7], b"/a\0/bc\0");
    }

    #[test]
    fn read_rejects_long_ret() {
        let mut data = [0u8; 16];
        let mut out = [0u8; 8];
        let (argv, staged) = {
            let mut alloc = Alloc::new(&mut data);
            Read {
                fd: 3,
                buf: &mut out,
            }
            .stage(&mut alloc)
            .unwrap()
        };
        assert_eq!(argv.0[2], 8);

        data[..8].copy_from_slice(b"abcdefgh");
        let col = Collector::new(&data);
        let read = Read {
            fd: 3,
            buf: &mut out,
        };
        assert_eq!(read.collect(staged, 9, &col), Err(EFAULT));

        let read = Read {
            fd: 3,
            buf: &mut out,
        };
        assert_eq!(read.collect(staged, 4, &col), Ok(4));
        assert_eq!(&out[..4], b"abcd");
        assert_eq!(&out[4..], &[0; 4]);
    }

    #[test]
    fn readdir_validates_name() {
        let mut data = vec![0u8; core::mem::size_of::<Dirent>()];
        let staged = {
            let mut alloc = Alloc::new(&mut data);
            Readdir { handle: 1 }.stage(&mut alloc).unwrap().1
        };

        let mut dirent = Dirent {
            ino: 7,
            off: 1,
            kind: libc::DT_REG as _,
            namelen: NAME_CAPACITY as _,
            name: [b'x'; NAME_CAPACITY],
        };
        data.copy_from_slice(dirent.as_bytes());
        let col = Collector::new(&data);
        assert_eq!(Readdir { handle: 1 }.collect(staged, 1, &col), Err(EFAULT));
        assert_eq!(Readdir { handle: 1 }.collect(staged, 0, &col), Ok(None));
        assert_eq!(Readdir { handle: 1 }.collect(staged, 2, &col), Err(EFAULT));

        dirent.namelen = 3;
        dirent.name[3] = 0;
        data.copy_from_slice(dirent.as_bytes());
        let col = Collector::new(&data);
        let entry = Readdir { handle: 1 }.collect(staged, 1, &col).unwrap().unwrap();
        assert_eq!(entry.name(), Some(&b"xxx"[..]));
    }

    #[test]
    fn opendir_rejects_null() {
        let col = Collector::new(&[]);
        assert_eq!(
            Opendir { path: b"/" }.collect((), NULL, &col),
            Err(EFAULT)
        );
    }
}
