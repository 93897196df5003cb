// SPDX-License-Identifier: Apache-2.0

use super::{check, errno, Data, Dir, Executor, Reply};
use crate::item::fs::{Dirent, Op, Stat, NAME_CAPACITY};
use crate::item::ARGC;

use core::ffi::c_int;
use core::mem::MaybeUninit;

use libc::{mode_t, off_t, EBADF, O_CLOEXEC};

fn convert(st: &libc::stat) -> Stat {
    Stat {
        dev: st.st_dev as _,
        ino: st.st_ino as _,
        mode: st.st_mode as _,
        nlink: st.st_nlink as _,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as _,
        size: st.st_size as _,
        blksize: st.st_blksize as _,
        blocks: st.st_blocks as _,
        atime: st.st_atime as _,
        atime_nsec: st.st_atime_nsec as _,
        mtime: st.st_mtime as _,
        mtime_nsec: st.st_mtime_nsec as _,
        ctime: st.st_ctime as _,
        ctime_nsec: st.st_ctime_nsec as _,
    }
}

fn readdir(exec: &Executor, handle: usize, out: usize, mut data: Data<'_>) -> Reply {
    let dirs = exec.dirs.lock();
    let dir = dirs.get(&handle).ok_or(EBADF)?;

    // `readdir` reports errors only through errno.
    unsafe { *libc::__errno_location() = 0 };
    let entry = unsafe { libc::readdir(dir.0) };
    if entry.is_null() {
        return match std::io::Error::last_os_error().raw_os_error() {
            Some(0) | None => Ok(0),
            Some(err) => Err(err.into()),
        };
    }
    let entry = unsafe { &*entry };

    let mut dirent = Dirent {
        ino: entry.d_ino as _,
        off: entry.d_off as _,
        kind: entry.d_type as _,
        namelen: 0,
        name: [0; NAME_CAPACITY],
    };
    for (dst, src) in dirent.name.iter_mut().zip(entry.d_name.iter()) {
        if *src == 0 {
            break;
        }
        *dst = *src as u8;
        dirent.namelen += 1;
    }
    data.write(out, &dirent)?;
    Ok(1)
}

pub(super) fn execute(exec: &Executor, op: Op, argv: &[usize; ARGC], mut data: Data<'_>) -> Reply {
    let ret = match op {
        Op::Open => {
            let path = data.cstr(argv[0])?;
            let flags = argv[1] as c_int | O_CLOEXEC;
            check(unsafe { libc::open(path.as_ptr(), flags, argv[2] as mode_t) })?
        }

        Op::Close => check(unsafe { libc::close(argv[0] as _) })?,

        Op::Lseek => check(unsafe { libc::lseek(argv[0] as _, argv[1] as off_t, argv[2] as _) })?,

        Op::Stat => {
            let mut st = MaybeUninit::<libc::stat>::uninit();
            let path = data.cstr(argv[0])?;
            check(unsafe { libc::stat(path.as_ptr(), st.as_mut_ptr()) })?;
            data.write(argv[1], &convert(unsafe { st.assume_init_ref() }))?;
            0
        }

        Op::Fstat => {
            let mut st = MaybeUninit::<libc::stat>::uninit();
            check(unsafe { libc::fstat(argv[0] as _, st.as_mut_ptr()) })?;
            data.write(argv[1], &convert(unsafe { st.assume_init_ref() }))?;
            0
        }

        Op::Link => {
            let old = data.cstr(argv[0])?;
            let new = data.cstr(argv[1])?;
            check(unsafe { libc::link(old.as_ptr(), new.as_ptr()) })?
        }

        Op::Rename => {
            let old = data.cstr(argv[0])?;
            let new = data.cstr(argv[1])?;
            check(unsafe { libc::rename(old.as_ptr(), new.as_ptr()) })?
        }

        Op::Unlink => {
            let path = data.cstr(argv[0])?;
            check(unsafe { libc::unlink(path.as_ptr()) })?
        }

        Op::Rmdir => {
            let path = data.cstr(argv[0])?;
            check(unsafe { libc::rmdir(path.as_ptr()) })?
        }

        Op::Mkdir => {
            let path = data.cstr(argv[0])?;
            check(unsafe { libc::mkdir(path.as_ptr(), argv[1] as mode_t) })?
        }

        Op::Truncate => {
            let path = data.cstr(argv[0])?;
            check(unsafe { libc::truncate(path.as_ptr(), argv[1] as off_t) })?
        }

        Op::Ftruncate => check(unsafe { libc::ftruncate(argv[0] as _, argv[1] as off_t) })?,

        Op::Opendir => {
            let path = data.cstr(argv[0])?;
            let dir = unsafe { libc::opendir(path.as_ptr()) };
            if dir.is_null() {
                return Err(errno().into());
            }
            exec.insert_dir(Dir(dir))
        }

        Op::Readdir => return readdir(exec, argv[0], argv[1], data),

        Op::Closedir => {
            let dir = exec.dirs.lock().remove(&argv[0]).ok_or(EBADF)?;
            check(dir.close())?
        }

        Op::Read => {
            let buf = data.bytes_mut(argv[1], argv[2])?;
            check(unsafe { libc::read(argv[0] as _, buf.as_mut_ptr().cast(), buf.len()) })?
        }

        Op::Write => {
            let buf = data.bytes(argv[1], argv[2])?;
            check(unsafe { libc::write(argv[0] as _, buf.as_ptr().cast(), buf.len()) })?
        }
    };
    Ok(ret)
}
