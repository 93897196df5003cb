// SPDX-License-Identifier: Apache-2.0

use super::{check, Data, Reply};
use crate::item::socket::{Op, SOCKADDR_SIZE};
use crate::item::ARGC;
use crate::Result;

use core::ffi::c_int;

use libc::{sockaddr, sockaddr_storage, socklen_t, EINVAL, SOCK_CLOEXEC};

/// Copies a guest-supplied socket address into properly aligned storage.
fn addr_in(data: &Data<'_>, offset: usize, len: usize) -> Result<(sockaddr_storage, socklen_t)> {
    if len > SOCKADDR_SIZE {
        return Err(EINVAL);
    }
    let bytes = data.bytes(offset, len)?;
    let mut storage: sockaddr_storage = unsafe { core::mem::zeroed() };
    // SAFETY: `storage` is `SOCKADDR_SIZE` bytes long and `len` has been checked against it.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), &mut storage as *mut _ as *mut u8, len)
    };
    Ok((storage, len as _))
}

/// Calls `f` with storage for a socket address and writes the result back to the guest.
///
/// `addrlen` is the offset of the in/out address length, which bounds the amount written.
fn addr_out(
    data: &mut Data<'_>,
    addr: usize,
    addrlen: usize,
    f: impl FnOnce(*mut sockaddr, *mut socklen_t) -> c_int,
) -> Result<usize> {
    let capacity = (data.read::<socklen_t>(addrlen)? as usize).min(SOCKADDR_SIZE);
    // Validate before executing, so that no resource is created on a bad request.
    data.bytes(addr, capacity)?;

    let mut storage: sockaddr_storage = unsafe { core::mem::zeroed() };
    let mut len = capacity as socklen_t;
    let ret = check(f(&mut storage as *mut _ as *mut sockaddr, &mut len))?;

    let written = (len as usize).min(capacity);
    // SAFETY: `storage` is `SOCKADDR_SIZE` bytes long and `written` does not exceed it.
    let bytes =
        unsafe { core::slice::from_raw_parts(&storage as *const _ as *const u8, written) };
    data.bytes_mut(addr, written)?.copy_from_slice(bytes);
    data.write(addrlen, &len)?;
    Ok(ret)
}

pub(super) fn execute(op: Op, argv: &[usize; ARGC], mut data: Data<'_>) -> Reply {
    let fd = argv[0] as c_int;
    let ret = match op {
        Op::Socket => check(unsafe {
            libc::socket(argv[0] as _, argv[1] as c_int | SOCK_CLOEXEC, argv[2] as _)
        })?,

        Op::Connect => {
            let (addr, len) = addr_in(&data, argv[1], argv[2])?;
            check(unsafe { libc::connect(fd, &addr as *const _ as *const sockaddr, len) })?
        }

        Op::Bind => {
            let (addr, len) = addr_in(&data, argv[1], argv[2])?;
            check(unsafe { libc::bind(fd, &addr as *const _ as *const sockaddr, len) })?
        }

        Op::Accept => {
            let flags = argv[3] as c_int | SOCK_CLOEXEC;
            addr_out(&mut data, argv[1], argv[2], |addr, len| unsafe {
                libc::accept4(fd, addr, len, flags)
            })?
        }

        Op::Getsockname => addr_out(&mut data, argv[1], argv[2], |addr, len| unsafe {
            libc::getsockname(fd, addr, len)
        })?,

        Op::Getpeername => addr_out(&mut data, argv[1], argv[2], |addr, len| unsafe {
            libc::getpeername(fd, addr, len)
        })?,

        Op::Listen => check(unsafe { libc::listen(fd, argv[1] as _) })?,

        Op::Recv => {
            let buf = data.bytes_mut(argv[1], argv[2])?;
            check(unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), argv[3] as _) })?
        }

        Op::Send => {
            let buf = data.bytes(argv[1], argv[2])?;
            check(unsafe {
                libc::send(
                    fd,
                    buf.as_ptr().cast(),
                    buf.len(),
                    argv[3] as c_int | libc::MSG_NOSIGNAL,
                )
            })?
        }

        Op::Shutdown => check(unsafe { libc::shutdown(fd, argv[1] as _) })?,

        Op::Getsockopt => {
            let mut len: socklen_t = data.read(argv[4])?;
            let value = data.bytes_mut(argv[3], len as _)?;
            check(unsafe {
                libc::getsockopt(
                    fd,
                    argv[1] as _,
                    argv[2] as _,
                    value.as_mut_ptr().cast(),
                    &mut len,
                )
            })?;
            data.write(argv[4], &len)?;
            0
        }

        Op::Setsockopt => {
            let value = data.bytes(argv[3], argv[4])?;
            let len = socklen_t::try_from(value.len()).map_err(|_| EINVAL)?;
            check(unsafe {
                libc::setsockopt(fd, argv[1] as _, argv[2] as _, value.as_ptr().cast(), len)
            })?
        }

        Op::Close => check(unsafe { libc::close(fd) })?,
    };
    Ok(ret)
}
