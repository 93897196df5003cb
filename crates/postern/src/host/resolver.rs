// SPDX-License-Identifier: Apache-2.0

use super::{errno, Data, Failure, Reply};
use crate::item::resolver::{
    eai_to_errno, AddrInfo, Hints, Op, MAX_ADDRINFO, NI_MAXHOST, NI_MAXSERV,
};
use crate::item::socket::SOCKADDR_SIZE;
use crate::item::ARGC;
use crate::plain::Plain;
use crate::NULL;

use core::ffi::{c_char, c_int, CStr};
use core::mem::size_of;
use core::ptr::{null, null_mut};

use libc::{addrinfo, sockaddr, sockaddr_storage, EINVAL, EOVERFLOW};

/// Owned result list of `getaddrinfo`.
struct AddrInfoPtr(*mut addrinfo);

impl Drop for AddrInfoPtr {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { libc::freeaddrinfo(self.0) };
        }
    }
}

/// Serializes the chain at `head` relative to the start of the output region.
///
/// Records come first, followed by the addresses and canonical names they refer to.
fn serialize(head: &AddrInfoPtr) -> Vec<u8> {
    let mut records = Vec::new();
    let mut ai = head.0;
    while !ai.is_null() && records.len() < MAX_ADDRINFO {
        // SAFETY: `ai` is a valid element of a list returned by `getaddrinfo`.
        let entry = unsafe { &*ai };
        records.push(entry);
        ai = entry.ai_next;
    }

    let mut payload = Vec::new();
    let base = records.len() * size_of::<AddrInfo>();
    let mut out = Vec::with_capacity(base);
    for (i, entry) in records.iter().enumerate() {
        let addrlen = (entry.ai_addrlen as usize).min(SOCKADDR_SIZE);
        let addr = if entry.ai_addr.is_null() {
            NULL as u64
        } else {
            let offset = base + payload.len();
            // SAFETY: `ai_addr` points to `ai_addrlen` bytes.
            let bytes =
                unsafe { core::slice::from_raw_parts(entry.ai_addr as *const u8, addrlen) };
            payload.extend_from_slice(bytes);
            offset as u64
        };
        let canonname = if entry.ai_canonname.is_null() {
            NULL as u64
        } else {
            let offset = base + payload.len();
            // SAFETY: `ai_canonname` is a NUL-terminated string.
            let name = unsafe { CStr::from_ptr(entry.ai_canonname) };
            payload.extend_from_slice(name.to_bytes_with_nul());
            offset as u64
        };
        let next = if i + 1 < records.len() {
            ((i + 1) * size_of::<AddrInfo>()) as u64
        } else {
            NULL as u64
        };

        let record = AddrInfo {
            flags: entry.ai_flags,
            family: entry.ai_family,
            socktype: entry.ai_socktype,
            protocol: entry.ai_protocol,
            addrlen: addrlen as _,
            reserved: 0,
            addr,
            canonname,
            next,
        };
        out.extend_from_slice(record.as_bytes());
    }
    out.extend_from_slice(&payload);
    out
}

fn getaddrinfo(argv: &[usize; ARGC], data: &mut Data<'_>) -> Reply {
    let node = data.opt_cstr(argv[0])?.map(CStr::as_ptr).unwrap_or(null());
    let service = data.opt_cstr(argv[1])?.map(CStr::as_ptr).unwrap_or(null());
    let hints = match argv[2] {
        NULL => None,
        offset => {
            let hints: Hints = data.read(offset)?;
            let mut ai: addrinfo = unsafe { core::mem::zeroed() };
            ai.ai_flags = hints.flags;
            ai.ai_family = hints.family;
            ai.ai_socktype = hints.socktype;
            ai.ai_protocol = hints.protocol;
            Some(ai)
        }
    };
    let (out_offset, out_len) = (argv[3], argv[4]);
    data.bytes(out_offset, out_len)?;

    let mut res = AddrInfoPtr(null_mut());
    let hints_ptr = hints.as_ref().map_or(null(), |h| h as *const addrinfo);
    let rc = unsafe { libc::getaddrinfo(node, service, hints_ptr, &mut res.0) };
    if rc != 0 {
        return Err(eai_to_errno(rc, errno()).into());
    }

    let bytes = serialize(&res);
    if bytes.len() > out_len {
        return Err(Failure {
            err: EOVERFLOW,
            ret: out_offset + bytes.len(),
        });
    }
    data.bytes_mut(out_offset, bytes.len())?
        .copy_from_slice(&bytes);
    Ok(if res.0.is_null() { NULL } else { 0 })
}

fn getnameinfo(argv: &[usize; ARGC], data: &mut Data<'_>) -> Reply {
    let addr = data.bytes(argv[0], argv[1])?;
    if addr.len() > SOCKADDR_SIZE {
        return Err(EINVAL.into());
    }
    let mut storage: sockaddr_storage = unsafe { core::mem::zeroed() };
    // SAFETY: `addr` has been checked to fit `storage`.
    unsafe {
        core::ptr::copy_nonoverlapping(addr.as_ptr(), &mut storage as *mut _ as *mut u8, addr.len())
    };
    let addrlen = addr.len();

    // Validate the outputs before resolving.
    data.bytes(argv[2], NI_MAXHOST)?;
    data.bytes(argv[3], NI_MAXSERV)?;

    let mut host = [0 as c_char; NI_MAXHOST];
    let mut serv = [0 as c_char; NI_MAXSERV];
    let rc = unsafe {
        libc::getnameinfo(
            &storage as *const _ as *const sockaddr,
            addrlen as _,
            host.as_mut_ptr(),
            NI_MAXHOST as _,
            serv.as_mut_ptr(),
            NI_MAXSERV as _,
            argv[4] as c_int,
        )
    };
    if rc != 0 {
        return Err(eai_to_errno(rc, errno()).into());
    }

    let host = host.map(|c| c as u8);
    let serv = serv.map(|c| c as u8);
    data.bytes_mut(argv[2], NI_MAXHOST)?.copy_from_slice(&host);
    data.bytes_mut(argv[3], NI_MAXSERV)?.copy_from_slice(&serv);
    Ok(0)
}

pub(super) fn execute(op: Op, argv: &[usize; ARGC], mut data: Data<'_>) -> Reply {
    match op {
        Op::Getaddrinfo => getaddrinfo(argv, &mut data),
        Op::Getnameinfo => getnameinfo(argv, &mut data),
        Op::Shutdown => Ok(0),
    }
}
