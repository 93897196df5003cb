// SPDX-License-Identifier: Apache-2.0

//! Resolver family calls.

use super::{offset_or_null, ret_zero, Argv, Call};
use crate::guest::addrinfo::AddrInfoList;
use crate::guest::alloc::{Alloc, Collector, OutRef};
use crate::item::resolver::{AddrInfo, Hints, Op, NI_MAXHOST, NI_MAXSERV};
use crate::item::socket::encode_addr;
use crate::item::Family;
use crate::Result;

use core::ffi::c_int;
use core::mem::{align_of, size_of};
use std::net::SocketAddr;

use libc::ENOENT;

const FAMILY: Family = Family::Resolver;

/// Resolves `node` and/or `service`.
///
/// The reply is written to all of the remaining data region. If the host needs more room,
/// it fails with `EOVERFLOW` and reports the data length it requires in `ret`.
pub struct Getaddrinfo<'a> {
    pub node: Option<&'a [u8]>,
    pub service: Option<&'a [u8]>,
    pub hints: Option<Hints>,
}

impl Call for Getaddrinfo<'_> {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<5>;
    type Staged = OutRef;
    type Collected = AddrInfoList;

    fn op(&self) -> usize {
        Op::Getaddrinfo as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        if self.node.is_none() && self.service.is_none() {
            return Err(ENOENT);
        }
        let node = self.node.map(|n| alloc.input_cstr(n)).transpose()?;
        let service = self.service.map(|s| alloc.input_cstr(s)).transpose()?;
        let hints = self.hints.as_ref().map(|h| alloc.input(h)).transpose()?;

        // All remaining bytes, so that a host-reported requirement is met after growing.
        let free = alloc.free::<u64>() * size_of::<u64>();
        let out = alloc.output(free.max(size_of::<AddrInfo>()), align_of::<AddrInfo>())?;
        Ok((
            Argv([
                offset_or_null(node.map(|r| r.offset())),
                offset_or_null(service.map(|r| r.offset())),
                offset_or_null(hints.map(|r| r.offset())),
                out.offset(),
                out.len(),
            ]),
            out,
        ))
    }

    fn collect(self, out: OutRef, ret: usize, col: &Collector<'_>) -> Result<AddrInfoList> {
        AddrInfoList::decode(col.bytes(out.region())?, ret)
    }
}

/// Translates a socket address into a host and a service name.
pub struct Getnameinfo {
    pub addr: SocketAddr,
    pub flags: c_int,
}

impl Call for Getnameinfo {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<5>;
    type Staged = (OutRef, OutRef);
    type Collected = (Vec<u8>, Vec<u8>);

    fn op(&self) -> usize {
        Op::Getnameinfo as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let (buf, len) = encode_addr(&self.addr);
        let addr = alloc.input_bytes(&buf[..len])?;
        let host = alloc.output(NI_MAXHOST, 1)?;
        let serv = alloc.output(NI_MAXSERV, 1)?;
        Ok((
            Argv([
                addr.offset(),
                addr.len(),
                host.offset(),
                serv.offset(),
                self.flags as _,
            ]),
            (host, serv),
        ))
    }

    fn collect(
        self,
        (host, serv): Self::Staged,
        ret: usize,
        col: &Collector<'_>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        ret_zero(FAMILY, ret)?;
        let host = col.cstr(host.region())?.to_vec();
        let serv = col.cstr(serv.region())?.to_vec();
        Ok((host, serv))
    }
}

/// Releases whatever resolver state the host keeps on behalf of this side.
pub struct Shutdown;

impl Call for Shutdown {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<0>;
    type Staged = ();
    type Collected = ();

    fn op(&self) -> usize {
        Op::Shutdown as _
    }

    fn stage(&self, _: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        Ok((Argv([]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
        ret_zero(FAMILY, ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NULL;

    use libc::EFAULT;

    #[test]
    fn getaddrinfo_uses_free_space() {
        let mut data = [0u8; 256];
        let mut alloc = Alloc::new(&mut data);
        let call = Getaddrinfo {
            node: Some(&b"localhost"[..]),
            service: None,
            hints: Some(Hints::default()),
        };
        let (argv, out) = call.stage(&mut alloc).unwrap();
        assert_eq!(argv.0[0], 0);
        assert_eq!(argv.0[1], NULL);
        assert_eq!(argv.0[2], 12);
        assert_eq!(out.offset(), 32);
        assert_eq!(out.len(), 224);
        assert!(!alloc.overflowed());
    }

    #[test]
    fn getaddrinfo_overflows_when_full() {
        let mut data = [0u8; 16];
        let mut alloc = Alloc::new(&mut data);
        let call = Getaddrinfo {
            node: Some(&b"localhost"[..]),
            service: None,
            hints: None,
        };
        call.stage(&mut alloc).unwrap();
        assert!(alloc.overflowed());
        assert_eq!(alloc.used(), 16 + size_of::<AddrInfo>());
    }

    #[test]
    fn getnameinfo_requires_nul() {
        let mut data = vec![0u8; 64 + NI_MAXHOST + NI_MAXSERV];
        let staged = {
            let mut alloc = Alloc::new(&mut data);
            let call = Getnameinfo {
                addr: "127.0.0.1:22".parse().unwrap(),
                flags: 0,
            };
            call.stage(&mut alloc).unwrap().1
        };
        let (host, serv) = staged;

        data[host.offset()..host.offset() + 9].copy_from_slice(b"localhost");
        data[serv.offset()..serv.offset() + 3].copy_from_slice(b"ssh");
        let col = Collector::new(&data);
        let call = Getnameinfo {
            addr: "127.0.0.1:22".parse().unwrap(),
            flags: 0,
        };
        assert_eq!(
            call.collect(staged, 0, &col),
            Ok((b"localhost".to_vec(), b"ssh".to_vec()))
        );

        data[host.offset()..host.offset() + host.len()].fill(b'x');
        let col = Collector::new(&data);
        let call = Getnameinfo {
            addr: "127.0.0.1:22".parse().unwrap(),
            flags: 0,
        };
        assert_eq!(call.collect(staged, 0, &col), Err(EFAULT));
    }
}
