// SPDX-License-Identifier: Apache-2.0

//! Socket family calls.

use super::{ret_fd, ret_len, ret_zero, Argv, Call};
use crate::guest::alloc::{Alloc, Collector, InOutRef, InRef, OutRef};
use crate::item::socket::{decode_addr, encode_addr, Op, SOCKADDR_SIZE};
use crate::item::Family;
use crate::Result;

use core::ffi::c_int;
use std::net::SocketAddr;

use libc::socklen_t;

const FAMILY: Family = Family::Socket;

/// Output socket address together with its in/out length.
#[derive(Clone, Copy, Debug)]
pub struct StagedAddr {
    addr: OutRef,
    addrlen: InOutRef,
}

impl StagedAddr {
    fn stage(alloc: &mut Alloc<'_>) -> Result<Self> {
        let addr = alloc.output(SOCKADDR_SIZE, 8)?;
        let addrlen = alloc.inout(&(SOCKADDR_SIZE as socklen_t))?;
        Ok(Self { addr, addrlen })
    }

    /// Reads back the address the host wrote.
    ///
    /// Fails with `EFAULT` if the host reports a length greater than the staged buffer.
    /// Address families this side cannot represent decode as `None`.
    fn collect(self, col: &Collector<'_>) -> Result<Option<SocketAddr>> {
        let len: socklen_t = col.read(self.addrlen.region())?;
        let len = ret_len(FAMILY, len as _, self.addr.len())?;
        Ok(decode_addr(col.prefix(self.addr.region(), len)?).ok())
    }
}

fn stage_addr(alloc: &mut Alloc<'_>, addr: &SocketAddr) -> Result<InRef> {
    let (buf, len) = encode_addr(addr);
    alloc.input_bytes(&buf[..len])
}

pub struct Socket {
    pub domain: c_int,
    pub ty: c_int,
    pub protocol: c_int,
}

impl Call for Socket {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<3>;
    type Staged = ();
    type Collected = c_int;

    fn op(&self) -> usize {
        Op::Socket as _
    }

    fn stage(&self, _: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        Ok((Argv([self.domain as _, self.ty as _, self.protocol as _]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<c_int> {
        ret_fd(FAMILY, ret)
    }
}

/// Defines a call passing one socket address to the host.
macro_rules! addr_call {
    ($name:ident => $op:expr) => {
        pub struct $name {
            pub fd: c_int,
            pub addr: SocketAddr,
        }

        impl Call for $name {
            const FAMILY: Family = FAMILY;
            type Argv = Argv<3>;
            type Staged = ();
            type Collected = ();

            fn op(&self) -> usize {
                $op as _
            }

            fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
                let addr = stage_addr(alloc, &self.addr)?;
                Ok((Argv([self.fd as _, addr.offset(), addr.len()]), ()))
            }

            fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
                ret_zero(FAMILY, ret)
            }
        }
    };
}

/// Defines a call reading one socket address from the host.
macro_rules! name_call {
    ($name:ident => $op:expr) => {
        pub struct $name {
            pub fd: c_int,
        }

        impl Call for $name {
            const FAMILY: Family = FAMILY;
            type Argv = Argv<3>;
            type Staged = StagedAddr;
            type Collected = Option<SocketAddr>;

            fn op(&self) -> usize {
                $op as _
            }

            fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
                let addr = StagedAddr::stage(alloc)?;
                Ok((
                    Argv([self.fd as _, addr.addr.offset(), addr.addrlen.offset()]),
                    addr,
                ))
            }

            fn collect(
                self,
                addr: StagedAddr,
                ret: usize,
                col: &Collector<'_>,
            ) -> Result<Option<SocketAddr>> {
                ret_zero(FAMILY, ret)?;
                addr.collect(col)
            }
        }
    };
}

addr_call!(Connect => Op::Connect);
addr_call!(Bind => Op::Bind);
name_call!(Getsockname => Op::Getsockname);
name_call!(Getpeername => Op::Getpeername);

/// Accepts a connection, returning the new host descriptor and the peer address.
pub struct Accept {
    pub fd: c_int,
    pub flags: c_int,
}

impl Call for Accept {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<4>;
    type Staged = StagedAddr;
    type Collected = (c_int, Option<SocketAddr>);

    fn op(&self) -> usize {
        Op::Accept as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let addr = StagedAddr::stage(alloc)?;
        Ok((
            Argv([
                self.fd as _,
                addr.addr.offset(),
                addr.addrlen.offset(),
                self.flags as _,
            ]),
            addr,
        ))
    }

    fn collect(
        self,
        addr: StagedAddr,
        ret: usize,
        col: &Collector<'_>,
    ) -> Result<(c_int, Option<SocketAddr>)> {
        let fd = ret_fd(FAMILY, ret)?;
        Ok((fd, addr.collect(col)?))
    }
}

pub struct Listen {
    pub fd: c_int,
    pub backlog: c_int,
}

impl Call for Listen {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<2>;
    type Staged = ();
    type Collected = ();

    fn op(&self) -> usize {
        Op::Listen as _
    }

    fn stage(&self, _: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        Ok((Argv([self.fd as _, self.backlog as _]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
        ret_zero(FAMILY, ret)
    }
}

/// Receives at most `buf.len()` bytes, capped to the free space in the arena.
pub struct Recv<'a> {
    pub fd: c_int,
    pub buf: &'a mut [u8],
    pub flags: c_int,
}

impl Call for Recv<'_> {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<4>;
    type Staged = OutRef;
    type Collected = usize;

    fn op(&self) -> usize {
        Op::Recv as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let buf = alloc.output_max(self.buf.len())?;
        Ok((
            Argv([self.fd as _, buf.offset(), buf.len(), self.flags as _]),
            buf,
        ))
    }

    fn collect(self, buf: OutRef, ret: usize, col: &Collector<'_>) -> Result<usize> {
        let len = ret_len(FAMILY, ret, buf.len())?;
        self.buf[..len].copy_from_slice(col.prefix(buf.region(), len)?);
        Ok(len)
    }
}

/// Sends at most `buf.len()` bytes, capped to the free space in the arena.
pub struct Send<'a> {
    pub fd: c_int,
    pub buf: &'a [u8],
    pub flags: c_int,
}

impl Call for Send<'_> {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<4>;
    type Staged = InRef;
    type Collected = usize;

    fn op(&self) -> usize {
        Op::Send as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let buf = alloc.input_bytes_max(self.buf)?;
        Ok((
            Argv([self.fd as _, buf.offset(), buf.len(), self.flags as _]),
            buf,
        ))
    }

    fn collect(self, buf: InRef, ret: usize, _: &Collector<'_>) -> Result<usize> {
        ret_len(FAMILY, ret, buf.len())
    }
}

pub struct Shutdown {
    pub fd: c_int,
    pub how: c_int,
}

impl Call for Shutdown {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<2>;
    type Staged = ();
    type Collected = ();

    fn op(&self) -> usize {
        Op::Shutdown as _
    }

    fn stage(&self, _: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        Ok((Argv([self.fd as _, self.how as _]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
        ret_zero(FAMILY, ret)
    }
}

/// Reads a socket option into a buffer of `len` bytes.
pub struct Getsockopt {
    pub fd: c_int,
    pub level: c_int,
    pub name: c_int,
    pub len: usize,
}

impl Call for Getsockopt {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<5>;
    type Staged = (OutRef, InOutRef);
    type Collected = Vec<u8>;

    fn op(&self) -> usize {
        Op::Getsockopt as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let len = socklen_t::try_from(self.len).map_err(|_| libc::EINVAL)?;
        let value = alloc.output(self.len, 8)?;
        let optlen = alloc.inout(&len)?;
        Ok((
            Argv([
                self.fd as _,
                self.level as _,
                self.name as _,
                value.offset(),
                optlen.offset(),
            ]),
            (value, optlen),
        ))
    }

    fn collect(
        self,
        (value, optlen): Self::Staged,
        ret: usize,
        col: &Collector<'_>,
    ) -> Result<Vec<u8>> {
        ret_zero(FAMILY, ret)?;
        let len: socklen_t = col.read(optlen.region())?;
        let len = ret_len(FAMILY, len as _, value.len())?;
        Ok(col.prefix(value.region(), len)?.to_vec())
    }
}

pub struct Setsockopt<'a> {
    pub fd: c_int,
    pub level: c_int,
    pub name: c_int,
    pub value: &'a [u8],
}

impl Call for Setsockopt<'_> {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<5>;
    type Staged = ();
    type Collected = ();

    fn op(&self) -> usize {
        Op::Setsockopt as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let value = alloc.input_bytes(self.value)?;
        Ok((
            Argv([
                self.fd as _,
                self.level as _,
                self.name as _,
                value.offset(),
                value.len(),
            ]),
            (),
        ))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
        ret_zero(FAMILY, ret)
    }
}

pub struct Close {
    pub fd: c_int,
}

impl Call for Close {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<1>;
    type Staged = ();
    type Collected = ();

    fn op(&self) -> usize {
        Op::Close as _
    }

    fn stage(&self, _: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        Ok((Argv([self.fd as _]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
        ret_zero(FAMILY, ret)
    }
}
