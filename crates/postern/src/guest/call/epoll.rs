// SPDX-License-Identifier: Apache-2.0

//! Epoll family calls.

use super::{offset_or_null, ret_fd, ret_len, ret_zero, Argv, Call};
use crate::guest::alloc::{Alloc, Collector, OutRef};
use crate::item::epoll::{Event, Op, MAX_EVENTS};
use crate::item::Family;
use crate::plain::Plain;
use crate::Result;

use core::ffi::c_int;
use core::mem::{align_of, size_of};

use libc::{EFAULT, EINVAL};

const FAMILY: Family = Family::Epoll;

pub struct Create {
    pub size: c_int,
}

impl Call for Create {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<1>;
    type Staged = ();
    type Collected = c_int;

    fn op(&self) -> usize {
        Op::Create as _
    }

    fn stage(&self, _: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        if self.size <= 0 {
            return Err(EINVAL);
        }
        Ok((Argv([self.size as _]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<c_int> {
        ret_fd(FAMILY, ret)
    }
}

pub struct Create1 {
    pub flags: c_int,
}

impl Call for Create1 {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<1>;
    type Staged = ();
    type Collected = c_int;

    fn op(&self) -> usize {
        Op::Create1 as _
    }

    fn stage(&self, _: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        Ok((Argv([self.flags as _]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<c_int> {
        ret_fd(FAMILY, ret)
    }
}

/// `epoll_ctl` operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtlOp {
    Add,
    Del,
    Mod,
}

impl TryFrom<c_int> for CtlOp {
    type Error = crate::Error;

    fn try_from(op: c_int) -> Result<Self> {
        match op {
            libc::EPOLL_CTL_ADD => Ok(CtlOp::Add),
            libc::EPOLL_CTL_DEL => Ok(CtlOp::Del),
            libc::EPOLL_CTL_MOD => Ok(CtlOp::Mod),
            _ => Err(EINVAL),
        }
    }
}

pub struct Ctl {
    pub epfd: c_int,
    pub op: CtlOp,
    pub fd: c_int,
    pub event: Option<Event>,
}

impl Call for Ctl {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<3>;
    type Staged = ();
    type Collected = ();

    fn op(&self) -> usize {
        match self.op {
            CtlOp::Add => Op::CtlAdd as _,
            CtlOp::Del => Op::CtlDel as _,
            CtlOp::Mod => Op::CtlMod as _,
        }
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        let event = match (self.op, &self.event) {
            (CtlOp::Del, _) => None,
            (_, Some(event)) => Some(alloc.input(event)?.offset()),
            (_, None) => return Err(EINVAL),
        };
        Ok((Argv([self.epfd as _, self.fd as _, offset_or_null(event)]), ()))
    }

    fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
        ret_zero(FAMILY, ret)
    }
}

/// Waits for at most `maxevents` events, `timeout` is in milliseconds, `-1` blocks.
pub struct Wait {
    pub epfd: c_int,
    pub maxevents: usize,
    pub timeout: c_int,
}

impl Call for Wait {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<4>;
    type Staged = OutRef;
    type Collected = Vec<Event>;

    fn op(&self) -> usize {
        Op::Wait as _
    }

    fn stage(&self, alloc: &mut Alloc<'_>) -> Result<(Self::Argv, Self::Staged)> {
        if self.maxevents == 0 || self.maxevents > MAX_EVENTS {
            return Err(EINVAL);
        }
        let events = alloc.output(self.maxevents * size_of::<Event>(), align_of::<Event>())?;
        Ok((
            Argv([
                self.epfd as _,
                events.offset(),
                self.maxevents,
                self.timeout as isize as usize,
            ]),
            events,
        ))
    }

    fn collect(self, events: OutRef, ret: usize, col: &Collector<'_>) -> Result<Vec<Event>> {
        let count = ret_len(FAMILY, ret, self.maxevents)?;
        let bytes = col.prefix(events.region(), count * size_of::<Event>())?;
        bytes
            .chunks_exact(size_of::<Event>())
            .map(|chunk| Event::read_from(chunk).ok_or(EFAULT))
            .collect()
    }
}

/// Defines a call taking a single descriptor argument and returning nothing.
macro_rules! fd_call {
    ($name:ident => $op:expr) => {
        pub struct $name {
            pub epfd: c_int,
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
                Ok((Argv([self.epfd as _]), ()))
            }

            fn collect(self, _: (), ret: usize, _: &Collector<'_>) -> Result<()> {
                ret_zero(FAMILY, ret)
            }
        }
    };
}

fd_call!(Close => Op::Close);

/// Closes every epoll instance the host created on behalf of this side.
pub struct ShutdownDevice;

impl Call for ShutdownDevice {
    const FAMILY: Family = FAMILY;
    type Argv = Argv<0>;
    type Staged = ();
    type Collected = ();

    fn op(&self) -> usize {
        Op::ShutdownDevice as _
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
    use crate::item::epoll::Events;
    use crate::NULL;

    #[test]
    fn ctl_event() {
        let mut data = [0u8; 32];
        let mut alloc = Alloc::new(&mut data);

        let del = Ctl {
            epfd: 4,
            op: CtlOp::Del,
            fd: 5,
            event: Some(Event::new(Events::IN, 1)),
        };
        assert_eq!(del.stage(&mut alloc).unwrap().0, Argv([4, 5, NULL]));
        assert_eq!(del.op(), Op::CtlDel as usize);

        let add = Ctl {
            epfd: 4,
            op: CtlOp::Add,
            fd: 5,
            event: None,
        };
        assert_eq!(add.stage(&mut alloc).unwrap_err(), EINVAL);

        let add = Ctl {
            event: Some(Event::new(Events::IN, 1)),
            ..add
        };
        assert_eq!(add.stage(&mut alloc).unwrap().0, Argv([4, 5, 0]));
        assert_eq!(alloc.used(), size_of::<Event>());
    }

    #[test]
    fn wait_bounds() {
        let mut data = [0u8; 2 * 16];
        let staged = {
            let mut alloc = Alloc::new(&mut data);
            let wait = Wait {
                epfd: 3,
                maxevents: 0,
                timeout: -1,
            };
            assert_eq!(wait.stage(&mut alloc).unwrap_err(), EINVAL);

            let wait = Wait { maxevents: 2, ..wait };
            let (argv, staged) = wait.stage(&mut alloc).unwrap();
            assert_eq!(argv.0[3], usize::MAX);
            staged
        };

        data[..16].copy_from_slice(Event::new(Events::OUT, 42).as_bytes());
        let col = Collector::new(&data);
        let wait = || Wait {
            epfd: 3,
            maxevents: 2,
            timeout: -1,
        };

        assert_eq!(wait().collect(staged, 3, &col), Err(EFAULT));
        let events = wait().collect(staged, 1, &col).unwrap();
        assert_eq!(events, vec![Event::new(Events::OUT, 42)]);
    }
}
