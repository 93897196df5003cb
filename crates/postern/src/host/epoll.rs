// SPDX-License-Identifier: Apache-2.0

use super::{check, Data, Executor, Reply};
use crate::item::epoll::{Event, Op, MAX_EVENTS};
use crate::item::ARGC;

use core::ffi::c_int;
use core::mem::size_of;

use libc::{epoll_event, EINVAL, EPOLL_CLOEXEC};
use tracing::debug;

fn ctl(op: c_int, argv: &[usize; ARGC], data: &Data<'_>) -> Reply {
    let mut event = match op {
        libc::EPOLL_CTL_DEL => epoll_event { events: 0, u64: 0 },
        _ => {
            let event: Event = data.read(argv[2])?;
            epoll_event {
                events: event.events,
                u64: event.data,
            }
        }
    };
    Ok(check(unsafe { libc::epoll_ctl(argv[0] as _, op, argv[1] as _, &mut event) })?)
}

fn wait(argv: &[usize; ARGC], data: &mut Data<'_>) -> Reply {
    let maxevents = argv[2];
    if maxevents == 0 || maxevents > MAX_EVENTS {
        return Err(EINVAL.into());
    }
    // Validate before waiting, so that no event is consumed on a bad request.
    data.bytes(argv[1], maxevents * size_of::<Event>())?;

    let mut events = vec![epoll_event { events: 0, u64: 0 }; maxevents];
    let count = check(unsafe {
        libc::epoll_wait(
            argv[0] as _,
            events.as_mut_ptr(),
            maxevents as _,
            argv[3] as isize as c_int,
        )
    })?;

    for (i, event) in events.iter().take(count).enumerate() {
        // `epoll_event` may be packed, so copy the fields out first.
        let (mask, token) = (event.events, event.u64);
        let event = Event {
            events: mask,
            reserved: 0,
            data: token,
        };
        data.write(argv[1] + i * size_of::<Event>(), &event)?;
    }
    Ok(count)
}

pub(super) fn execute(exec: &Executor, op: Op, argv: &[usize; ARGC], mut data: Data<'_>) -> Reply {
    match op {
        Op::Create => {
            let epfd = check(unsafe { libc::epoll_create(argv[0] as _) })?;
            exec.epolls.lock().insert(epfd as _);
            Ok(epfd)
        }

        Op::Create1 => {
            let epfd = check(unsafe { libc::epoll_create1(argv[0] as c_int | EPOLL_CLOEXEC) })?;
            exec.epolls.lock().insert(epfd as _);
            Ok(epfd)
        }

        Op::CtlAdd => ctl(libc::EPOLL_CTL_ADD, argv, &data),
        Op::CtlDel => ctl(libc::EPOLL_CTL_DEL, argv, &data),
        Op::CtlMod => ctl(libc::EPOLL_CTL_MOD, argv, &data),

        Op::Wait => wait(argv, &mut data),

        Op::Close => {
            let epfd = argv[0] as c_int;
            let ret = check(unsafe { libc::close(epfd) })?;
            exec.epolls.lock().remove(&epfd);
            Ok(ret)
        }

        Op::ShutdownDevice => {
            let epolls = core::mem::take(&mut *exec.epolls.lock());
            debug!(count = epolls.len(), "shutting down epoll device");
            for epfd in epolls {
                unsafe { libc::close(epfd) };
            }
            Ok(0)
        }
    }
}
