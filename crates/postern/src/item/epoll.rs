// SPDX-License-Identifier: Apache-2.0

//! Epoll family item definitions

use super::{opcodes, HEADER_SIZE};
use crate::plain::Plain;

use core::mem::size_of;

use bitflags::bitflags;

/// Maximum number of events a single wait can deliver.
pub const MAX_EVENTS: usize = 256;

/// Default arena size: room for [`MAX_EVENTS`] delivered events.
pub const DEFAULT_ARENA_SIZE: usize = HEADER_SIZE + MAX_EVENTS * size_of::<Event>();

opcodes! {
    /// Epoll family opcodes.
    pub enum Op {
        Create = 0x00,
        Create1 = 0x01,
        CtlAdd = 0x02,
        CtlDel = 0x03,
        CtlMod = 0x04,
        Wait = 0x05,
        Close = 0x06,
        ShutdownDevice = 0x07,
    }
}

bitflags! {
    /// Readiness event mask.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Events: u32 {
        const IN = libc::EPOLLIN as u32;
        const PRI = libc::EPOLLPRI as u32;
        const OUT = libc::EPOLLOUT as u32;
        const ERR = libc::EPOLLERR as u32;
        const HUP = libc::EPOLLHUP as u32;
        const RDHUP = libc::EPOLLRDHUP as u32;
        const ET = libc::EPOLLET as u32;
        const ONESHOT = libc::EPOLLONESHOT as u32;
    }
}

impl Events {
    /// Events reported regardless of the requested mask.
    pub const ALWAYS: Events = Events::ERR.union(Events::HUP);
}

/// Epoll event as transferred over the wire.
///
/// Unlike [`libc::epoll_event`], this struct is never packed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct Event {
    pub events: u32,
    pub reserved: u32,
    pub data: u64,
}

unsafe impl Plain for Event {}

impl Event {
    #[inline]
    pub fn new(events: Events, data: u64) -> Self {
        Self {
            events: events.bits(),
            reserved: 0,
            data,
        }
    }

    /// Returns the known event bits, discarding anything else the host set.
    #[inline]
    pub fn events(&self) -> Events {
        Events::from_bits_truncate(self.events)
    }
}
