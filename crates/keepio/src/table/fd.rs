// SPDX-License-Identifier: Apache-2.0

use super::Slot;
use crate::device::Device;

use core::ffi::c_int;
use std::sync::Arc;

use libc::{EADDRINUSE, EBADF, ENOMEM};
use postern::Result;
use spin::Mutex;
use tracing::trace;

/// Number of descriptors mirroring the host's stdin, stdout and stderr.
pub const STDIO_FDS: usize = 3;

const INITIAL_CAPACITY: usize = 16;

/// Maps file descriptors to live devices.
///
/// Descriptors `0..STDIO_FDS` are bound once and never released or reassigned. The table
/// doubles its capacity on demand up to its limit.
#[derive(Debug)]
pub struct FdTable {
    slots: Mutex<Vec<Slot>>,
    limit: usize,
}

impl FdTable {
    /// Creates a table of at most `limit` descriptors, stdio included.
    pub fn new(limit: usize) -> Self {
        let capacity = INITIAL_CAPACITY.min(limit).max(STDIO_FDS);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        // Stdio stays reserved until bound.
        for slot in slots.iter_mut().take(STDIO_FDS) {
            *slot = Slot::Reserved;
        }
        Self {
            slots: Mutex::new(slots),
            limit: limit.max(STDIO_FDS),
        }
    }

    /// Returns the maximum number of descriptors.
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Binds the stdio descriptors, once.
    pub fn bind_stdio(&self, devices: [Arc<Device>; STDIO_FDS]) -> Result<()> {
        let mut slots = self.slots.lock();
        if slots[..STDIO_FDS].iter().any(|slot| slot.live().is_some()) {
            return Err(EADDRINUSE);
        }
        for (slot, device) in slots.iter_mut().zip(devices) {
            *slot = Slot::Live(device);
        }
        Ok(())
    }

    /// Doubles the capacity, bounded by the limit.
    fn grow(&self, slots: &mut Vec<Slot>, min: usize) -> Result<()> {
        if min >= self.limit {
            return Err(ENOMEM);
        }
        let mut capacity = slots.len().max(1);
        while capacity <= min {
            capacity *= 2;
        }
        let capacity = capacity.min(self.limit);
        trace!(capacity, "grow fd table");
        slots.resize_with(capacity, Slot::default);
        Ok(())
    }

    fn reserve(&self, slots: &mut Vec<Slot>) -> Result<c_int> {
        let index = match slots.iter().skip(STDIO_FDS).position(Slot::is_free) {
            Some(i) => i + STDIO_FDS,
            None => {
                let index = slots.len();
                self.grow(slots, index)?;
                index
            }
        };
        slots[index] = Slot::Reserved;
        Ok(index as c_int)
    }

    /// Reserves the lowest free descriptor.
    ///
    /// Fails with [`ENOMEM`] once the limit is reached.
    pub fn allocate_fd(&self) -> Result<c_int> {
        let mut slots = self.slots.lock();
        let fd = self.reserve(&mut slots)?;
        trace!(fd, "allocate fd");
        Ok(fd)
    }

    /// Frees `fd`, returning the table's reference to its device.
    ///
    /// Releasing a free, unknown or stdio descriptor is a no-op. Other references to the
    /// device stay valid.
    pub fn release_fd(&self, fd: c_int) -> Option<Arc<Device>> {
        let index = usize::try_from(fd).ok().filter(|i| *i >= STDIO_FDS)?;
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index)?;
        if slot.is_free() {
            return None;
        }
        trace!(fd, "release fd");
        match core::mem::take(slot) {
            Slot::Live(device) => Some(device),
            _ => None,
        }
    }

    /// Binds `device` to the reserved `fd`.
    ///
    /// Fails with [`EBADF`] if `fd` was not allocated and with [`EADDRINUSE`] if `fd` is
    /// already bound or `device` is live at another descriptor. Aliases must be created
    /// with [`dup`](Self::dup).
    pub fn set_fd_device(&self, fd: c_int, device: Arc<Device>) -> Result<Arc<Device>> {
        let mut slots = self.slots.lock();
        let index = usize::try_from(fd).map_err(|_| EBADF)?;
        if slots
            .iter()
            .filter_map(Slot::live)
            .any(|live| Arc::ptr_eq(live, &device))
        {
            return Err(EADDRINUSE);
        }

        let slot = slots.get_mut(index).ok_or(EBADF)?;
        match *slot {
            Slot::Free => Err(EBADF),
            Slot::Live(_) => Err(EADDRINUSE),
            Slot::Reserved => {
                *slot = Slot::Live(device.clone());
                Ok(device)
            }
        }
    }

    /// Returns the device bound to `fd`, [`EBADF`] if there is none.
    pub fn get_fd_device(&self, fd: c_int) -> Result<Arc<Device>> {
        let slots = self.slots.lock();
        usize::try_from(fd)
            .ok()
            .and_then(|i| slots.get(i))
            .and_then(Slot::live)
            .cloned()
            .ok_or(EBADF)
    }

    /// Binds the lowest free descriptor to the device of `fd`.
    pub fn dup(&self, fd: c_int) -> Result<c_int> {
        let mut slots = self.slots.lock();
        let device = usize::try_from(fd)
            .ok()
            .and_then(|i| slots.get(i))
            .and_then(Slot::live)
            .cloned()
            .ok_or(EBADF)?;
        let new = self.reserve(&mut slots)?;
        slots[new as usize] = Slot::Live(device);
        trace!(fd, new, "dup");
        Ok(new)
    }

    /// Binds `new` to the device of `old`.
    ///
    /// Returns the device previously bound to `new`, which the caller releases outside of
    /// the table lock. Fails with [`EBADF`] if `old` is not live or `new` is a stdio or
    /// out-of-range descriptor.
    pub fn dup2(&self, old: c_int, new: c_int) -> Result<Option<Arc<Device>>> {
        let mut slots = self.slots.lock();
        let device = usize::try_from(old)
            .ok()
            .and_then(|i| slots.get(i))
            .and_then(Slot::live)
            .cloned()
            .ok_or(EBADF)?;
        if old == new {
            return Ok(None);
        }

        let index = usize::try_from(new)
            .ok()
            .filter(|i| (STDIO_FDS..self.limit).contains(i))
            .ok_or(EBADF)?;
        if index >= slots.len() {
            self.grow(&mut slots, index)?;
        }
        if matches!(slots[index], Slot::Reserved) {
            // Still being opened by another caller.
            return Err(EADDRINUSE);
        }
        trace!(old, new, "dup2");
        match core::mem::replace(&mut slots[index], Slot::Live(device)) {
            Slot::Live(previous) => Ok(Some(previous)),
            _ => Ok(None),
        }
    }

    /// Releases every descriptor but stdio, returning the devices.
    pub fn drain(&self) -> Vec<Arc<Device>> {
        let mut slots = self.slots.lock();
        slots
            .iter_mut()
            .skip(STDIO_FDS)
            .filter_map(|slot| match core::mem::take(slot) {
                Slot::Live(device) => Some(device),
                _ => None,
            })
            .collect()
    }

    /// Returns the number of live descriptors.
    pub fn live(&self) -> usize {
        let slots = self.slots.lock();
        slots.iter().filter(|slot| slot.live().is_some()).count()
    }
}
