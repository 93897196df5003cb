// SPDX-License-Identifier: Apache-2.0

use super::Slot;
use crate::device::Device;

use std::sync::Arc;

use libc::{EADDRINUSE, EINVAL, ENOMEM};
use postern::Result;
use spin::Mutex;
use tracing::trace;

/// Device id
pub type DevId = u64;

/// Requests the lowest free dynamic id.
pub const DEVID_NONE: DevId = 0;
pub const DEVID_HOST_FILESYSTEM: DevId = 1;
pub const DEVID_ENCLAVE_FILESYSTEM: DevId = 2;
pub const DEVID_HOST_SOCKET: DevId = 3;
pub const DEVID_ENCLAVE_SOCKET: DevId = 4;
pub const DEVID_EPOLL: DevId = 5;
pub const DEVID_HOST_RESOLVER: DevId = 6;
pub const DEVID_ENCLAVE_RESOLVER: DevId = 7;

/// First id handed out for [`DEVID_NONE`].
pub const DEVID_FIRST_DYNAMIC: DevId = 8;

/// Maximum number of device ids.
pub const MAX_DEVICES: usize = 1024;

/// Maps device ids to template devices.
///
/// Templates never represent a live resource, they only exist to be duplicated.
#[derive(Debug, Default)]
pub struct DeviceTable {
    slots: Mutex<Vec<Slot>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `id`, or the lowest free dynamic id for [`DEVID_NONE`].
    ///
    /// Fails with [`EADDRINUSE`] if `id` is taken and with [`ENOMEM`] if the table is full.
    pub fn allocate_device_id(&self, id: DevId) -> Result<DevId> {
        let mut slots = self.slots.lock();

        let index = match id {
            DEVID_NONE => {
                let first = DEVID_FIRST_DYNAMIC as usize;
                let free = slots
                    .iter()
                    .enumerate()
                    .skip(first)
                    .find(|(_, slot)| slot.is_free())
                    .map(|(i, _)| i);
                free.unwrap_or(slots.len().max(first))
            }
            id => usize::try_from(id).map_err(|_| ENOMEM)?,
        };
        if index >= MAX_DEVICES {
            return Err(ENOMEM);
        }

        if index >= slots.len() {
            slots.resize_with(index + 1, Slot::default);
        }
        if !slots[index].is_free() {
            return Err(EADDRINUSE);
        }
        slots[index] = Slot::Reserved;
        trace!(id = index, "allocate device id");
        Ok(index as DevId)
    }

    /// Binds `device` to the reserved `id`.
    ///
    /// Fails with [`EINVAL`] if `id` was not allocated and with [`EADDRINUSE`] if it is
    /// already bound.
    pub fn set_device_for_id(&self, id: DevId, device: Arc<Device>) -> Result<Arc<Device>> {
        let mut slots = self.slots.lock();
        let slot = Self::slot(&mut slots, id)?;
        match *slot {
            Slot::Free => Err(EINVAL),
            Slot::Live(_) => Err(EADDRINUSE),
            Slot::Reserved => {
                *slot = Slot::Live(device.clone());
                Ok(device)
            }
        }
    }

    /// Returns the template bound to `id`, [`EINVAL`] if there is none.
    pub fn get_device_for_id(&self, id: DevId) -> Result<Arc<Device>> {
        let mut slots = self.slots.lock();
        Self::slot(&mut slots, id)?.live().cloned().ok_or(EINVAL)
    }

    /// Frees `id`, returning its template if one was bound.
    ///
    /// Releasing a free id is a no-op.
    pub fn release_device_id(&self, id: DevId) -> Option<Arc<Device>> {
        let mut slots = self.slots.lock();
        let slot = Self::slot(&mut slots, id).ok()?;
        trace!(id, "release device id");
        match core::mem::take(slot) {
            Slot::Live(device) => Some(device),
            _ => None,
        }
    }

    /// Returns the ids of all bound templates.
    pub fn ids(&self) -> Vec<DevId> {
        let slots = self.slots.lock();
        slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.live().is_some())
            .map(|(i, _)| i as DevId)
            .collect()
    }

    fn slot(slots: &mut [Slot], id: DevId) -> Result<&mut Slot> {
        if id == DEVID_NONE {
            return Err(EINVAL);
        }
        usize::try_from(id)
            .ok()
            .and_then(|i| slots.get_mut(i))
            .ok_or(EINVAL)
    }
}
