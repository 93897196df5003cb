// SPDX-License-Identifier: Apache-2.0

//! Device and file descriptor tables
//!
//! Both tables are slot arrays guarded by a spin lock. A slot is free, reserved (allocated
//! but not yet bound to a device) or live. Critical sections never call into a device.

mod device;
mod fd;

pub use device::*;
pub use fd::*;

use crate::device::Device;

use std::sync::Arc;

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Free,
    Reserved,
    Live(Arc<Device>),
}

impl Slot {
    #[inline]
    fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }

    #[inline]
    fn live(&self) -> Option<&Arc<Device>> {
        match self {
            Self::Live(device) => Some(device),
            _ => None,
        }
    }
}
