// SPDX-License-Identifier: Apache-2.0

use crate::device::Device;

use core::cell::Cell;
use std::sync::Arc;

use postern::{Error, Result};

/// Per-caller state threaded through every [`Registry`](crate::Registry) call.
///
/// Holds the errno of the last failed call and an optional default device, which pins all
/// path operations of this context to one filesystem, bypassing the mount table.
#[derive(Debug, Default)]
pub struct Context {
    default_device: Option<Arc<Device>>,
    errno: Cell<Error>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a context resolving every path on `device`.
    pub fn with_default_device(device: Arc<Device>) -> Self {
        Self {
            default_device: Some(device),
            errno: Cell::new(0),
        }
    }

    #[inline]
    pub fn default_device(&self) -> Option<&Arc<Device>> {
        self.default_device.as_ref()
    }

    /// Returns the errno of the last failed call, `0` if none failed yet.
    #[inline]
    pub fn errno(&self) -> Error {
        self.errno.get()
    }

    #[inline]
    pub fn clear_errno(&self) {
        self.errno.set(0);
    }

    /// Records the errno of `result`, if it failed.
    #[inline]
    pub(crate) fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.errno.set(*err);
        }
        result
    }
}
