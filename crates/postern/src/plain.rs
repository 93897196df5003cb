// SPDX-License-Identifier: Apache-2.0

//! Plain old data, which can be copied in and out of the untrusted block.

use core::mem::size_of;
use core::{ptr, slice};

/// Types, which can be reconstructed from any byte pattern of the correct length.
///
/// # Safety
///
/// Implementors MUST be `#[repr(C)]` (or primitive), MUST NOT contain padding bytes and
/// MUST be valid for every bit pattern. Padding freedom of the wire structs is asserted by
/// `testaso` layout tests next to their definitions.
pub unsafe trait Plain: Copy + Sized + 'static {
    /// Returns the byte representation of `self`.
    #[inline]
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: `Self` has no padding, so all `size_of::<Self>()` bytes are initialized.
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
    }

    /// Reads a value from the start of `bytes`.
    ///
    /// Returns `None` if `bytes` is too short. No alignment is required.
    #[inline]
    fn read_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < size_of::<Self>() {
            return None;
        }
        // SAFETY: length checked above and every bit pattern is a valid `Self`.
        Some(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }

    /// Returns a zeroed value.
    #[inline]
    fn zeroed() -> Self {
        // SAFETY: every bit pattern, including all zeroes, is a valid `Self`.
        unsafe { core::mem::zeroed() }
    }
}

macro_rules! plain {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl Plain for $t {})*
    };
}

plain!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

unsafe impl<T: Plain, const N: usize> Plain for [T; N] {}
