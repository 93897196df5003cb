// SPDX-License-Identifier: Apache-2.0

//! Guest (enclave) side of the postern.
//!
//! The main entrypoint into this module is a long-lived [`Channel`] per device family, which
//! allocates requests within the untrusted block, passes control to the host for execution of
//! the block via [`Host::sally`] and reads the replies once it gets the control back after
//! verifying the integrity of the block.
//!
//! # Call lifetime phases
//!
//! ## Stage
//! In this phase [input references], [output references] and [inout references] are sequentially
//! allocated within the data region and inputs are written to them. The bump allocator keeps
//! counting past the end of the region, so a call which does not fit fails with `EOVERFLOW`
//! and reports the arena capacity it requires via [`Channel::required`].
//!
//! ## Collect
//! This phase starts after the control returns to the guest and only if the host reported
//! success. Data is read from [output references] and [inout references], and every value the
//! host wrote, which affects how that data is read, is bounds-checked first.
//!
//! [inout references]: alloc::InOutRef
//! [input references]: alloc::InRef
//! [output references]: alloc::OutRef

pub mod addrinfo;
#[allow(clippy::len_without_is_empty)]
pub mod alloc;
pub mod arena;
pub mod call;
pub mod channel;

pub use addrinfo::AddrInfoList;
pub use alloc::{Alloc, Collector};
pub use arena::Arena;
pub use call::Call;
pub use channel::Channel;

use crate::Result;

/// Passes control to the host.
pub trait Host: Send + Sync {
    /// Executes the request in `block` on the host.
    ///
    /// `block` is a header followed by the data region. On return, the host has written the
    /// reply into it. An error means the request never reached the host.
    fn sally(&self, block: &mut [usize]) -> Result<()>;
}
