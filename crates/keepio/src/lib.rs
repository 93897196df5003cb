// SPDX-License-Identifier: Apache-2.0

//! Virtualized POSIX I/O for code running in an enclave
//!
//! `keepio` gives enclave code a POSIX-like view of files, sockets, epoll and name
//! resolution. Every resource is a [`Device`]: either a proxy for a host resource, reached
//! through [`postern`], or a resource living entirely in enclave memory. A [`Registry`]
//! maps descriptors and mount points to devices and is the only surface callers use.
//!
//! # Devices
//!
//! * host filesystem, files and standard streams
//! * enclave filesystem, an in-memory tree whose file blocks pass through a sealer
//! * host sockets
//! * enclave sockets, stream connections between endpoints in the same enclave
//! * epoll, over enclave devices and host descriptors alike
//! * host and enclave resolvers, the enclave one answering from static entries
//!
//! # Example
//!
//! ```
//! use keepio::{Config, Context, Registry};
//! use postern::host::Executor;
//! use std::sync::Arc;
//!
//! let registry = Registry::new(&Config::default(), Arc::new(Executor::new()));
//! registry.device_init().unwrap();
//!
//! let ctx = Context::new();
//! let fd = registry.open(&ctx, "/hello", libc::O_CREAT | libc::O_RDWR, 0o600).unwrap();
//! assert_eq!(registry.write(&ctx, fd, b"hello"), Ok(5));
//! registry.close(&ctx, fd).unwrap();
//! registry.device_shutdown();
//! ```

#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod device;
pub mod link;
pub mod log;
pub mod mount;
pub mod notify;
pub mod table;

mod registry;

pub use config::Config;
pub use context::Context;
pub use device::{Capabilities, DirEntry, Device, Kind};
pub use registry::Registry;

use core::ffi::c_int;

/// Address family bit selecting the enclave socket stack in [`Registry::socket`].
pub const AF_ENCLAVE: c_int = 0x1_0000;
