// SPDX-License-Identifier: Apache-2.0

//! The link to the host
//!
//! [`HostLink`] owns one [`Channel`] per device family. Host proxy devices share it and
//! execute every request through it, so all requests of a family serialize on the
//! family's arena.

use crate::config::Arenas;

use core::ffi::c_int;
use core::sync::atomic::{AtomicI32, Ordering};
use std::fmt;
use std::sync::Arc;

use libc::EBADF;
use postern::guest::call::{epoll, fs, socket};
use postern::guest::{Call, Channel, Host};
use postern::item::Family;
use postern::Result;
use tracing::{debug, trace};

/// Shared access to the host.
pub struct HostLink {
    host: Arc<dyn Host>,
    fs: Channel,
    socket: Channel,
    epoll: Channel,
    resolver: Channel,
}

impl fmt::Debug for HostLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("HostLink");
        for family in Family::ALL {
            s.field(family.name(), &self.channel(family).capacity());
        }
        s.finish_non_exhaustive()
    }
}

impl HostLink {
    pub fn new(host: Arc<dyn Host>, arenas: &Arenas) -> Self {
        Self {
            host,
            fs: Channel::new(Family::Fs, arenas.fs),
            socket: Channel::new(Family::Socket, arenas.socket),
            epoll: Channel::new(Family::Epoll, arenas.epoll),
            resolver: Channel::new(Family::Resolver, arenas.resolver),
        }
    }

    /// Returns the channel of `family`.
    pub fn channel(&self, family: Family) -> &Channel {
        match family {
            Family::Fs => &self.fs,
            Family::Socket => &self.socket,
            Family::Epoll => &self.epoll,
            Family::Resolver => &self.resolver,
        }
    }

    /// Executes `call` on the host in a single round trip.
    #[inline]
    pub fn execute<C: Call>(&self, call: C) -> Result<C::Collected> {
        self.channel(C::FAMILY).execute(&*self.host, call)
    }

    /// Recreates the arena of `family` with at least `capacity` bytes.
    pub fn grow_arena(&self, family: Family, capacity: usize) -> Result<()> {
        self.channel(family).grow(capacity)
    }

    /// Returns the arena capacity the last overflowing request of `family` required.
    pub fn arena_hint(&self, family: Family) -> Option<usize> {
        self.channel(family).required()
    }
}

/// Descriptor of a host resource, closed when dropped.
pub struct HostFd {
    link: Arc<HostLink>,
    family: Family,
    fd: AtomicI32,
    owned: bool,
}

impl fmt::Debug for HostFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFd")
            .field("family", &self.family)
            .field("fd", &self.fd)
            .field("owned", &self.owned)
            .finish()
    }
}

impl HostFd {
    /// Takes ownership of host descriptor `fd` of `family`.
    pub fn new(link: Arc<HostLink>, family: Family, fd: c_int) -> Self {
        Self {
            link,
            family,
            fd: AtomicI32::new(fd),
            owned: true,
        }
    }

    /// Refers to host descriptor `fd` without ever closing it.
    pub fn borrowed(link: Arc<HostLink>, family: Family, fd: c_int) -> Self {
        Self {
            link,
            family,
            fd: AtomicI32::new(fd),
            owned: false,
        }
    }

    #[inline]
    pub fn link(&self) -> &Arc<HostLink> {
        &self.link
    }

    /// Returns the host descriptor, [`EBADF`] once closed.
    #[inline]
    pub fn get(&self) -> Result<c_int> {
        match self.fd.load(Ordering::Acquire) {
            fd if fd < 0 => Err(EBADF),
            fd => Ok(fd),
        }
    }

    /// Closes the host descriptor.
    ///
    /// Borrowed descriptors are only detached. Closing twice fails with [`EBADF`].
    pub fn close(&self) -> Result<()> {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd < 0 {
            return Err(EBADF);
        }
        if !self.owned {
            return Ok(());
        }
        trace!(family = self.family.name(), fd, "close host descriptor");
        match self.family {
            Family::Fs => self.link.execute(fs::Close { fd }),
            Family::Socket => self.link.execute(socket::Close { fd }),
            Family::Epoll => self.link.execute(epoll::Close { epfd: fd }),
            Family::Resolver => Err(EBADF),
        }
    }
}

impl Drop for HostFd {
    fn drop(&mut self) {
        if self.fd.load(Ordering::Acquire) < 0 {
            return;
        }
        if let Err(err) = self.close() {
            debug!(family = self.family.name(), err, "failed to close host descriptor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Recorder;

    use postern::item::fs::Op;

    #[test]
    fn close_once() {
        let host = Arc::new(Recorder::default());
        let link = Arc::new(HostLink::new(host.clone(), &Arenas::default()));

        let fd = HostFd::new(link.clone(), Family::Fs, 7);
        assert_eq!(fd.get(), Ok(7));
        fd.close().unwrap();
        assert_eq!(fd.get(), Err(EBADF));
        assert_eq!(fd.close(), Err(EBADF));
        drop(fd);
        assert_eq!(host.ops(), [(Family::Fs, Op::Close as usize, 7)]);
    }

    #[test]
    fn drop_closes_owned_only() {
        let host = Arc::new(Recorder::default());
        let link = Arc::new(HostLink::new(host.clone(), &Arenas::default()));

        drop(HostFd::borrowed(link.clone(), Family::Fs, 1));
        assert!(host.ops().is_empty());

        drop(HostFd::new(link, Family::Socket, 9));
        assert_eq!(
            host.ops(),
            [(Family::Socket, postern::item::socket::Op::Close as usize, 9)]
        );
    }

    #[test]
    fn arena_per_family() {
        let host = Arc::new(Recorder::default());
        let arenas = Arenas {
            epoll: 4096,
            ..Default::default()
        };
        let link = HostLink::new(host, &arenas);
        assert_eq!(link.channel(Family::Epoll).capacity(), 4096);
        assert_eq!(link.arena_hint(Family::Epoll), None);
        link.grow_arena(Family::Epoll, 8192).unwrap();
        assert_eq!(link.channel(Family::Epoll).capacity(), 8192);
        assert_eq!(link.channel(Family::Fs).capacity(), Arenas::default().fs);
    }
}
