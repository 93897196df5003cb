// SPDX-License-Identifier: Apache-2.0

//! The enclave-facing I/O surface
//!
//! A [`Registry`] owns the device, descriptor and mount tables of one process. Every call
//! takes the caller's [`Context`], resolves the device responsible through the tables and
//! forwards to it. No table lock is held while a device runs. Failures are returned and
//! recorded in the context.

use crate::config::Config;
use crate::context::Context;
use crate::device::encfs::{NullSealer, Sealer, Volume};
use crate::device::encsock::Stack;
use crate::device::{Capabilities, DirEntry, Device};
use crate::link::HostLink;
use crate::mount::{normalize, Mount, MountFlags, MountTable, Resolved};
use crate::notify::Notifier;
use crate::table::*;
use crate::AF_ENCLAVE;

use core::ffi::{c_int, c_ulong};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use libc::{
    mode_t, off_t, EBADF, EBUSY, EINVAL, ENOENT, ENOTDIR, ENOTSUP, EROFS, EXDEV, NI_NAMEREQD,
    NI_NUMERICHOST, O_ACCMODE, O_CREAT, O_RDONLY, O_TRUNC, STDERR_FILENO, STDIN_FILENO,
    STDOUT_FILENO,
};
use postern::guest::call::epoll::CtlOp;
use postern::guest::{AddrInfoList, Host};
use postern::item::epoll::{Event, Events};
use postern::item::fs::Stat;
use postern::item::resolver::Hints;
use postern::item::Family;
use postern::Result;
use tracing::{debug, info, instrument, trace};

/// Owner of the device, descriptor and mount tables.
pub struct Registry {
    config: Config,
    link: Arc<HostLink>,
    notifier: Arc<Notifier>,
    volume: Arc<Volume>,
    devices: DeviceTable,
    fds: FdTable,
    mounts: MountTable,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("link", &self.link)
            .field("devices", &self.devices)
            .field("fds", &self.fds)
            .field("mounts", &self.mounts)
            .finish_non_exhaustive()
    }
}

/// Releases a device the descriptor table let go of.
///
/// The backend is closed only when no other descriptor, accepted connection or epoll wait
/// still refers to it. Otherwise the last reference closes it when dropped.
fn release(device: Arc<Device>) -> Result<()> {
    match Arc::into_inner(device) {
        None => Ok(()),
        Some(device) => match device.close() {
            Err(ENOTSUP) => Ok(()),
            ret => ret,
        },
    }
}

fn writable(resolved: &Resolved) -> Result<()> {
    match resolved.flags.contains(MountFlags::RDONLY) {
        true => Err(EROFS),
        false => Ok(()),
    }
}

/// Returns an error unless both paths resolved to the same mounted device.
fn same_mount(old: &Resolved, new: &Resolved) -> Result<()> {
    match Arc::ptr_eq(&old.device, &new.device) {
        true => Ok(()),
        false => Err(EXDEV),
    }
}

impl Registry {
    /// Creates a registry with an unsealed enclave filesystem.
    pub fn new(config: &Config, host: Arc<dyn Host>) -> Self {
        Self::with_sealer(config, host, Arc::new(NullSealer))
    }

    /// Creates a registry whose enclave filesystem seals its blocks with `sealer`.
    pub fn with_sealer(config: &Config, host: Arc<dyn Host>, sealer: Arc<dyn Sealer>) -> Self {
        Self {
            config: config.clone(),
            link: Arc::new(HostLink::new(host, &config.arenas)),
            notifier: Arc::new(Notifier::new()),
            volume: Arc::new(Volume::new(sealer)),
            devices: DeviceTable::new(),
            fds: FdTable::new(config.fd_limit),
            mounts: MountTable::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn host_link(&self) -> &Arc<HostLink> {
        &self.link
    }

    #[inline]
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    #[inline]
    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    #[inline]
    pub fn fds(&self) -> &FdTable {
        &self.fds
    }

    #[inline]
    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Returns the template registered at `id`.
    pub fn device(&self, id: DevId) -> Result<Arc<Device>> {
        self.devices.get_device_for_id(id)
    }

    /// Registers template `device` at `id`, or at a dynamic id for [`DEVID_NONE`].
    pub fn register_device(&self, id: DevId, device: Device) -> Result<DevId> {
        let id = self.devices.allocate_device_id(id)?;
        if let Err(err) = self.devices.set_device_for_id(id, Arc::new(device)) {
            self.devices.release_device_id(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Registers the built-in templates, binds stdio and performs the configured mounts.
    pub fn device_init(&self) -> Result<()> {
        let stack = Arc::new(Stack::new(self.notifier.clone()));
        let templates = [
            (
                DEVID_HOST_FILESYSTEM,
                Device::host_filesystem(self.link.clone()),
            ),
            (
                DEVID_ENCLAVE_FILESYSTEM,
                Device::enclave_filesystem(self.volume.clone()),
            ),
            (DEVID_HOST_SOCKET, Device::host_sockets(self.link.clone())),
            (DEVID_ENCLAVE_SOCKET, Device::enclave_sockets(stack)),
            (
                DEVID_EPOLL,
                Device::epoll(self.link.clone(), self.notifier.clone()),
            ),
            (DEVID_HOST_RESOLVER, Device::host_resolver(self.link.clone())),
            (
                DEVID_ENCLAVE_RESOLVER,
                Device::enclave_resolver(self.config.hosts.clone()),
            ),
        ];
        for (id, device) in templates {
            self.register_device(id, device)?;
        }

        let stdio = [STDIN_FILENO, STDOUT_FILENO, STDERR_FILENO]
            .map(|fd| Arc::new(Device::host_stdio(self.link.clone(), fd)));
        self.fds.bind_stdio(stdio)?;

        let ctx = Context::new();
        for mount in &self.config.mounts {
            let flags = match mount.readonly {
                true => MountFlags::RDONLY,
                false => MountFlags::empty(),
            };
            if mount.target != "/" {
                self.create_dirs(&ctx, &mount.target)?;
            }
            self.mount(&ctx, mount.device.id(), &mount.source, &mount.target, flags)?;
        }

        info!(mounts = self.config.mounts.len(), "devices initialized");
        Ok(())
    }

    /// Closes every descriptor, unmounts everything and shuts the templates down.
    pub fn device_shutdown(&self) {
        for device in self.fds.drain() {
            if let Err(err) = release(device) {
                debug!(err, "failed to close descriptor at shutdown");
            }
        }
        for mount in self.mounts.drain() {
            if let Err(err) = mount.device.unmount() {
                debug!(path = %mount.path, err, "failed to unmount at shutdown");
            }
        }
        for id in self.devices.ids() {
            let Some(device) = self.devices.release_device_id(id) else {
                continue;
            };
            match device.shutdown(0) {
                Ok(()) | Err(ENOTSUP) => {}
                Err(err) => debug!(id, err, "failed to shut device down"),
            }
        }
        info!("devices shut down");
    }

    /// Creates `path` and its missing ancestors as directories.
    fn create_dirs(&self, ctx: &Context, path: &str) -> Result<()> {
        let path = normalize(path)?;
        let mut prefix = String::with_capacity(path.len());
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            match self.stat(ctx, &prefix) {
                Ok(stat) if stat.is_dir() => {}
                Ok(_) => return Err(ENOTDIR),
                Err(ENOENT) => self.mkdir(ctx, &prefix, 0o755)?,
                Err(err) => return Err(err),
            }
        }
        ctx.clear_errno();
        Ok(())
    }

    /// Resolves `path` through the context's default device or the mount table.
    fn resolve(&self, ctx: &Context, path: &str) -> Result<Resolved> {
        let path = normalize(path)?;
        match ctx.default_device() {
            Some(device) => Ok(Resolved {
                device: device.clone(),
                flags: MountFlags::empty(),
                suffix: path,
            }),
            None => self.mounts.resolve(&path),
        }
    }

    /// Binds `device` to the reserved `fd`, releasing both on failure.
    fn install(&self, fd: c_int, device: Result<Device>) -> Result<c_int> {
        let device = match device {
            Ok(device) => Arc::new(device),
            Err(err) => {
                self.fds.release_fd(fd);
                return Err(err);
            }
        };
        match self.fds.set_fd_device(fd, device) {
            Ok(_) => Ok(fd),
            Err(err) => {
                self.fds.release_fd(fd);
                Err(err)
            }
        }
    }

    /// Opens a new descriptor on the device `open` returns.
    fn open_fd(&self, open: impl FnOnce() -> Result<Device>) -> Result<c_int> {
        let fd = self.fds.allocate_fd()?;
        self.install(fd, open())
    }

    fn fd(&self, fd: c_int) -> Result<Arc<Device>> {
        self.fds.get_fd_device(fd)
    }

    // Descriptors

    #[instrument(level = "trace", skip(self, ctx, buf))]
    pub fn read(&self, ctx: &Context, fd: c_int, buf: &mut [u8]) -> Result<usize> {
        ctx.record(self.fd(fd).and_then(|device| device.read(buf)))
    }

    #[instrument(level = "trace", skip(self, ctx, buf))]
    pub fn write(&self, ctx: &Context, fd: c_int, buf: &[u8]) -> Result<usize> {
        ctx.record(self.fd(fd).and_then(|device| device.write(buf)))
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn ioctl(&self, ctx: &Context, fd: c_int, request: c_ulong, arg: usize) -> Result<usize> {
        ctx.record(self.fd(fd).and_then(|device| device.ioctl(request, arg)))
    }

    /// Closes `fd`, the backend is released with the last descriptor referring to it.
    #[instrument(level = "trace", skip(self, ctx))]
    pub fn close(&self, ctx: &Context, fd: c_int) -> Result<()> {
        let ret = self.fds.release_fd(fd).ok_or(EBADF).and_then(release);
        ctx.record(ret)
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn dup(&self, ctx: &Context, fd: c_int) -> Result<c_int> {
        ctx.record(self.fds.dup(fd))
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn dup2(&self, ctx: &Context, old: c_int, new: c_int) -> Result<c_int> {
        let ret = self.fds.dup2(old, new).and_then(|previous| match previous {
            Some(previous) => release(previous).map(|_| new),
            None => Ok(new),
        });
        ctx.record(ret)
    }

    /// Feeds host-reported readiness into the devices at the given descriptors.
    ///
    /// Unknown descriptors are skipped. Waiters are woken once for the whole batch. Returns
    /// the number of devices updated.
    pub fn notify(&self, events: &[(c_int, Events)]) -> usize {
        let mut updated = 0;
        for &(fd, mask) in events {
            match self.fd(fd).and_then(|device| device.notify(mask)) {
                Ok(()) => updated += 1,
                Err(err) => trace!(fd, err, "readiness not applied"),
            }
        }
        self.notifier.broadcast();
        updated
    }

    // Filesystem

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn open(&self, ctx: &Context, path: &str, flags: c_int, mode: mode_t) -> Result<c_int> {
        let ret = self.resolve(ctx, path).and_then(|resolved| {
            if flags & O_ACCMODE != O_RDONLY || flags & (O_CREAT | O_TRUNC) != 0 {
                writable(&resolved)?;
            }
            self.open_fd(|| resolved.device.open(&resolved.suffix, flags, mode))
        });
        ctx.record(ret)
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn lseek(&self, ctx: &Context, fd: c_int, offset: off_t, whence: c_int) -> Result<off_t> {
        ctx.record(self.fd(fd).and_then(|device| device.lseek(offset, whence)))
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn stat(&self, ctx: &Context, path: &str) -> Result<Stat> {
        let ret = self
            .resolve(ctx, path)
            .and_then(|resolved| resolved.device.stat(&resolved.suffix));
        ctx.record(ret)
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn fstat(&self, ctx: &Context, fd: c_int) -> Result<Stat> {
        ctx.record(self.fd(fd).and_then(|device| device.fstat()))
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn ftruncate(&self, ctx: &Context, fd: c_int, length: off_t) -> Result<()> {
        ctx.record(self.fd(fd).and_then(|device| device.ftruncate(length)))
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn link(&self, ctx: &Context, old: &str, new: &str) -> Result<()> {
        let ret = self.resolve(ctx, old).and_then(|old| {
            let new = self.resolve(ctx, new)?;
            same_mount(&old, &new)?;
            writable(&new)?;
            new.device.link(&old.suffix, &new.suffix)
        });
        ctx.record(ret)
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn unlink(&self, ctx: &Context, path: &str) -> Result<()> {
        let ret = self.resolve(ctx, path).and_then(|resolved| {
            writable(&resolved)?;
            resolved.device.unlink(&resolved.suffix)
        });
        ctx.record(ret)
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn rename(&self, ctx: &Context, old: &str, new: &str) -> Result<()> {
        let ret = self.resolve(ctx, old).and_then(|old| {
            let new = self.resolve(ctx, new)?;
            same_mount(&old, &new)?;
            writable(&new)?;
            new.device.rename(&old.suffix, &new.suffix)
        });
        ctx.record(ret)
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn truncate(&self, ctx: &Context, path: &str, length: off_t) -> Result<()> {
        let ret = self.resolve(ctx, path).and_then(|resolved| {
            writable(&resolved)?;
            resolved.device.truncate(&resolved.suffix, length)
        });
        ctx.record(ret)
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn mkdir(&self, ctx: &Context, path: &str, mode: mode_t) -> Result<()> {
        let ret = self.resolve(ctx, path).and_then(|resolved| {
            writable(&resolved)?;
            resolved.device.mkdir(&resolved.suffix, mode)
        });
        ctx.record(ret)
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn rmdir(&self, ctx: &Context, path: &str) -> Result<()> {
        let ret = self.resolve(ctx, path).and_then(|resolved| {
            writable(&resolved)?;
            if resolved.suffix == "/" {
                // The root of a mount
                return Err(EBUSY);
            }
            resolved.device.rmdir(&resolved.suffix)
        });
        ctx.record(ret)
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn opendir(&self, ctx: &Context, path: &str) -> Result<c_int> {
        let ret = self
            .resolve(ctx, path)
            .and_then(|resolved| self.open_fd(|| resolved.device.opendir(&resolved.suffix)));
        ctx.record(ret)
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn readdir(&self, ctx: &Context, fd: c_int) -> Result<Option<DirEntry>> {
        ctx.record(self.fd(fd).and_then(|device| device.readdir()))
    }

    /// Frees the directory stream descriptor `fd`.
    ///
    /// The stream itself is closed with its last descriptor.
    #[instrument(level = "trace", skip(self, ctx))]
    pub fn closedir(&self, ctx: &Context, fd: c_int) -> Result<()> {
        let ret = self.fd(fd).and_then(|device| {
            if !device.capabilities().contains(Capabilities::CLOSEDIR) {
                return Err(ENOTSUP);
            }
            drop(device);
            self.fds.release_fd(fd).ok_or(EBADF).and_then(release)
        });
        ctx.record(ret)
    }

    /// Mounts a duplicate of template `id` at `target`, exposing `source` of the device.
    ///
    /// The target must be an existing directory unless it is `/`. If the device's mount
    /// hook fails, the mount is rolled back.
    #[instrument(level = "trace", skip(self, ctx))]
    pub fn mount(
        &self,
        ctx: &Context,
        id: DevId,
        source: &str,
        target: &str,
        flags: MountFlags,
    ) -> Result<()> {
        ctx.record(self.mount_device(id, source, target, flags))
    }

    fn mount_device(&self, id: DevId, source: &str, target: &str, flags: MountFlags) -> Result<()> {
        let target = normalize(target)?;
        let source = normalize(source)?;
        let template = self.devices.get_device_for_id(id)?;
        if target != "/" {
            let covering = self.mounts.resolve(&target)?;
            if !covering.device.stat(&covering.suffix)?.is_dir() {
                return Err(ENOTDIR);
            }
        }

        let device = Arc::new(template.duplicate());
        self.mounts.insert(Mount {
            path: target.clone(),
            id,
            device: device.clone(),
            flags,
        })?;
        if let Err(err) = device.mount(&source) {
            debug!(%target, err, "mount hook failed, rolling back");
            self.mounts.remove(&target)?;
            return Err(err);
        }
        Ok(())
    }

    /// Unmounts the device `id` mounted at `target`.
    ///
    /// Fails with [`ENOENT`] if nothing is mounted there, [`EINVAL`] if another device is
    /// and [`EBUSY`] while mounts below `target` remain.
    #[instrument(level = "trace", skip(self, ctx))]
    pub fn unmount(&self, ctx: &Context, id: DevId, target: &str) -> Result<()> {
        let ret = normalize(target).and_then(|target| {
            let mount = self.mounts.get(&target).ok_or(ENOENT)?;
            if mount.id != id {
                return Err(EINVAL);
            }
            if self.mounts.has_children(&target) {
                return Err(EBUSY);
            }
            mount.device.unmount()?;
            self.mounts.remove(&target).map(|_| ())
        });
        ctx.record(ret)
    }

    // Sockets

    /// Creates a socket on the host, or in the enclave if `domain` carries [`AF_ENCLAVE`].
    #[instrument(level = "trace", skip(self, ctx))]
    pub fn socket(
        &self,
        ctx: &Context,
        domain: c_int,
        ty: c_int,
        protocol: c_int,
    ) -> Result<c_int> {
        let (id, domain) = match domain & AF_ENCLAVE {
            0 => (DEVID_HOST_SOCKET, domain),
            _ => (DEVID_ENCLAVE_SOCKET, domain & !AF_ENCLAVE),
        };
        let ret = self
            .devices
            .get_device_for_id(id)
            .and_then(|template| self.open_fd(|| template.socket(domain, ty, protocol)));
        ctx.record(ret)
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn connect(&self, ctx: &Context, fd: c_int, addr: SocketAddr) -> Result<()> {
        ctx.record(self.fd(fd).and_then(|device| device.connect(addr)))
    }

    /// Accepts a connection on a new descriptor, returning it with the peer address.
    #[instrument(level = "trace", skip(self, ctx))]
    pub fn accept(
        &self,
        ctx: &Context,
        fd: c_int,
        flags: c_int,
    ) -> Result<(c_int, Option<SocketAddr>)> {
        let ret = self.fd(fd).and_then(|listener| {
            let mut peer = None;
            let conn = self.open_fd(|| {
                let (conn, addr) = listener.accept(flags)?;
                peer = addr;
                Ok(conn)
            })?;
            Ok((conn, peer))
        });
        ctx.record(ret)
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn bind(&self, ctx: &Context, fd: c_int, addr: SocketAddr) -> Result<()> {
        ctx.record(self.fd(fd).and_then(|device| device.bind(addr)))
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn listen(&self, ctx: &Context, fd: c_int, backlog: c_int) -> Result<()> {
        ctx.record(self.fd(fd).and_then(|device| device.listen(backlog)))
    }

    #[instrument(level = "trace", skip(self, ctx, buf))]
    pub fn send(&self, ctx: &Context, fd: c_int, buf: &[u8], flags: c_int) -> Result<usize> {
        ctx.record(self.fd(fd).and_then(|device| device.send(buf, flags)))
    }

    #[instrument(level = "trace", skip(self, ctx, buf))]
    pub fn recv(&self, ctx: &Context, fd: c_int, buf: &mut [u8], flags: c_int) -> Result<usize> {
        ctx.record(self.fd(fd).and_then(|device| device.recv(buf, flags)))
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn shutdown(&self, ctx: &Context, fd: c_int, how: c_int) -> Result<()> {
        ctx.record(self.fd(fd).and_then(|device| device.shutdown(how)))
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn getsockopt(
        &self,
        ctx: &Context,
        fd: c_int,
        level: c_int,
        name: c_int,
        len: usize,
    ) -> Result<Vec<u8>> {
        ctx.record(self.fd(fd).and_then(|device| device.getsockopt(level, name, len)))
    }

    #[instrument(level = "trace", skip(self, ctx, value))]
    pub fn setsockopt(
        &self,
        ctx: &Context,
        fd: c_int,
        level: c_int,
        name: c_int,
        value: &[u8],
    ) -> Result<()> {
        ctx.record(self.fd(fd).and_then(|device| device.setsockopt(level, name, value)))
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn getsockname(&self, ctx: &Context, fd: c_int) -> Result<Option<SocketAddr>> {
        ctx.record(self.fd(fd).and_then(|device| device.getsockname()))
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn getpeername(&self, ctx: &Context, fd: c_int) -> Result<Option<SocketAddr>> {
        ctx.record(self.fd(fd).and_then(|device| device.getpeername()))
    }

    // Epoll

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn epoll_create(&self, ctx: &Context, size: c_int) -> Result<c_int> {
        let ret = self
            .devices
            .get_device_for_id(DEVID_EPOLL)
            .and_then(|template| self.open_fd(|| template.epoll_create(size)));
        ctx.record(ret)
    }

    #[instrument(level = "trace", skip(self, ctx))]
    pub fn epoll_create1(&self, ctx: &Context, flags: c_int) -> Result<c_int> {
        let ret = self
            .devices
            .get_device_for_id(DEVID_EPOLL)
            .and_then(|template| self.open_fd(|| template.epoll_create1(flags)));
        ctx.record(ret)
    }

    /// Changes the interest of `epfd` in `fd`, `op` is one of `EPOLL_CTL_*`.
    #[instrument(level = "trace", skip(self, ctx))]
    pub fn epoll_ctl(
        &self,
        ctx: &Context,
        epfd: c_int,
        op: c_int,
        fd: c_int,
        event: Option<Event>,
    ) -> Result<()> {
        let ret = CtlOp::try_from(op).and_then(|op| {
            let epoll = self.fd(epfd)?;
            let target = self.fd(fd)?;
            if Arc::ptr_eq(&epoll, &target) {
                return Err(EINVAL);
            }
            epoll.epoll_ctl(op, fd, &target, event)
        });
        ctx.record(ret)
    }

    /// Waits for at most `maxevents` events, `timeout` is in milliseconds, `-1` blocks.
    #[instrument(level = "trace", skip(self, ctx))]
    pub fn epoll_wait(
        &self,
        ctx: &Context,
        epfd: c_int,
        maxevents: usize,
        timeout: c_int,
    ) -> Result<Vec<Event>> {
        ctx.record(self.fd(epfd).and_then(|epoll| epoll.epoll_wait(maxevents, timeout)))
    }

    // Resolvers

    /// Resolves in the enclave first and asks the host for names it does not know.
    ///
    /// A host reply too large for the resolver arena fails with `EOVERFLOW`, see
    /// [`arena_hint`](Self::arena_hint).
    #[instrument(level = "trace", skip(self, ctx))]
    pub fn getaddrinfo(
        &self,
        ctx: &Context,
        node: Option<&str>,
        service: Option<&str>,
        hints: Option<&Hints>,
    ) -> Result<AddrInfoList> {
        ctx.record(self.lookup_addr(node, service, hints))
    }

    fn lookup_addr(
        &self,
        node: Option<&str>,
        service: Option<&str>,
        hints: Option<&Hints>,
    ) -> Result<AddrInfoList> {
        let enclave = self.devices.get_device_for_id(DEVID_ENCLAVE_RESOLVER)?;
        match enclave.getaddrinfo(node, service, hints) {
            Err(ENOENT) => {}
            ret => return ret,
        }
        trace!(?node, ?service, "forwarding resolution to the host");
        let host = self.devices.get_device_for_id(DEVID_HOST_RESOLVER)?;
        host.getaddrinfo(node, service, hints)
    }

    /// Names `addr` in the enclave first and asks the host for addresses it does not know.
    #[instrument(level = "trace", skip(self, ctx))]
    pub fn getnameinfo(
        &self,
        ctx: &Context,
        addr: SocketAddr,
        flags: c_int,
    ) -> Result<(String, String)> {
        ctx.record(self.lookup_name(addr, flags))
    }

    fn lookup_name(&self, addr: SocketAddr, flags: c_int) -> Result<(String, String)> {
        let enclave = self.devices.get_device_for_id(DEVID_ENCLAVE_RESOLVER)?;
        if flags & NI_NUMERICHOST != 0 {
            return enclave.getnameinfo(addr, flags);
        }
        match enclave.getnameinfo(addr, flags | NI_NAMEREQD) {
            Err(ENOENT) => {}
            ret => return ret,
        }

        let host = self.devices.get_device_for_id(DEVID_HOST_RESOLVER)?;
        match host.getnameinfo(addr, flags) {
            Err(err) if flags & NI_NAMEREQD == 0 => {
                debug!(%addr, err, "host name lookup failed, answering numerically");
                enclave.getnameinfo(addr, flags)
            }
            ret => ret,
        }
    }

    // Arenas

    /// Returns the arena capacity the last overflowing request of `family` required.
    pub fn arena_hint(&self, family: Family) -> Option<usize> {
        self.link.arena_hint(family)
    }

    /// Recreates the arena of `family` with at least `capacity` bytes.
    #[instrument(level = "trace", skip(self, ctx))]
    pub fn grow_arena(&self, ctx: &Context, family: Family, capacity: usize) -> Result<()> {
        ctx.record(self.link.grow_arena(family, capacity))
    }
}
