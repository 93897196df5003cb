// SPDX-License-Identifier: Apache-2.0

//! Devices
//!
//! A [`Device`] is a closed sum over the concrete backends. Every operation is a method,
//! which dispatches on the backend and fails with [`ENOTSUP`] for backends lacking the
//! capability, without touching any state. [`Device::capabilities`] reports what dispatch
//! implements.

pub mod encfs;
pub mod encsock;
pub mod epoll;
pub mod hostfs;
pub mod hostsock;
pub mod resolver;

use crate::link::{HostFd, HostLink};
use crate::notify::Notifier;

use core::ffi::{c_int, c_ulong};
use core::sync::atomic::{AtomicU32, Ordering};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bitflags::bitflags;
use libc::{mode_t, off_t, ENOTSUP};
use postern::guest::call::epoll::CtlOp;
use postern::guest::AddrInfoList;
use postern::item::epoll::{Event, Events};
use postern::item::fs::Stat;
use postern::item::resolver::Hints;
use postern::item::Family;
use postern::Result;

pub use epoll::State as EpollState;

/// Device kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    HostFile,
    EnclaveFile,
    HostSocket,
    EnclaveSocket,
    Epoll,
    HostResolver,
    EnclaveResolver,
}

bitflags! {
    /// Operations a device implements
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Capabilities: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const IOCTL = 1 << 2;
        const CLOSE = 1 << 3;
        const NOTIFY = 1 << 4;
        const GET_HOST_FD = 1 << 5;
        const READY_STATE = 1 << 6;
        const SHUTDOWN = 1 << 7;

        const OPEN = 1 << 8;
        const LSEEK = 1 << 9;
        const STAT = 1 << 10;
        const LINK = 1 << 11;
        const UNLINK = 1 << 12;
        const RENAME = 1 << 13;
        const TRUNCATE = 1 << 14;
        const MKDIR = 1 << 15;
        const RMDIR = 1 << 16;
        const OPENDIR = 1 << 17;
        const READDIR = 1 << 18;
        const CLOSEDIR = 1 << 19;
        const MOUNT = 1 << 20;
        const UNMOUNT = 1 << 21;

        const SOCKET = 1 << 24;
        const CONNECT = 1 << 25;
        const ACCEPT = 1 << 26;
        const BIND = 1 << 27;
        const LISTEN = 1 << 28;
        const RECV = 1 << 29;
        const SEND = 1 << 30;
        const GETSOCKOPT = 1 << 31;
        const SETSOCKOPT = 1 << 32;
        const GETSOCKNAME = 1 << 33;
        const GETPEERNAME = 1 << 34;

        const EPOLL_CREATE = 1 << 40;
        const EPOLL_CREATE1 = 1 << 41;
        const EPOLL_CTL_ADD = 1 << 42;
        const EPOLL_CTL_DEL = 1 << 43;
        const EPOLL_CTL_MOD = 1 << 44;
        const EPOLL_WAIT = 1 << 45;

        const GETADDRINFO = 1 << 48;
        const GETNAMEINFO = 1 << 49;
    }
}

impl Capabilities {
    /// Path operations of a mountable filesystem.
    const FILESYSTEM: Self = Self::OPEN
        .union(Self::STAT)
        .union(Self::LINK)
        .union(Self::UNLINK)
        .union(Self::RENAME)
        .union(Self::TRUNCATE)
        .union(Self::MKDIR)
        .union(Self::RMDIR)
        .union(Self::OPENDIR)
        .union(Self::MOUNT)
        .union(Self::UNMOUNT);

    /// Operations of an open file.
    const FILE: Self = Self::READ
        .union(Self::WRITE)
        .union(Self::CLOSE)
        .union(Self::LSEEK)
        .union(Self::STAT)
        .union(Self::TRUNCATE);

    /// Operations of an open directory.
    const DIRECTORY: Self = Self::CLOSE.union(Self::READDIR).union(Self::CLOSEDIR);

    /// Operations of a socket.
    const SOCKET_OPS: Self = Self::READ
        .union(Self::WRITE)
        .union(Self::CLOSE)
        .union(Self::READY_STATE)
        .union(Self::SHUTDOWN)
        .union(Self::CONNECT)
        .union(Self::ACCEPT)
        .union(Self::BIND)
        .union(Self::LISTEN)
        .union(Self::RECV)
        .union(Self::SEND)
        .union(Self::GETSOCKOPT)
        .union(Self::SETSOCKOPT)
        .union(Self::GETSOCKNAME)
        .union(Self::GETPEERNAME);

    /// Operations of a resolver.
    const RESOLVER: Self = Self::GETADDRINFO.union(Self::GETNAMEINFO);
}

/// A directory entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    /// `DT_*` type of the entry
    pub kind: u8,
    pub name: String,
}

#[derive(Clone)]
pub(crate) enum Backend {
    HostFs(hostfs::HostFs),
    HostFile(hostfs::HostFile),
    HostDir(hostfs::HostDir),
    EncFs(encfs::EncFs),
    EncFile(encfs::EncFile),
    EncDir(encfs::EncDir),
    HostSockets(hostsock::HostSockets),
    HostSocket(hostsock::HostSocket),
    EncSockets(encsock::EncSockets),
    EncSocket(encsock::EncSocket),
    EpollDev(epoll::EpollDev),
    Epoll(epoll::Epoll),
    HostResolver(resolver::HostResolver),
    EncResolver(resolver::EncResolver),
}

/// Dispatches to the backends implementing an operation, [`ENOTSUP`] for all others.
macro_rules! dispatch {
    ($self:ident.$method:ident $args:tt => $($variant:ident)|+) => {
        match &$self.backend {
            $(Backend::$variant(backend) => backend.$method $args,)+
            #[allow(unreachable_patterns)]
            _ => Err(ENOTSUP),
        }
    };
}

/// A virtualized I/O resource.
pub struct Device {
    backend: Backend,
    ready: AtomicU32,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("kind", &self.kind())
            .field("capabilities", &self.capabilities())
            .finish_non_exhaustive()
    }
}

impl Device {
    #[inline]
    pub(crate) fn new(backend: Backend) -> Self {
        Self {
            backend,
            ready: AtomicU32::new(0),
        }
    }

    /// The host filesystem template.
    pub fn host_filesystem(link: Arc<HostLink>) -> Self {
        Self::new(Backend::HostFs(hostfs::HostFs::new(link)))
    }

    /// A host file wrapping the host's standard stream `fd`, which is never closed.
    pub fn host_stdio(link: Arc<HostLink>, fd: c_int) -> Self {
        let fd = HostFd::borrowed(link, Family::Fs, fd);
        Self::new(Backend::HostFile(hostfs::HostFile::new(fd)))
    }

    /// The enclave filesystem template over `volume`.
    pub fn enclave_filesystem(volume: Arc<encfs::Volume>) -> Self {
        Self::new(Backend::EncFs(encfs::EncFs::new(volume)))
    }

    /// The host socket template.
    pub fn host_sockets(link: Arc<HostLink>) -> Self {
        Self::new(Backend::HostSockets(hostsock::HostSockets::new(link)))
    }

    /// The enclave socket template over `stack`.
    pub fn enclave_sockets(stack: Arc<encsock::Stack>) -> Self {
        Self::new(Backend::EncSockets(encsock::EncSockets::new(stack)))
    }

    /// The epoll template.
    pub fn epoll(link: Arc<HostLink>, notifier: Arc<Notifier>) -> Self {
        Self::new(Backend::EpollDev(epoll::EpollDev::new(link, notifier)))
    }

    /// The host resolver template.
    pub fn host_resolver(link: Arc<HostLink>) -> Self {
        Self::new(Backend::HostResolver(resolver::HostResolver::new(link)))
    }

    /// The enclave resolver template.
    pub fn enclave_resolver(hosts: resolver::Hosts) -> Self {
        Self::new(Backend::EncResolver(resolver::EncResolver::new(hosts)))
    }

    /// Returns the kind of the device, which never changes.
    pub fn kind(&self) -> Kind {
        match &self.backend {
            Backend::HostFs(_) | Backend::HostFile(_) | Backend::HostDir(_) => Kind::HostFile,
            Backend::EncFs(_) | Backend::EncFile(_) | Backend::EncDir(_) => Kind::EnclaveFile,
            Backend::HostSockets(_) | Backend::HostSocket(_) => Kind::HostSocket,
            Backend::EncSockets(_) | Backend::EncSocket(_) => Kind::EnclaveSocket,
            Backend::EpollDev(_) | Backend::Epoll(_) => Kind::Epoll,
            Backend::HostResolver(_) => Kind::HostResolver,
            Backend::EncResolver(_) => Kind::EnclaveResolver,
        }
    }

    /// Returns the operations the device implements.
    pub fn capabilities(&self) -> Capabilities {
        use Capabilities as C;

        match &self.backend {
            Backend::HostFs(_) | Backend::EncFs(_) => C::FILESYSTEM,
            Backend::HostFile(_) => {
                C::FILE | C::GET_HOST_FD | C::NOTIFY | C::READY_STATE
            }
            Backend::EncFile(_) => C::FILE,
            Backend::HostDir(_) | Backend::EncDir(_) => C::DIRECTORY,
            Backend::HostSockets(_) | Backend::EncSockets(_) => C::SOCKET,
            Backend::HostSocket(_) => C::SOCKET_OPS | C::GET_HOST_FD | C::NOTIFY,
            Backend::EncSocket(_) => C::SOCKET_OPS | C::IOCTL,
            Backend::EpollDev(_) => C::EPOLL_CREATE | C::EPOLL_CREATE1 | C::SHUTDOWN,
            Backend::Epoll(_) => {
                C::CLOSE
                    | C::SHUTDOWN
                    | C::EPOLL_CTL_ADD
                    | C::EPOLL_CTL_DEL
                    | C::EPOLL_CTL_MOD
                    | C::EPOLL_WAIT
            }
            Backend::HostResolver(_) => C::RESOLVER | C::SHUTDOWN,
            Backend::EncResolver(_) => C::RESOLVER,
        }
    }

    /// Returns an independent device sharing only the backend handle.
    ///
    /// Filesystems duplicate unmounted.
    pub fn duplicate(&self) -> Self {
        let backend = match &self.backend {
            Backend::HostFs(fs) => Backend::HostFs(fs.unmounted()),
            Backend::EncFs(fs) => Backend::EncFs(fs.unmounted()),
            backend => backend.clone(),
        };
        Self::new(backend)
    }

    // Base operations

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        dispatch!(self.read(buf) => HostFile | EncFile | HostSocket | EncSocket)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        dispatch!(self.write(buf) => HostFile | EncFile | HostSocket | EncSocket)
    }

    pub fn ioctl(&self, request: c_ulong, arg: usize) -> Result<usize> {
        dispatch!(self.ioctl(request, arg) => EncSocket)
    }

    /// Releases the backend resource.
    ///
    /// Called once the last descriptor referring to the device is closed.
    pub fn close(&self) -> Result<()> {
        dispatch!(self.close() =>
            HostFile | EncFile | HostDir | EncDir | HostSocket | EncSocket | Epoll)
    }

    /// Replaces the ready-state with the host-reported `events`.
    pub fn notify(&self, events: Events) -> Result<()> {
        match &self.backend {
            Backend::HostFile(_) | Backend::HostSocket(_) => {
                self.ready.store(events.bits(), Ordering::Release);
                Ok(())
            }
            _ => Err(ENOTSUP),
        }
    }

    /// Returns the host descriptor backing the device.
    pub fn host_fd(&self) -> Result<c_int> {
        dispatch!(self.host_fd() => HostFile | HostSocket)
    }

    /// Returns the events the device is ready for.
    pub fn ready_state(&self) -> Result<Events> {
        let notified = Events::from_bits_truncate(self.ready.load(Ordering::Acquire));
        match &self.backend {
            Backend::HostFile(_) | Backend::HostSocket(_) => Ok(notified),
            Backend::EncSocket(socket) => Ok(notified | socket.ready()),
            _ => Err(ENOTSUP),
        }
    }

    /// Clears `events` from the host-reported ready-state.
    pub(crate) fn consume_ready(&self, events: Events) {
        self.ready.fetch_and(!events.bits(), Ordering::AcqRel);
    }

    pub fn shutdown(&self, how: c_int) -> Result<()> {
        dispatch!(self.shutdown(how) => HostSocket | EncSocket | EpollDev | Epoll | HostResolver)
    }

    // Filesystem operations

    pub fn open(&self, path: &str, flags: c_int, mode: mode_t) -> Result<Device> {
        dispatch!(self.open(path, flags, mode) => HostFs | EncFs)
    }

    pub fn lseek(&self, offset: off_t, whence: c_int) -> Result<off_t> {
        dispatch!(self.lseek(offset, whence) => HostFile | EncFile)
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        dispatch!(self.stat(path) => HostFs | EncFs)
    }

    pub fn fstat(&self) -> Result<Stat> {
        dispatch!(self.fstat() => HostFile | EncFile)
    }

    pub fn link(&self, old: &str, new: &str) -> Result<()> {
        dispatch!(self.link(old, new) => HostFs | EncFs)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        dispatch!(self.unlink(path) => HostFs | EncFs)
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        dispatch!(self.rename(old, new) => HostFs | EncFs)
    }

    pub fn truncate(&self, path: &str, length: off_t) -> Result<()> {
        dispatch!(self.truncate(path, length) => HostFs | EncFs)
    }

    pub fn ftruncate(&self, length: off_t) -> Result<()> {
        dispatch!(self.ftruncate(length) => HostFile | EncFile)
    }

    pub fn mkdir(&self, path: &str, mode: mode_t) -> Result<()> {
        dispatch!(self.mkdir(path, mode) => HostFs | EncFs)
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        dispatch!(self.rmdir(path) => HostFs | EncFs)
    }

    pub fn opendir(&self, path: &str) -> Result<Device> {
        dispatch!(self.opendir(path) => HostFs | EncFs)
    }

    pub fn readdir(&self) -> Result<Option<DirEntry>> {
        dispatch!(self.readdir() => HostDir | EncDir)
    }

    pub fn closedir(&self) -> Result<()> {
        dispatch!(self.closedir() => HostDir | EncDir)
    }

    /// Mount hook, exposing `source` of the device.
    pub fn mount(&self, source: &str) -> Result<()> {
        dispatch!(self.mount(source) => HostFs | EncFs)
    }

    /// Unmount hook.
    pub fn unmount(&self) -> Result<()> {
        dispatch!(self.unmount() => HostFs | EncFs)
    }

    // Socket operations

    pub fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> Result<Device> {
        dispatch!(self.socket(domain, ty, protocol) => HostSockets | EncSockets)
    }

    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        dispatch!(self.connect(addr) => HostSocket | EncSocket)
    }

    /// Accepts a connection as a new device.
    pub fn accept(&self, flags: c_int) -> Result<(Device, Option<SocketAddr>)> {
        dispatch!(self.accept(flags) => HostSocket | EncSocket)
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        dispatch!(self.bind(addr) => HostSocket | EncSocket)
    }

    pub fn listen(&self, backlog: c_int) -> Result<()> {
        dispatch!(self.listen(backlog) => HostSocket | EncSocket)
    }

    pub fn recv(&self, buf: &mut [u8], flags: c_int) -> Result<usize> {
        dispatch!(self.recv(buf, flags) => HostSocket | EncSocket)
    }

    pub fn send(&self, buf: &[u8], flags: c_int) -> Result<usize> {
        dispatch!(self.send(buf, flags) => HostSocket | EncSocket)
    }

    pub fn getsockopt(&self, level: c_int, name: c_int, len: usize) -> Result<Vec<u8>> {
        dispatch!(self.getsockopt(level, name, len) => HostSocket | EncSocket)
    }

    pub fn setsockopt(&self, level: c_int, name: c_int, value: &[u8]) -> Result<()> {
        dispatch!(self.setsockopt(level, name, value) => HostSocket | EncSocket)
    }

    pub fn getsockname(&self) -> Result<Option<SocketAddr>> {
        dispatch!(self.getsockname() => HostSocket | EncSocket)
    }

    pub fn getpeername(&self) -> Result<Option<SocketAddr>> {
        dispatch!(self.getpeername() => HostSocket | EncSocket)
    }

    // Epoll operations

    pub fn epoll_create(&self, size: c_int) -> Result<Device> {
        dispatch!(self.create(size) => EpollDev)
    }

    pub fn epoll_create1(&self, flags: c_int) -> Result<Device> {
        dispatch!(self.create1(flags) => EpollDev)
    }

    /// Changes the interest in `target`, which is open at enclave descriptor `fd`.
    pub fn epoll_ctl(
        &self,
        op: CtlOp,
        fd: c_int,
        target: &Arc<Device>,
        event: Option<Event>,
    ) -> Result<()> {
        dispatch!(self.ctl(op, fd, target, event) => Epoll)
    }

    pub fn epoll_wait(&self, maxevents: usize, timeout: c_int) -> Result<Vec<Event>> {
        dispatch!(self.wait(maxevents, timeout) => Epoll)
    }

    /// Returns the state of an epoll instance.
    pub fn epoll_state(&self) -> Result<EpollState> {
        dispatch!(self.state() => Epoll)
    }

    // Resolver operations

    pub fn getaddrinfo(
        &self,
        node: Option<&str>,
        service: Option<&str>,
        hints: Option<&Hints>,
    ) -> Result<AddrInfoList> {
        dispatch!(self.getaddrinfo(node, service, hints) => HostResolver | EncResolver)
    }

    pub fn getnameinfo(&self, addr: SocketAddr, flags: c_int) -> Result<(String, String)> {
        dispatch!(self.getnameinfo(addr, flags) => HostResolver | EncResolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{link, Recorder};

    use libc::{AF_INET, SOCK_STREAM};

    fn devices() -> Vec<Device> {
        let host = Arc::new(Recorder::default());
        let link = link(host);
        let volume = Arc::new(encfs::Volume::new(Arc::new(encfs::NullSealer)));
        let stack = Arc::new(encsock::Stack::new(Arc::new(Notifier::new())));

        let enc_file = Device::enclave_filesystem(volume.clone())
            .open("/file", libc::O_CREAT | libc::O_RDWR, 0o600)
            .unwrap();
        let enc_dir = Device::enclave_filesystem(volume.clone())
            .opendir("/")
            .unwrap();
        let enc_socket = Device::enclave_sockets(stack.clone())
            .socket(AF_INET, SOCK_STREAM, 0)
            .unwrap();
        let host_socket = Device::host_sockets(link.clone())
            .socket(AF_INET, SOCK_STREAM, 0)
            .unwrap();
        let epoll = Device::epoll(link.clone(), Arc::new(Notifier::new()))
            .epoll_create1(libc::EPOLL_CLOEXEC)
            .unwrap();

        vec![
            Device::host_filesystem(link.clone()),
            Device::host_stdio(link.clone(), 1),
            Device::enclave_filesystem(volume),
            enc_file,
            enc_dir,
            Device::host_sockets(link.clone()),
            host_socket,
            Device::enclave_sockets(stack),
            enc_socket,
            Device::epoll(link.clone(), Arc::new(Notifier::new())),
            epoll,
            Device::host_resolver(link),
            Device::enclave_resolver(Default::default()),
        ]
    }

    #[test]
    fn capability_rejection() {
        let host = Arc::new(Recorder::default());
        let volume = Arc::new(encfs::Volume::new(Arc::new(encfs::NullSealer)));
        let fs = Device::enclave_filesystem(volume);
        let file = fs.open("/plain", libc::O_CREAT | libc::O_RDWR, 0o600).unwrap();
        file.write(b"contents").unwrap();

        assert!(!file.capabilities().contains(Capabilities::LISTEN));
        assert_eq!(file.listen(1), Err(ENOTSUP));
        assert_eq!(file.accept(0).map(|_| ()), Err(ENOTSUP));
        assert_eq!(file.getsockname(), Err(ENOTSUP));

        // Nothing changed.
        assert_eq!(file.fstat().unwrap().size, 8);
        assert_eq!(file.lseek(0, libc::SEEK_CUR), Ok(8));

        let host_file = Device::host_stdio(link(host.clone()), 1);
        assert_eq!(host_file.listen(1), Err(ENOTSUP));
        assert!(host.ops().is_empty());
    }

    #[test]
    fn capabilities_agree_with_dispatch() {
        for device in devices() {
            let caps = device.capabilities();
            let kind = device.kind();

            let checks: [(Capabilities, Result<()>); 9] = [
                (Capabilities::LISTEN, device.listen(1)),
                (Capabilities::SOCKET, device.socket(0x7fff, 0, 0).map(|_| ())),
                (Capabilities::OPEN, device.open("/", 0x7fff_0000, 0).map(|_| ())),
                (Capabilities::READDIR, device.readdir().map(|_| ())),
                (Capabilities::EPOLL_CREATE, device.epoll_create(0).map(|_| ())),
                (Capabilities::EPOLL_WAIT, device.epoll_wait(0, 0).map(|_| ())),
                (Capabilities::GETADDRINFO, device.getaddrinfo(None, None, None).map(|_| ())),
                (Capabilities::IOCTL, device.ioctl(0, 0).map(|_| ())),
                (Capabilities::MOUNT, device.unmount()),
            ];
            for (cap, ret) in checks {
                assert_eq!(
                    caps.contains(cap),
                    ret != Err(ENOTSUP),
                    "{kind:?} {caps:?} disagrees on {cap:?}: {ret:?}"
                );
            }
        }
    }

    #[test]
    fn kind_is_stable() {
        let volume = Arc::new(encfs::Volume::new(Arc::new(encfs::NullSealer)));
        let fs = Device::enclave_filesystem(volume);
        let file = fs.open("/f", libc::O_CREAT | libc::O_WRONLY, 0o600).unwrap();
        assert_eq!(fs.kind(), Kind::EnclaveFile);
        assert_eq!(file.kind(), Kind::EnclaveFile);
        assert_eq!(file.duplicate().kind(), Kind::EnclaveFile);
        file.close().unwrap();
        assert_eq!(file.kind(), Kind::EnclaveFile);
    }

    #[test]
    fn ready_state() {
        let host = Arc::new(Recorder::default());
        let stdout = Device::host_stdio(link(host), 1);
        assert_eq!(stdout.ready_state(), Ok(Events::empty()));
        stdout.notify(Events::OUT | Events::IN).unwrap();
        stdout.consume_ready(Events::IN);
        assert_eq!(stdout.ready_state(), Ok(Events::OUT));

        let resolver = Device::enclave_resolver(Default::default());
        assert_eq!(resolver.notify(Events::IN), Err(ENOTSUP));
        assert_eq!(resolver.ready_state(), Err(ENOTSUP));
    }
}
